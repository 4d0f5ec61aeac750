//! Per-computation execution settings with builder pattern.
//!
//! [`ComputeConfig`] controls how an executor runs its kernels: threading,
//! row chunk size, instruction-set cap, cancellation, and logging. It uses
//! the `bon` crate for builder generation with validation at build time.
//!
//! # Example
//!
//! ```
//! use tessera::{ComputeConfig, CpuTier, Verbosity};
//!
//! // All defaults
//! let config = ComputeConfig::builder().build().unwrap();
//!
//! let config = ComputeConfig::builder()
//!     .n_threads(4)
//!     .block_rows(1024)
//!     .max_tier(CpuTier::Baseline)
//!     .verbosity(Verbosity::Info)
//!     .build()
//!     .unwrap();
//! ```

use bon::Builder;

use crate::compute::{CancellationToken, CpuTier};
use crate::logger::Verbosity;

// =============================================================================
// ConfigError
// =============================================================================

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Row chunk size must be at least 1.
    #[error("block_rows must be at least 1")]
    InvalidBlockRows,
}

// =============================================================================
// ComputeConfig
// =============================================================================

/// Execution settings shared by the batch, online, and distributed executors.
#[derive(Debug, Clone, Builder)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
pub struct ComputeConfig {
    // === Resource control ===
    /// Number of threads. `0` uses the ambient rayon pool, `1` runs
    /// sequentially. Default: 0.
    #[builder(default)]
    pub n_threads: usize,

    /// Rows per block handed to kernels. Default: 4096.
    #[builder(default = 4096)]
    pub block_rows: usize,

    /// Upper bound on the kernel tier. `None` uses the process-wide
    /// selection.
    pub max_tier: Option<CpuTier>,

    // === Control ===
    /// Polled by kernels between blocks.
    pub cancellation: Option<CancellationToken>,

    // === Logging ===
    /// Verbosity level. Default: `Silent`.
    #[builder(default)]
    pub verbosity: Verbosity,
}

impl<S: compute_config_builder::IsComplete> ComputeConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBlockRows`] if `block_rows == 0`.
    pub fn build(self) -> Result<ComputeConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl ComputeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.block_rows == 0 {
            return Err(ConfigError::InvalidBlockRows);
        }
        Ok(())
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ComputeConfig::builder().build().unwrap();
        assert_eq!(config.n_threads, 0);
        assert_eq!(config.block_rows, 4096);
        assert_eq!(config.max_tier, None);
        assert_eq!(config.verbosity, Verbosity::Silent);
        assert!(config.cancellation.is_none());
    }

    #[test]
    fn test_invalid_block_rows_zero() {
        let result = ComputeConfig::builder().block_rows(0).build();
        assert!(matches!(result, Err(ConfigError::InvalidBlockRows)));
    }

    #[test]
    fn test_builder_sets_fields() {
        let token = CancellationToken::new();
        let config = ComputeConfig::builder()
            .n_threads(1)
            .block_rows(7)
            .max_tier(CpuTier::Sse42)
            .cancellation(token.clone())
            .build()
            .unwrap();
        assert_eq!(config.block_rows, 7);
        assert_eq!(config.max_tier, Some(CpuTier::Sse42));
        token.cancel();
        assert!(config.cancellation.unwrap().is_cancelled());
    }
}
