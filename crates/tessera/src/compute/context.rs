//! Execution context handed to every kernel call.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::cpu::CpuTier;
use crate::config::ComputeConfig;
use crate::error::ComputeError;
use crate::utils::{row_chunks, Parallelism};

/// Shared flag a caller sets to stop a running computation.
///
/// Kernels poll it between row blocks; a set flag makes the computation
/// fail with [`ComputeError::UserCancelled`]. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a kernel may use while it runs.
#[derive(Clone, Debug)]
pub struct KernelContext {
    tier: CpuTier,
    parallelism: Parallelism,
    block_rows: usize,
    cancellation: Option<CancellationToken>,
}

impl KernelContext {
    /// Sequential context at `tier` with the default block size.
    pub fn new(tier: CpuTier) -> Self {
        Self {
            tier,
            parallelism: Parallelism::Sequential,
            block_rows: ComputeConfig::default().block_rows,
            cancellation: None,
        }
    }

    pub(crate) fn from_config(config: &ComputeConfig, tier: CpuTier, parallelism: Parallelism) -> Self {
        Self {
            tier,
            parallelism,
            block_rows: config.block_rows,
            cancellation: config.cancellation.clone(),
        }
    }

    /// Allow or forbid parallel row blocks.
    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Rows per block (at least 1).
    pub fn with_block_rows(mut self, block_rows: usize) -> Self {
        self.block_rows = block_rows.max(1);
        self
    }

    /// Poll `token` between blocks.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Tier the running kernel was resolved for.
    #[inline]
    pub fn tier(&self) -> CpuTier {
        self.tier
    }

    /// Whether row blocks may be processed in parallel.
    #[inline]
    pub fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    /// Rows per block.
    #[inline]
    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    /// Fail with [`ComputeError::UserCancelled`] if cancellation was requested.
    #[inline]
    pub fn check_cancelled(&self) -> Result<(), ComputeError> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => Err(ComputeError::UserCancelled),
            _ => Ok(()),
        }
    }

    /// Row ranges of at most [`block_rows`](Self::block_rows) rows covering `0..n_rows`.
    pub fn row_blocks(&self, n_rows: usize) -> Vec<Range<usize>> {
        row_chunks(n_rows, self.block_rows)
    }
}
