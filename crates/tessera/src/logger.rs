//! Per-computation progress reporting.
//!
//! [`ComputeLogger`] emits a short summary for each executor call through the
//! `log` facade, gated by a [`Verbosity`] level. Library internals log
//! directly with `log::debug!`/`log::trace!` regardless of verbosity; the
//! host application's logger decides what is shown.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::compute::CpuTier;

/// How much an executor reports about each computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Verbosity {
    /// Nothing.
    #[default]
    Silent,
    /// Failures only.
    Warning,
    /// One line per computation.
    Info,
    /// Throughput detail.
    Debug,
}

/// Summary logger for one executor call.
#[derive(Debug)]
pub struct ComputeLogger {
    verbosity: Verbosity,
    started: Option<Instant>,
    label: String,
}

impl ComputeLogger {
    /// Logger at the given level.
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            started: None,
            label: String::new(),
        }
    }

    /// Current level.
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Record the start of a computation.
    pub fn start(&mut self, mode: &str, algorithm: &str, tier: CpuTier) {
        self.started = Some(Instant::now());
        self.label = format!("{algorithm} [{mode}]");
        if self.verbosity >= Verbosity::Info {
            log::info!("{}: starting on {tier} kernels", self.label);
        }
    }

    /// Report a successful computation.
    pub fn finish(&self, n_rows: usize) {
        if self.verbosity >= Verbosity::Info {
            let elapsed = self.started.map(|t| t.elapsed()).unwrap_or_default();
            log::info!(
                "{}: {n_rows} rows in {:.3}s",
                self.label,
                elapsed.as_secs_f64()
            );
            if self.verbosity >= Verbosity::Debug && n_rows > 0 {
                let rate = n_rows as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
                log::debug!("{}: {rate:.0} rows/s", self.label);
            }
        }
    }

    /// Report a failed computation.
    pub fn fail(&self, status: &crate::error::Status) {
        if self.verbosity >= Verbosity::Warning {
            log::warn!("{}: failed: {status}", self.label);
        }
    }
}
