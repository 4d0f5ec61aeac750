//! Incremental computation over a stream of input chunks.

use std::sync::Arc;

use super::algorithm::{Algorithm, Input, PartialSet, ResultSet};
use super::executor::{check_inputs, check_supplied, input_rows, publish, ExecSettings};
use super::registry::KernelRegistry;
use crate::config::ComputeConfig;
use crate::error::{ComputeError, Status};
use crate::table::TableHandle;

/// Lifecycle of an [`Online`] executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No chunk accumulated yet.
    Ready,
    /// At least one chunk accumulated; no current result.
    Computed,
    /// A result is cached for the accumulated chunks.
    Finalized,
}

/// Online executor: repeated `compute` on chunks, then `finalize_compute`.
///
/// Each `compute` folds the current input into an internal partial result.
/// The fold is transactional: it runs on a copy that replaces the
/// accumulator only on success, so a failed chunk leaves earlier chunks
/// intact. `finalize_compute` derives the result and caches it until the
/// next `compute`.
#[derive(Debug)]
pub struct Online<A: Algorithm> {
    settings: ExecSettings<A>,
    input: Input<A>,
    supplied: ResultSet<A>,
    partial: Option<PartialSet<A>>,
    result: Option<ResultSet<A>>,
}

impl<A: Algorithm> Default for Online<A> {
    fn default() -> Self {
        Self {
            settings: ExecSettings::default(),
            input: Input::<A>::new(),
            supplied: ResultSet::<A>::new(),
            partial: None,
            result: None,
        }
    }
}

impl<A: Algorithm> Online<A> {
    /// Executor with the default method, parameter, and config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific method.
    pub fn with_method(mut self, method: A::Method) -> Self {
        self.settings.method = method;
        self
    }

    /// Use a specific execution config.
    pub fn with_config(mut self, config: ComputeConfig) -> Self {
        self.settings.config = config;
        self
    }

    /// Resolve kernels from `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<KernelRegistry>) -> Self {
        self.settings.registry = Some(registry);
        self
    }

    /// Fill an input slot for the next chunk.
    pub fn set_input(&mut self, key: A::InputId, table: TableHandle) {
        self.input.set(key, table);
    }

    /// Replace the parameter.
    pub fn set_parameter(&mut self, parameter: A::Parameter) {
        self.settings.parameter = parameter;
    }

    /// Current parameter.
    pub fn parameter(&self) -> &A::Parameter {
        &self.settings.parameter
    }

    /// Write result `key` into a caller-owned table on finalization.
    pub fn set_result(&mut self, key: A::ResultId, table: TableHandle) {
        self.supplied.set(key, table);
        self.result = None;
    }

    /// Current state.
    pub fn state(&self) -> OnlineState {
        match (&self.partial, &self.result) {
            (None, _) => OnlineState::Ready,
            (Some(_), None) => OnlineState::Computed,
            (Some(_), Some(_)) => OnlineState::Finalized,
        }
    }

    /// Fold the current input into the accumulator.
    ///
    /// Invalidates a cached result.
    pub fn compute(&mut self) -> Result<(), Status> {
        if !A::SUPPORTS_ONLINE {
            return Err(ComputeError::unsupported(format!(
                "{} has no online mode",
                A::NAME
            ))
            .into());
        }

        let param = &self.settings.parameter;
        check_inputs::<A>(&self.input, param)?;
        let staging = match &self.partial {
            Some(partial) => {
                A::check_partial(&self.input, partial, param)?;
                partial.deep_copy()?
            }
            None => A::allocate_partial(&self.input, param)?,
        };

        let input = &self.input;
        self.settings
            .run("online", input_rows(input), |ctx, kernel| {
                kernel.accumulate(ctx, input, param, &staging)
            })?;

        self.partial = Some(staging);
        self.result = None;
        Ok(())
    }

    /// Derive the result from every chunk accumulated so far.
    ///
    /// A second call without an intervening `compute` returns the cached
    /// result.
    ///
    /// # Errors
    ///
    /// `InvalidState` if no chunk has been accumulated.
    pub fn finalize_compute(&mut self) -> Result<&ResultSet<A>, Status> {
        let result = match self.result.take() {
            Some(cached) => cached,
            None => self.finalize_partial()?,
        };
        Ok(self.result.insert(result))
    }

    fn finalize_partial(&self) -> Result<ResultSet<A>, Status> {
        let partial = self.partial.as_ref().ok_or_else(|| {
            ComputeError::invalid_state("finalize_compute called before any compute")
        })?;

        let param = &self.settings.parameter;
        let staging = A::allocate_result(partial, param)?;
        check_supplied(&self.supplied, &staging)?;
        self.settings.run("online finalize", 0, |ctx, kernel| {
            kernel.finalize(ctx, param, partial, &staging)
        })?;

        publish(&self.supplied, staging)
    }

    /// The accumulator, if any chunk was computed.
    pub fn partial_result(&self) -> Option<&PartialSet<A>> {
        self.partial.as_ref()
    }

    /// Cached result table `key`.
    pub fn result(&self, key: A::ResultId) -> Option<TableHandle> {
        self.result.as_ref()?.get(key).cloned()
    }

    /// Drop the accumulator and cached result.
    pub fn reset(&mut self) {
        self.partial = None;
        self.result = None;
    }
}
