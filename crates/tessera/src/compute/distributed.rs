//! One step of a multi-node computation.
//!
//! The library does no networking. Each node runs a local step over its
//! shard and ships the resulting partial (see
//! [`Collection::snapshot`](super::Collection::snapshot)); the master adds
//! every node's partial, computes the merged partial, and either finalizes
//! it or broadcasts it to the next local step.
//!
//! ```text
//! node k:  Distributed::new(step1Local) ─ set_input ─ compute ──▶ Pₖ
//! master:  Distributed::new(step2Master) ─ add(P₁..Pₙ) ─ compute ─ finalize_compute ──▶ Result
//! ```

use std::sync::Arc;

use super::algorithm::{Algorithm, Input, PartialSet, ResultSet, Step, StepArgs};
use super::executor::{check_inputs, check_supplied, input_rows, publish, ExecSettings};
use super::registry::KernelRegistry;
use crate::config::ComputeConfig;
use crate::error::{ComputeError, Status};
use crate::table::TableHandle;

/// Distributed executor for a single protocol step.
#[derive(Debug)]
pub struct Distributed<A: Algorithm> {
    step: Step,
    settings: ExecSettings<A>,
    input: Input<A>,
    broadcast: Option<PartialSet<A>>,
    partials: Vec<PartialSet<A>>,
    expected_nodes: Option<usize>,
    supplied: ResultSet<A>,
    output: Option<PartialSet<A>>,
    result: Option<ResultSet<A>>,
}

impl<A: Algorithm> Distributed<A> {
    /// Executor for `step`.
    ///
    /// Whether the step exists depends on the parameter (some algorithms
    /// have a parameter-dependent number of rounds), so it is checked when
    /// the step runs.
    pub fn new(step: Step) -> Self {
        Self {
            step,
            settings: ExecSettings::default(),
            input: Input::<A>::new(),
            broadcast: None,
            partials: Vec::new(),
            expected_nodes: None,
            supplied: ResultSet::<A>::new(),
            output: None,
            result: None,
        }
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

    /// Reject `add` calls beyond `n` partials.
    pub fn with_expected_nodes(mut self, n: usize) -> Self {
        self.expected_nodes = Some(n);
        self
    }

    /// The step this executor runs.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Replace the parameter. Every node and the master must use the same.
    pub fn set_parameter(&mut self, parameter: A::Parameter) {
        self.settings.parameter = parameter;
    }

    /// Current parameter.
    pub fn parameter(&self) -> &A::Parameter {
        &self.settings.parameter
    }

    /// Fill an input slot of a local step.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a master step.
    pub fn set_input(&mut self, key: A::InputId, table: TableHandle) -> Result<(), Status> {
        if !self.step.is_local() {
            return Err(ComputeError::invalid_state(format!(
                "{} takes partial results, not input",
                self.step
            ))
            .into());
        }
        self.input.set(key, table);
        self.invalidate();
        Ok(())
    }

    /// Provide the previous master step's output.
    pub fn set_broadcast(&mut self, partial: PartialSet<A>) {
        self.broadcast = Some(partial);
        self.invalidate();
    }

    /// Add one node's partial on a master step. Order does not matter.
    ///
    /// # Errors
    ///
    /// - `InvalidState` on a local step or beyond the expected node count.
    /// - `Unsupported` if the step is not part of the protocol.
    pub fn add(&mut self, partial: PartialSet<A>) -> Result<(), Status> {
        self.check_step()?;
        if self.step.is_local() {
            return Err(ComputeError::invalid_state(format!(
                "{} does not accept partial results",
                self.step
            ))
            .into());
        }
        if let Some(n) = self.expected_nodes {
            if self.partials.len() >= n {
                return Err(ComputeError::invalid_state(format!(
                    "all {n} expected partial results were already added"
                ))
                .into());
            }
        }
        self.partials.push(partial);
        self.invalidate();
        Ok(())
    }

    /// Number of partials added so far.
    pub fn n_added(&self) -> usize {
        self.partials.len()
    }

    /// Write result `key` into a caller-owned table on finalization.
    pub fn set_result(&mut self, key: A::ResultId, table: TableHandle) {
        self.supplied.set(key, table);
        self.result = None;
    }

    /// Run the step and return its partial result.
    ///
    /// # Errors
    ///
    /// - `Unsupported` if the step is not part of the protocol.
    /// - Local steps: `MissingInput` and other input checks.
    /// - Master steps: `InvalidState` if nothing was added.
    ///
    /// A failed precondition leaves the previous output in place.
    pub fn compute(&mut self) -> Result<&PartialSet<A>, Status> {
        self.check_ready()?;
        self.invalidate();
        let output = self.run_step()?;
        Ok(self.output.insert(output))
    }

    /// Everything that can be rejected before a kernel runs.
    fn check_ready(&self) -> Result<(), ComputeError> {
        self.check_step()?;
        let param = &self.settings.parameter;
        if self.step.is_local() {
            check_inputs::<A>(&self.input, param)?;
            if let Some(broadcast) = &self.broadcast {
                A::check_partial(&self.input, broadcast, param)?;
            }
        } else if self.partials.is_empty() {
            return Err(ComputeError::invalid_state(format!(
                "{} computed before any partial result was added",
                self.step
            )));
        }
        Ok(())
    }

    fn run_step(&self) -> Result<PartialSet<A>, Status> {
        let param = &self.settings.parameter;
        let input = self.step.is_local().then_some(&self.input);

        let mode = self.step.to_string();
        let step = self.step;
        let broadcast = self.broadcast.as_ref();
        let partials = &self.partials[..];
        self.settings
            .run(&mode, input_rows(&self.input), |ctx, kernel| {
                kernel.step(
                    ctx,
                    step,
                    StepArgs {
                        input,
                        broadcast,
                        partials,
                        param,
                    },
                )
            })
    }

    /// Turn the merged partial of the final master step into a result.
    ///
    /// Runs [`compute`](Self::compute) first if partials were added but not
    /// yet merged. A second call returns the cached result.
    ///
    /// # Errors
    ///
    /// `InvalidState` on any step but the protocol's final master step, or
    /// when nothing was added or computed.
    pub fn finalize_compute(&mut self) -> Result<&ResultSet<A>, Status> {
        let final_step = A::protocol(&self.settings.parameter).final_step();
        if self.step != final_step {
            return Err(ComputeError::invalid_state(format!(
                "finalize_compute is only valid on {final_step} of {}, not {}",
                A::NAME,
                self.step
            ))
            .into());
        }
        if self.output.is_none() {
            if self.partials.is_empty() {
                return Err(ComputeError::invalid_state(
                    "finalize_compute called before any partial result was added",
                )
                .into());
            }
            self.compute()?;
        }

        let result = match self.result.take() {
            Some(cached) => cached,
            None => self.finalize_output()?,
        };
        Ok(self.result.insert(result))
    }

    fn finalize_output(&self) -> Result<ResultSet<A>, Status> {
        let partial = self
            .output
            .as_ref()
            .ok_or_else(|| ComputeError::invalid_state("no merged partial result"))?;
        let param = &self.settings.parameter;
        let staging = A::allocate_result(partial, param)?;
        check_supplied(&self.supplied, &staging)?;
        self.settings.run("finalize", 0, |ctx, kernel| {
            kernel.finalize(ctx, param, partial, &staging)
        })?;
        publish(&self.supplied, staging)
    }

    /// Output of the last successful [`compute`](Self::compute).
    pub fn partial_result(&self) -> Option<&PartialSet<A>> {
        self.output.as_ref()
    }

    /// Take ownership of the last output, e.g. to ship it to another node.
    pub fn take_partial_result(&mut self) -> Option<PartialSet<A>> {
        self.result = None;
        self.output.take()
    }

    /// Cached result table `key`.
    pub fn result(&self, key: A::ResultId) -> Option<TableHandle> {
        self.result.as_ref()?.get(key).cloned()
    }

    fn check_step(&self) -> Result<(), ComputeError> {
        if A::protocol(&self.settings.parameter).contains(self.step) {
            Ok(())
        } else {
            Err(ComputeError::unsupported(format!(
                "{} has no {}",
                A::NAME,
                self.step
            )))
        }
    }

    fn invalidate(&mut self) {
        self.output = None;
        self.result = None;
    }
}
