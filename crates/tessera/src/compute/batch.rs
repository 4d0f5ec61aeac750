//! One-shot computation.

use std::sync::Arc;

use super::algorithm::{Algorithm, Input, ResultSet};
use super::executor::{check_inputs, check_supplied, input_rows, publish, ExecSettings};
use super::registry::KernelRegistry;
use crate::config::ComputeConfig;
use crate::error::Status;
use crate::table::TableHandle;

/// Batch executor: `compute(Input, Parameter) → Result`.
///
/// No intermediate state is retained between calls. Each `compute` clears
/// the previous result first, and a new result is published only when the
/// computation succeeds.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tessera::algorithms::moments::{InputId, Moments, ResultId};
/// use tessera::compute::Batch;
/// use tessera::table::Table;
///
/// let data = Table::dense(vec![1.0f64, 2.0, 3.0, 4.0], 2, 2).unwrap();
/// let mut batch = Batch::<Moments>::new();
/// batch.set_input(InputId::Data, Arc::new(data));
/// batch.compute().unwrap();
///
/// let mean = batch.result(ResultId::Mean).unwrap();
/// assert_eq!(mean.to_vec::<f64>().unwrap(), vec![2.0, 3.0]);
/// ```
#[derive(Debug)]
pub struct Batch<A: Algorithm> {
    settings: ExecSettings<A>,
    input: Input<A>,
    supplied: ResultSet<A>,
    result: Option<ResultSet<A>>,
}

impl<A: Algorithm> Default for Batch<A> {
    fn default() -> Self {
        Self {
            settings: ExecSettings::default(),
            input: Input::<A>::new(),
            supplied: ResultSet::<A>::new(),
            result: None,
        }
    }
}

impl<A: Algorithm> Batch<A> {
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

    /// Fill an input slot.
    pub fn set_input(&mut self, key: A::InputId, table: TableHandle) {
        self.input.set(key, table);
    }

    /// Current input.
    pub fn input(&self) -> &Input<A> {
        &self.input
    }

    /// Mutable input, for list slots.
    pub fn input_mut(&mut self) -> &mut Input<A> {
        &mut self.input
    }

    /// Replace the parameter.
    pub fn set_parameter(&mut self, parameter: A::Parameter) {
        self.settings.parameter = parameter;
    }

    /// Current parameter.
    pub fn parameter(&self) -> &A::Parameter {
        &self.settings.parameter
    }

    /// Write result `key` into a caller-owned table.
    ///
    /// The table must have the result's shape. It is written only when a
    /// computation succeeds.
    pub fn set_result(&mut self, key: A::ResultId, table: TableHandle) {
        self.supplied.set(key, table);
    }

    /// Run the computation.
    ///
    /// # Errors
    ///
    /// - `MissingInput`, `InvalidParameter`, `DimensionMismatch`: detected
    ///   before any kernel runs; the previous result stays in place.
    /// - `Unsupported`: no kernel for the configured method.
    /// - `Conversion`, `Allocation`, `UserCancelled`: raised by the kernel;
    ///   no result is published.
    pub fn compute(&mut self) -> Result<&ResultSet<A>, Status> {
        let param = &self.settings.parameter;
        check_inputs::<A>(&self.input, param)?;
        let partial = A::allocate_partial(&self.input, param)?;
        let staging = A::allocate_result(&partial, param)?;
        check_supplied(&self.supplied, &staging)?;

        // Past the preconditions: the previous result no longer applies.
        self.result = None;
        let input = &self.input;
        self.settings
            .run("batch", input_rows(input), |ctx, kernel| {
                kernel.run_batch(ctx, input, param, &partial, &staging)
            })?;

        let published = publish(&self.supplied, staging)?;
        Ok(self.result.insert(published))
    }

    /// Result of the last successful computation.
    pub fn result_set(&self) -> Option<&ResultSet<A>> {
        self.result.as_ref()
    }

    /// Result table `key` of the last successful computation.
    pub fn result(&self, key: A::ResultId) -> Option<TableHandle> {
        self.result.as_ref()?.get(key).cloned()
    }
}
