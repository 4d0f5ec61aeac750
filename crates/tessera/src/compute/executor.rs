//! Plumbing shared by the batch, online, and distributed executors.

use std::sync::Arc;

use super::algorithm::{Algorithm, Kernel};
use super::collection::{Collection, Key};
use super::context::KernelContext;
use super::cpu::effective_tier;
use super::registry::{resolve_in, KernelRegistry};
use crate::config::ComputeConfig;
use crate::error::{ComputeError, Status};
use crate::logger::ComputeLogger;
use crate::utils::run_with_threads;

/// Settings every executor carries.
#[derive(Debug)]
pub(crate) struct ExecSettings<A: Algorithm> {
    pub method: A::Method,
    pub parameter: A::Parameter,
    pub config: ComputeConfig,
    pub registry: Option<Arc<KernelRegistry>>,
}

impl<A: Algorithm> Default for ExecSettings<A> {
    fn default() -> Self {
        Self {
            method: A::Method::default(),
            parameter: A::Parameter::default(),
            config: ComputeConfig::default(),
            registry: None,
        }
    }
}

impl<A: Algorithm> ExecSettings<A> {
    /// Resolve the kernel and run `f` inside the configured thread pool.
    pub fn run<R: Send>(
        &self,
        mode: &str,
        n_rows: usize,
        f: impl FnOnce(&KernelContext, &dyn Kernel<A>) -> Result<R, ComputeError> + Send,
    ) -> Result<R, Status> {
        let tier = effective_tier(self.config.max_tier);
        let (resolved, kernel) = resolve_in::<A>(self.registry.as_deref(), self.method, tier)?;

        let mut logger = ComputeLogger::new(self.config.verbosity);
        logger.start(mode, A::NAME, resolved);

        let config = &self.config;
        let outcome = run_with_threads(config.n_threads, |parallelism| {
            let ctx = KernelContext::from_config(config, resolved, parallelism);
            ctx.check_cancelled()?;
            f(&ctx, kernel.as_ref())
        });

        match outcome {
            Ok(value) => {
                logger.finish(n_rows);
                Ok(value)
            }
            Err(e) => {
                let status = Status::new(e);
                logger.fail(&status);
                Err(status)
            }
        }
    }
}

/// Validate the parameter and required inputs before any kernel runs.
pub(crate) fn check_inputs<A: Algorithm>(
    input: &Collection<A::InputId>,
    param: &A::Parameter,
) -> Result<(), ComputeError> {
    A::check_parameter(param)?;
    if let Some(key) = input.first_missing(A::required_inputs()) {
        return Err(ComputeError::MissingInput { key: key.name() });
    }
    A::check_input(input, param)
}

/// Largest row count among single-table slots.
pub(crate) fn input_rows<K: Key>(input: &Collection<K>) -> usize {
    input
        .keys()
        .into_iter()
        .filter_map(|k| input.get(k).map(|t| t.n_rows()))
        .max()
        .unwrap_or(0)
}

/// Caller-supplied output tables must match the staging tables' shapes.
///
/// Every mismatching table is reported, not just the first.
pub(crate) fn check_supplied<K: Key>(
    supplied: &Collection<K>,
    staging: &Collection<K>,
) -> Result<(), Status> {
    let mut errors = Vec::new();
    for key in supplied.keys() {
        let (Some(dest), Some(stage)) = (supplied.get(key), staging.get(key)) else {
            errors.push(ComputeError::invalid_argument(format!(
                "`{}` is not a table output of this algorithm",
                key.name()
            )));
            continue;
        };
        if dest.shape() != stage.shape() {
            let (expected, actual) = if dest.n_rows() != stage.n_rows() {
                (stage.n_rows(), dest.n_rows())
            } else {
                (stage.n_cols(), dest.n_cols())
            };
            errors.push(ComputeError::dimension_mismatch(key.name(), expected, actual));
        }
    }
    Status::from_errors(errors).map_or(Ok(()), Err)
}

/// Copy staging values into caller-supplied tables and return the
/// collection to publish.
///
/// All caller tables are written or none is: values are converted into
/// each destination's representation first, and every conversion failure is
/// reported together.
pub(crate) fn publish<K: Key>(
    supplied: &Collection<K>,
    mut staging: Collection<K>,
) -> Result<Collection<K>, Status> {
    let mut converted = Vec::new();
    let mut errors = Vec::new();
    for key in supplied.keys() {
        if let (Some(dest), Some(stage)) = (supplied.get(key), staging.get(key)) {
            match dest.converted(stage) {
                Ok(table) => converted.push((key, Arc::clone(dest), table)),
                Err(e) => errors.push(e),
            }
        }
    }
    if let Some(status) = Status::from_errors(errors) {
        return Err(status);
    }

    let mut claims = Vec::with_capacity(converted.len());
    for (_, dest, _) in &converted {
        match dest.claim() {
            Ok(token) => claims.push(token),
            Err(e) => {
                for ((_, dest, _), token) in converted.iter().zip(claims) {
                    dest.regions().release(token);
                }
                return Err(e.into());
            }
        }
    }
    for ((key, dest, table), token) in converted.into_iter().zip(claims) {
        dest.replace_storage(table);
        dest.regions().release(token);
        staging.set(key, dest);
    }
    Ok(staging)
}
