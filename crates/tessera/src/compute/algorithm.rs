//! Algorithm and kernel traits.
//!
//! An [`Algorithm`] is a zero-sized type describing one analytics routine:
//! the slots of its input, partial-result and result collections, how those
//! are sized, and its distributed [`Protocol`]. The numeric work is done by
//! [`Kernel`]s, registered per method and CPU tier in a
//! [`KernelRegistry`](super::KernelRegistry).
//!
//! # Data flow
//!
//! ```text
//! Input ──accumulate──▶ PartialSet ──merge──▶ PartialSet ──finalize──▶ ResultSet
//!   (step1Local)                     (step2Master)          (finalize_compute)
//! ```
//!
//! Batch and online modes run the same three operations in-process, so all
//! modes share one kernel implementation per tier.

use std::fmt;
use std::hash::Hash;

use super::collection::{Collection, Key};
use super::context::KernelContext;
use super::registry::KernelRegistry;
use crate::error::ComputeError;

/// Input collection of an algorithm.
pub type Input<A> = Collection<<A as Algorithm>::InputId>;
/// Partial-result collection of an algorithm.
pub type PartialSet<A> = Collection<<A as Algorithm>::PartialId>;
/// Result collection of an algorithm.
pub type ResultSet<A> = Collection<<A as Algorithm>::ResultId>;

/// Computation method selector (e.g. default vs. single-pass).
pub trait Method: Copy + Eq + Hash + fmt::Debug + Default + Send + Sync + 'static {
    /// Stable name, part of the kernel registry key.
    fn name(self) -> &'static str;
}

// =============================================================================
// Protocol
// =============================================================================

/// Where a distributed step runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepRole {
    /// On each node, over that node's input shard.
    Local,
    /// On the master, over the partials added by the nodes.
    Master,
}

/// A numbered step of a distributed protocol (`step1Local`, `step2Master`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Step {
    pub index: u32,
    pub role: StepRole,
}

impl Step {
    pub const STEP1_LOCAL: Step = Step::local(1);
    pub const STEP2_MASTER: Step = Step::master(2);

    /// Local step `index`.
    pub const fn local(index: u32) -> Self {
        Self {
            index,
            role: StepRole::Local,
        }
    }

    /// Master step `index`.
    pub const fn master(index: u32) -> Self {
        Self {
            index,
            role: StepRole::Master,
        }
    }

    /// Whether this step runs on the nodes.
    pub fn is_local(self) -> bool {
        self.role == StepRole::Local
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            StepRole::Local => "Local",
            StepRole::Master => "Master",
        };
        write!(f, "step{}{role}", self.index)
    }
}

/// Ordered steps of a distributed computation.
///
/// Steps alternate between local and master roles. The last step is a master
/// step; only there may `finalize_compute` be called.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Protocol {
    steps: Vec<Step>,
}

impl Protocol {
    /// `[step1Local, step2Master]`.
    pub fn two_step() -> Self {
        Self {
            steps: vec![Step::STEP1_LOCAL, Step::STEP2_MASTER],
        }
    }

    /// `rounds` local/master pairs numbered from 1.
    pub fn rounds(rounds: u32) -> Self {
        let steps = (0..rounds.max(1))
            .flat_map(|r| [Step::local(2 * r + 1), Step::master(2 * r + 2)])
            .collect();
        Self { steps }
    }

    /// All steps in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Whether `step` belongs to this protocol.
    pub fn contains(&self, step: Step) -> bool {
        self.steps.contains(&step)
    }

    /// The last step (always a master step).
    pub fn final_step(&self) -> Step {
        self.steps.last().copied().unwrap_or(Step::STEP2_MASTER)
    }
}

// =============================================================================
// Algorithm
// =============================================================================

/// Static description of an analytics routine.
pub trait Algorithm: Sized + Send + Sync + 'static {
    /// Name used in logs and error messages.
    const NAME: &'static str;

    /// Whether online (incremental) mode is available.
    const SUPPORTS_ONLINE: bool = true;

    type Method: Method;
    type Parameter: Clone + fmt::Debug + Default + Send + Sync;
    type InputId: Key;
    type PartialId: Key;
    type ResultId: Key;

    /// Input slots that must be filled before computing.
    fn required_inputs() -> &'static [Self::InputId] {
        Self::InputId::all()
    }

    /// Validate the parameter.
    fn check_parameter(_param: &Self::Parameter) -> Result<(), ComputeError> {
        Ok(())
    }

    /// Validate a filled input against the parameter (shapes, types).
    fn check_input(_input: &Input<Self>, _param: &Self::Parameter) -> Result<(), ComputeError> {
        Ok(())
    }

    /// Validate an input chunk against an existing partial (online mode,
    /// later local steps).
    fn check_partial(
        _input: &Input<Self>,
        _partial: &PartialSet<Self>,
        _param: &Self::Parameter,
    ) -> Result<(), ComputeError> {
        Ok(())
    }

    /// Allocate an empty (zero-observation) partial sized for `input`.
    fn allocate_partial(
        input: &Input<Self>,
        param: &Self::Parameter,
    ) -> Result<PartialSet<Self>, ComputeError>;

    /// Allocate result tables sized for `partial`.
    fn allocate_result(
        partial: &PartialSet<Self>,
        param: &Self::Parameter,
    ) -> Result<ResultSet<Self>, ComputeError>;

    /// Distributed steps.
    fn protocol(_param: &Self::Parameter) -> Protocol {
        Protocol::two_step()
    }

    /// Register every kernel of this algorithm.
    fn register_kernels(registry: &mut KernelRegistry);
}

// =============================================================================
// Kernel
// =============================================================================

/// Arguments of one distributed step.
pub struct StepArgs<'a, A: Algorithm> {
    /// Input shard (local steps).
    pub input: Option<&'a Input<A>>,
    /// Output of the previous master step, when there is one.
    pub broadcast: Option<&'a PartialSet<A>>,
    /// Partials added on a master step.
    pub partials: &'a [PartialSet<A>],
    pub param: &'a A::Parameter,
}

impl<A: Algorithm> StepArgs<'_, A> {
    /// The input, or `InvalidState` on a master step.
    pub fn input(&self) -> Result<&Input<A>, ComputeError> {
        self.input
            .ok_or_else(|| ComputeError::invalid_state("step has no input"))
    }

    /// The broadcast partial, or `InvalidState` if none was set.
    pub fn broadcast(&self) -> Result<&PartialSet<A>, ComputeError> {
        self.broadcast
            .ok_or_else(|| ComputeError::invalid_state("step needs a broadcast partial result"))
    }
}

/// Numeric implementation of an algorithm for one method and CPU tier.
///
/// Kernels are stateless; all state lives in the collections passed in.
/// Implementations poll [`KernelContext::check_cancelled`] between row
/// blocks.
pub trait Kernel<A: Algorithm>: Send + Sync {
    /// Fold `input` into `partial`.
    fn accumulate(
        &self,
        ctx: &KernelContext,
        input: &Input<A>,
        param: &A::Parameter,
        partial: &PartialSet<A>,
    ) -> Result<(), ComputeError>;

    /// Fold `other` into `into`. Must be associative and commutative, and a
    /// zero-observation `other` must leave `into` unchanged.
    fn merge(
        &self,
        ctx: &KernelContext,
        param: &A::Parameter,
        into: &PartialSet<A>,
        other: &PartialSet<A>,
    ) -> Result<(), ComputeError>;

    /// Derive the result from a fully merged partial.
    fn finalize(
        &self,
        ctx: &KernelContext,
        param: &A::Parameter,
        partial: &PartialSet<A>,
        result: &ResultSet<A>,
    ) -> Result<(), ComputeError>;

    /// One-shot computation over `input` into `result`.
    ///
    /// `partial` is freshly allocated for `input`.
    fn run_batch(
        &self,
        ctx: &KernelContext,
        input: &Input<A>,
        param: &A::Parameter,
        partial: &PartialSet<A>,
        result: &ResultSet<A>,
    ) -> Result<(), ComputeError> {
        self.accumulate(ctx, input, param, partial)?;
        self.finalize(ctx, param, partial, result)
    }

    /// Run one distributed step. The default covers the two-step protocol.
    fn step(
        &self,
        ctx: &KernelContext,
        step: Step,
        args: StepArgs<'_, A>,
    ) -> Result<PartialSet<A>, ComputeError> {
        match step {
            Step::STEP1_LOCAL => {
                let input = args.input()?;
                let partial = A::allocate_partial(input, args.param)?;
                self.accumulate(ctx, input, args.param, &partial)?;
                Ok(partial)
            }
            Step::STEP2_MASTER => fold_partials::<A, Self>(self, ctx, args.param, args.partials),
            _ => Err(ComputeError::unsupported(format!(
                "{} has no {step}",
                A::NAME
            ))),
        }
    }
}

/// Master fold: `deep_copy(p₁) ⊕ p₂ ⊕ … ⊕ pₙ`. Inputs are not mutated.
pub fn fold_partials<A: Algorithm, K: Kernel<A> + ?Sized>(
    kernel: &K,
    ctx: &KernelContext,
    param: &A::Parameter,
    partials: &[PartialSet<A>],
) -> Result<PartialSet<A>, ComputeError> {
    let (first, rest) = partials
        .split_first()
        .ok_or_else(|| ComputeError::invalid_state("no partial results were added"))?;
    let acc = first.deep_copy()?;
    for other in rest {
        ctx.check_cancelled()?;
        kernel.merge(ctx, param, &acc, other)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names() {
        assert_eq!(Step::STEP1_LOCAL.to_string(), "step1Local");
        assert_eq!(Step::master(4).to_string(), "step4Master");
        assert!(Step::local(3).is_local());
    }

    #[test]
    fn protocol_rounds() {
        let p = Protocol::rounds(2);
        assert_eq!(
            p.steps(),
            &[Step::local(1), Step::master(2), Step::local(3), Step::master(4)]
        );
        assert_eq!(p.final_step(), Step::master(4));
        assert_eq!(Protocol::rounds(1), Protocol::two_step());
        assert!(!p.contains(Step::master(3)));
    }
}
