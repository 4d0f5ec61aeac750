//! Execution model: algorithms, kernels, dispatch, and the three modes.
//!
//! # Overview
//!
//! - [`Algorithm`] / [`Kernel`]: what an analytics routine is and how its
//!   numeric work is done per CPU tier.
//! - [`Collection`]: keyed input, partial-result, and result tables.
//! - [`KernelRegistry`] + [`cpu`]: `(algorithm, method, tier) → kernel`
//!   resolution with fallback to narrower tiers.
//! - [`Batch`], [`Online`], [`Distributed`]: the execution modes. All
//!   return [`Status`](crate::Status) on failure and publish results only
//!   on success.

mod algorithm;
mod batch;
mod collection;
mod context;
pub mod cpu;
mod distributed;
mod executor;
mod online;
pub mod registry;

pub use algorithm::{
    fold_partials, Algorithm, Input, Kernel, Method, PartialSet, Protocol, ResultSet, Step,
    StepArgs, StepRole,
};
pub use batch::Batch;
pub use collection::{
    Collection, CollectionSnapshot, Entry, EntrySnapshot, Key, Origin, SnapshotValues,
    TableSnapshot,
};
pub use context::{CancellationToken, KernelContext};
pub use cpu::CpuTier;
pub use distributed::Distributed;
pub use online::{Online, OnlineState};
pub use registry::{KernelHandle, KernelRegistry};
