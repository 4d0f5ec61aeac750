//! tessera: tabular storage and batch/online/distributed execution for
//! analytics kernels.
//!
//! Algorithms read and write [`table::Table`]s through block views that hide
//! the physical layout, and run in one of three execution modes that share a
//! single kernel per CPU tier.
//!
//! # Key Types
//!
//! - [`table::Table`] / [`table::BlockDescriptor`] - Typed tables and scoped block access
//! - [`compute::Batch`] / [`compute::Online`] / [`compute::Distributed`] - Execution modes
//! - [`compute::Algorithm`] / [`compute::Kernel`] - Extension points for new algorithms
//! - [`ComputeConfig`] - Threading, chunking, tier cap, cancellation, logging
//! - [`Status`] / [`ComputeError`] - Failure reporting
//!
//! # Example
//!
//! ```
//! use tessera::algorithms::moments::{InputId, Moments, ResultId};
//! use tessera::compute::Batch;
//! use tessera::testing::dense_table;
//!
//! let data = dense_table(&[1.0, 10.0, 3.0, 30.0], 2, 2);
//! let mut batch = Batch::<Moments>::new();
//! batch.set_input(InputId::Data, data);
//! batch.compute().unwrap();
//!
//! let mean = batch.result(ResultId::Mean).unwrap();
//! assert_eq!(mean.to_vec::<f64>().unwrap(), vec![2.0, 20.0]);
//! ```
//!
//! # Distributed Mode
//!
//! See [`compute::Distributed`]. Partial results are exchanged by the caller
//! as [`compute::CollectionSnapshot`]s in a wire format of its choosing.

// Re-export approx traits for users who want to compare results
pub use approx;

pub mod algorithms;
pub mod compute;
pub mod config;
pub mod error;
pub mod logger;
pub mod table;
pub mod testing;
pub mod utils;

// =============================================================================
// Convenience Re-exports
// =============================================================================

pub use compute::CpuTier;
pub use config::{ComputeConfig, ConfigError};
pub use error::{ComputeError, Status};
pub use logger::{ComputeLogger, Verbosity};
pub use table::{create_dense_table, create_sparse_table, Table, TableHandle};
pub use utils::{run_with_threads, Parallelism};
