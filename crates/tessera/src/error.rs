//! Error codes and the composite status returned by the execution layer.
//!
//! [`ComputeError`] is a single error code with its description. Everything
//! below the executors (tables, blocks, kernels) returns
//! `Result<_, ComputeError>`.
//!
//! [`Status`] is what the executors ([`Batch`](crate::compute::Batch),
//! [`Online`](crate::compute::Online), [`Distributed`](crate::compute::Distributed))
//! hand back to callers: one or more error codes collected while running a
//! computation. Checks over independent tables report every problem at once:
//! each caller-supplied output with the wrong shape, and each output whose
//! values cannot be converted into the caller's types.

use crate::table::DataType;

/// A single error code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    /// Memory could not be reserved for a table, result, or partial result.
    #[error("allocation of {requested} elements failed")]
    Allocation { requested: usize },

    /// A stored value cannot be represented in the requested type.
    #[error("cannot convert {from} value at row {row}, column {col} to {to}: {reason}")]
    Conversion {
        from: DataType,
        to: DataType,
        row: usize,
        col: usize,
        reason: &'static str,
    },

    /// A required input key was not set before computing.
    #[error("required input `{key}` is not set")]
    MissingInput { key: &'static str },

    /// An executor method was called out of sequence.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Tables supplied to a computation have incompatible shapes.
    #[error("dimension mismatch for `{what}`: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// The caller's cancellation token was observed mid-kernel.
    #[error("computation cancelled by the caller")]
    UserCancelled,

    /// A block overlaps a region already held by a conflicting descriptor.
    #[error("rows {rows:?}, columns {cols:?} are locked by another block")]
    BlockConflict {
        rows: std::ops::Range<usize>,
        cols: std::ops::Range<usize>,
    },

    /// The operation is not available for this layout, algorithm, or mode.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An argument violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An algorithm parameter is out of range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl ComputeError {
    /// Shorthand for [`ComputeError::InvalidState`].
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Shorthand for [`ComputeError::Unsupported`].
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Shorthand for [`ComputeError::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Shorthand for [`ComputeError::DimensionMismatch`].
    pub fn dimension_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Whether this error was detected before any kernel ran.
    ///
    /// Such errors leave all executor state untouched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MissingInput { .. }
                | Self::DimensionMismatch { .. }
                | Self::InvalidParameter { .. }
                | Self::InvalidState(_)
        )
    }
}

// =============================================================================
// Status
// =============================================================================

/// Composite status: one or more [`ComputeError`]s.
///
/// A `Status` is never empty. Success is expressed as `Ok(_)` on the
/// surrounding `Result`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", join_messages(.errors))]
pub struct Status {
    errors: Vec<ComputeError>,
}

fn join_messages(errors: &[ComputeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Status {
    /// Create a status holding a single error.
    pub fn new(error: ComputeError) -> Self {
        Self {
            errors: vec![error],
        }
    }

    /// Append another error.
    pub fn push(&mut self, error: ComputeError) {
        self.errors.push(error);
    }

    /// All collected errors, in the order they were observed.
    pub fn errors(&self) -> &[ComputeError] {
        &self.errors
    }

    /// The first error observed.
    pub fn first(&self) -> &ComputeError {
        // Non-empty by construction.
        &self.errors[0]
    }

    /// Whether any collected error matches `pred`.
    pub fn contains(&self, pred: impl Fn(&ComputeError) -> bool) -> bool {
        self.errors.iter().any(pred)
    }

    /// Whether the caller cancelled the computation.
    pub fn is_cancelled(&self) -> bool {
        self.contains(|e| matches!(e, ComputeError::UserCancelled))
    }

    /// Build a status from a list of errors; `None` if the list is empty.
    pub fn from_errors(errors: Vec<ComputeError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }
}

impl From<ComputeError> for Status {
    fn from(error: ComputeError) -> Self {
        Self::new(error)
    }
}

impl IntoIterator for Status {
    type Item = ComputeError;
    type IntoIter = std::vec::IntoIter<ComputeError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_joins_messages() {
        let mut status = Status::new(ComputeError::MissingInput { key: "data" });
        status.push(ComputeError::UserCancelled);

        let msg = status.to_string();
        assert!(msg.contains("`data`"));
        assert!(msg.contains("cancelled"));
        assert_eq!(status.errors().len(), 2);
        assert!(status.is_cancelled());
    }

    #[test]
    fn status_from_empty_list_is_none() {
        assert!(Status::from_errors(Vec::new()).is_none());
        let status = Status::from_errors(vec![ComputeError::UserCancelled]).unwrap();
        assert_eq!(status.first(), &ComputeError::UserCancelled);
    }

    #[test]
    fn precondition_errors() {
        assert!(ComputeError::MissingInput { key: "x" }.is_precondition());
        assert!(ComputeError::dimension_mismatch("cols", 3, 4).is_precondition());
        assert!(!ComputeError::UserCancelled.is_precondition());
        assert!(!ComputeError::Allocation { requested: 10 }.is_precondition());
    }
}
