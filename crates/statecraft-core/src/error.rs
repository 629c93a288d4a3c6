//! Error types for Statecraft.
//!
//! Every error here is a programming-contract violation reported at the call
//! site. Vetoed property changes are not errors; they are reported through
//! the value returned by [`Property::set`](crate::Property::set).

/// Undo stack protocol violations.
///
/// These indicate an unbalanced `start_operation`/`commit_operation` bracket
/// or an undo/redo issued at the wrong time. They are never transient and
/// retrying the same call will fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UndoError {
    /// `start_operation` was called while this stack was already recording.
    #[error("An operation is already in progress on this undo stack")]
    OperationInProgress,

    /// A command was recorded, or an operation committed/canceled, with no
    /// operation in progress.
    #[error("No operation is in progress")]
    NoActiveOperation,

    /// `undo`/`redo` was called while an operation is being recorded.
    #[error("Cannot undo or redo while an operation is in progress")]
    OperationActive,

    /// The stack was re-entered from a command while it replays an operation.
    #[error("The undo stack is replaying an operation")]
    ReplayInProgress,
}

/// Property-related errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    /// A list index was outside the valid range.
    #[error("Index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// The length of the list at the time of the call.
        len: usize,
    },
}

impl PropertyError {
    /// Create an index error.
    pub fn index_out_of_bounds(index: usize, len: usize) -> Self {
        Self::IndexOutOfBounds { index, len }
    }
}

/// The main error type for Statecraft operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Undo-related error.
    #[error("Undo error: {0}")]
    Undo(#[from] UndoError),

    /// Property-related error.
    #[error("Property error: {0}")]
    Property(#[from] PropertyError),
}

/// A specialized Result type for Statecraft operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(UndoError::OperationActive);
        assert_eq!(
            err.to_string(),
            "Undo error: Cannot undo or redo while an operation is in progress"
        );

        let err = Error::from(PropertyError::index_out_of_bounds(5, 2));
        assert_eq!(
            err.to_string(),
            "Property error: Index 5 out of bounds for list of length 2"
        );
    }

    #[test]
    fn test_error_source() {
        use std::error::Error as _;

        let err = Error::from(UndoError::NoActiveOperation);
        assert!(err.source().is_some());
    }
}
