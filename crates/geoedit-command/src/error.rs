//! Error types for commands, history and upload planning.

use thiserror::Error;

use geoedit_core::{DataSetError, PrimitiveId};

/// Errors produced while executing, undoing or redoing commands.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    /// The store rejected a mutation.
    #[error(transparent)]
    DataSet(#[from] DataSetError),

    /// An undo/redo precondition no longer holds. The failing entry and
    /// everything after it were dropped from the history.
    #[error("cannot undo further: {reason} ({discarded} history entries discarded)")]
    InvalidHistoryState { reason: String, discarded: usize },

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    /// A structural edit touches primitives with unresolved conflicts.
    #[error("unresolved conflicts on {}", display_ids(.ids))]
    ConflictPending { ids: Vec<PrimitiveId> },

    /// The command is malformed for the current store.
    #[error("invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("no conflict recorded for {id}")]
    NoSuchConflict { id: PrimitiveId },
}

/// Errors produced while planning or integrating an upload.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UploadError {
    /// New relations reference each other in a cycle and cannot be created
    /// in any order.
    #[error("cyclic dependency among new relations: {}", display_ids(.ids))]
    CyclicDependency { ids: Vec<PrimitiveId> },

    /// The server's answer names ids inconsistently.
    #[error("invalid upload result: {reason}")]
    InvalidResult { reason: String },

    #[error(transparent)]
    DataSet(#[from] DataSetError),
}

fn display_ids(ids: &[PrimitiveId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
