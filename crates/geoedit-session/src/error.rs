//! Session-level errors.

use thiserror::Error;

use geoedit_command::{EditError, UploadError};
use geoedit_core::PrimitiveId;

use crate::registry::LayerId;
use crate::remote::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Edit(#[from] EditError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    /// The session lock was not granted in time.
    #[error("timed out after {waited_ms} ms waiting for {access} access")]
    LockTimeout { access: &'static str, waited_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    /// Transient I/O failure talking to the server. The store is unchanged.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("upload blocked by unresolved conflicts on {}", join(.ids))]
    UnresolvedConflicts { ids: Vec<PrimitiveId> },

    /// An upload hook vetoed the upload.
    #[error("upload rejected: {reason}")]
    UploadRejected { reason: String },

    #[error("uploads are blocked for this layer")]
    UploadBlocked,

    #[error("nothing to upload")]
    NothingToUpload,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown session {0}")]
    UnknownSession(LayerId),
}

fn join(ids: &[PrimitiveId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
