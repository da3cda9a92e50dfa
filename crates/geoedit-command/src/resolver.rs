//! Classification of a local primitive against its authoritative version.
//!
//! The resolver never merges fields: a primitive is either left alone,
//! fast-forwarded to the remote snapshot, or reported as a conflict. Applying
//! a chosen [`Resolution`] goes through a command so it stays undoable.

use serde::Serialize;

use geoedit_core::{ConflictKind, DataSet, Primitive, PrimitiveId};

use crate::command::EditCommand;
use crate::error::EditError;

/// Outcome of comparing local state with the authoritative version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Keep the local primitive as it is.
    Unchanged,
    /// Adopt the authoritative version.
    FastForward,
    /// Both sides diverged; needs explicit resolution.
    Conflict(ConflictKind),
}

/// Classifies local `local` (absent if `None`) against authoritative `remote`.
pub fn classify(local: Option<&Primitive>, remote: &Primitive) -> Classification {
    let Some(local) = local else {
        return Classification::FastForward;
    };
    if local.is_incomplete() {
        return Classification::FastForward;
    }
    if local.version() >= remote.version() && local.content_equals(remote) {
        return Classification::Unchanged;
    }
    if !local.is_modified() {
        // A stale remote (older or same version) is discarded.
        return if remote.version() > local.version() {
            Classification::FastForward
        } else {
            Classification::Unchanged
        };
    }
    if remote.version() <= local.version() {
        return Classification::Unchanged;
    }
    match (local.is_deleted(), remote.is_deleted()) {
        (true, true) => Classification::FastForward,
        (true, false) => Classification::Conflict(ConflictKind::DeletedLocally),
        (false, true) => Classification::Conflict(ConflictKind::DeletedOnServer),
        (false, false) if local.content_equals(remote) => Classification::FastForward,
        (false, false) => Classification::Conflict(ConflictKind::TrueConflict),
    }
}

/// How the user chose to settle a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the current local content, rebased onto the remote version.
    KeepLocal,
    /// Take the remote snapshot as is.
    KeepRemote,
    /// Use hand-merged content, rebased onto the remote version.
    Manual(Primitive),
}

/// Builds the `ResolveConflict` command settling the conflict on `id`.
///
/// Local and manual results carry the remote version and stay modified so
/// they are uploaded; a remote result is clean.
pub fn resolution_command(
    ds: &DataSet,
    id: PrimitiveId,
    resolution: Resolution,
) -> Result<EditCommand, EditError> {
    let conflict = ds
        .conflicts()
        .get(id)
        .ok_or(EditError::NoSuchConflict { id })?;
    let remote_version = conflict.remote.version();
    let resolved = match resolution {
        Resolution::KeepLocal => {
            let current = ds.get(id).unwrap_or(&conflict.local);
            current
                .clone()
                .with_version(remote_version)
                .with_modified(true)
        }
        Resolution::KeepRemote => conflict.remote.clone().with_modified(false),
        Resolution::Manual(primitive) => {
            if primitive.id() != id {
                return Err(EditError::InvalidCommand {
                    reason: format!("manual resolution for {id} carries {}", primitive.id()),
                });
            }
            primitive.with_version(remote_version).with_modified(true)
        }
    };
    Ok(EditCommand::ResolveConflict { id, resolved })
}
