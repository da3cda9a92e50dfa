//! Core error types for geoedit-core.
//!
//! Uses `thiserror` for structured, matchable variants. Every variant except
//! [`DataSetError::NotFound`] is an integrity violation: a collaborator broke
//! the store's contract and the triggering operation is aborted with no
//! partial effect.

use thiserror::Error;

use crate::id::{PrimitiveId, PrimitiveKind};

/// Errors produced by [`DataSet`](crate::dataset::DataSet) operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataSetError {
    /// A primitive with the same id is already present.
    #[error("duplicate identity: {id} already exists")]
    DuplicateIdentity { id: PrimitiveId },

    /// The primitive is still referenced by composites.
    #[error("{id} is still referenced by {} composite(s)", .referrers.len())]
    StillReferenced {
        id: PrimitiveId,
        referrers: Vec<PrimitiveId>,
    },

    /// A composite references a primitive that is not in the store.
    #[error("dangling reference: {referrer} references missing {target}")]
    DanglingReference {
        referrer: PrimitiveId,
        target: PrimitiveId,
    },

    /// A new structural edit references a soft-deleted primitive.
    #[error("{referrer} cannot reference deleted {target}")]
    ReferencesDeleted {
        referrer: PrimitiveId,
        target: PrimitiveId,
    },

    /// A structural edit targets a soft-deleted primitive.
    #[error("{id} is deleted")]
    Deleted { id: PrimitiveId },

    /// A primitive of the wrong kind was supplied.
    #[error("kind mismatch: {id} is not a {expected}")]
    KindMismatch {
        id: PrimitiveId,
        expected: PrimitiveKind,
    },

    /// No primitive with this id is present.
    #[error("primitive not found: {id}")]
    NotFound { id: PrimitiveId },

    /// Id 0 is never valid.
    #[error("invalid id: {id}")]
    InvalidId { id: PrimitiveId },

    /// A second conflict record for the same primitive.
    #[error("a conflict is already recorded for {id}")]
    DuplicateConflict { id: PrimitiveId },

    /// Internal state no longer matches the primitive set.
    #[error("dataset inconsistency: {reason}")]
    Inconsistent { reason: String },
}

impl DataSetError {
    /// `true` for the IntegrityViolation class of errors.
    pub fn is_integrity_violation(&self) -> bool {
        !matches!(self, DataSetError::NotFound { .. })
    }
}
