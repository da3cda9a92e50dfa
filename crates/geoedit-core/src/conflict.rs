//! Conflict records between a local primitive and its server version.
//!
//! A [`ConflictCollection`] is owned by exactly one DataSet. Records are
//! verbatim snapshots taken at detection time and are never mutated; a
//! resolution removes the record and replaces the primitive.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::DataSetError;
use crate::id::PrimitiveId;
use crate::primitive::Primitive;

/// Why a primitive could not be merged automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed content independently.
    TrueConflict,
    /// Deleted locally, changed on the server.
    DeletedLocally,
    /// Changed locally, deleted on the server.
    DeletedOnServer,
}

impl ConflictKind {
    pub fn is_deleted_conflict(self) -> bool {
        !matches!(self, ConflictKind::TrueConflict)
    }
}

/// An unresolved divergence between `local` and `remote`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: PrimitiveId,
    pub kind: ConflictKind,
    pub local: Primitive,
    pub remote: Primitive,
}

impl Conflict {
    pub fn new(kind: ConflictKind, local: Primitive, remote: Primitive) -> Self {
        Conflict {
            id: local.id(),
            kind,
            local,
            remote,
        }
    }
}

/// Insertion-ordered set of conflicts, at most one per primitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictCollection {
    records: IndexMap<PrimitiveId, Conflict>,
}

impl ConflictCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. Fails with `DuplicateConflict` if `id` already has one.
    pub fn add(&mut self, conflict: Conflict) -> Result<(), DataSetError> {
        if self.records.contains_key(&conflict.id) {
            return Err(DataSetError::DuplicateConflict { id: conflict.id });
        }
        self.records.insert(conflict.id, conflict);
        Ok(())
    }

    /// Removes and returns the record for `id`, preserving the order of the rest.
    pub fn remove(&mut self, id: PrimitiveId) -> Option<Conflict> {
        self.records.shift_remove(&id)
    }

    pub fn get(&self, id: PrimitiveId) -> Option<&Conflict> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: PrimitiveId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.records.values()
    }

    pub fn ids(&self) -> Vec<PrimitiveId> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids from `ids` that have an unresolved conflict.
    pub fn participates(&self, ids: &[PrimitiveId]) -> Vec<PrimitiveId> {
        ids.iter().copied().filter(|id| self.contains(*id)).collect()
    }

    // Restores a record at its former position; used by undo.
    pub(crate) fn insert_at(&mut self, index: usize, conflict: Conflict) {
        let id = conflict.id;
        let (pos, _) = self.records.insert_full(id, conflict);
        let target = index.min(self.records.len() - 1);
        if pos != target {
            self.records.move_index(pos, target);
        }
    }

    pub(crate) fn position(&self, id: PrimitiveId) -> Option<usize> {
        self.records.get_index_of(&id)
    }
}
