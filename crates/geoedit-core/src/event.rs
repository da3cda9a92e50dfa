//! Change notifications published by a DataSet.
//!
//! Mutations record what they touched into a pending queue. Outside a batch
//! the queue is flushed right after each mutation; inside a batch it is
//! flushed once, at the outermost `end_update()`, as one event per category.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::id::PrimitiveId;

/// Structural delta accumulated over one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StructureChange {
    /// Primitives that became present.
    pub added: Vec<PrimitiveId>,
    /// Primitives that were purged.
    pub removed: Vec<PrimitiveId>,
    /// Primitives whose geometry, membership or deleted state changed.
    pub changed: Vec<PrimitiveId>,
}

impl StructureChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// An event delivered to [`DataSetListener`]s.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DataSetEvent {
    StructureChanged(StructureChange),
    TagsChanged { ids: Vec<PrimitiveId> },
    SelectionChanged { selected: Vec<PrimitiveId> },
    ConflictsChanged {
        added: Vec<PrimitiveId>,
        removed: Vec<PrimitiveId>,
    },
}

/// Notification sink (renderer, validator, ...).
pub trait DataSetListener: Send + Sync {
    fn on_event(&self, event: &DataSetEvent);
}

impl<F> DataSetListener for F
where
    F: Fn(&DataSetEvent) + Send + Sync,
{
    fn on_event(&self, event: &DataSetEvent) {
        self(event)
    }
}

/// Handle returned by `add_listener`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Pending notifications for the current batch.
///
/// Sets keep ids deduplicated; an id that is added and then purged inside the
/// same batch is reported in neither list.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    added: BTreeSet<PrimitiveId>,
    removed: BTreeSet<PrimitiveId>,
    changed: BTreeSet<PrimitiveId>,
    tags: BTreeSet<PrimitiveId>,
    selection_dirty: bool,
    conflicts_added: BTreeSet<PrimitiveId>,
    conflicts_removed: BTreeSet<PrimitiveId>,
}

impl EventQueue {
    pub(crate) fn added(&mut self, id: PrimitiveId) {
        if !self.removed.remove(&id) {
            self.added.insert(id);
        } else {
            self.changed.insert(id);
        }
    }

    pub(crate) fn removed(&mut self, id: PrimitiveId) {
        self.changed.remove(&id);
        self.tags.remove(&id);
        if !self.added.remove(&id) {
            self.removed.insert(id);
        }
    }

    pub(crate) fn changed(&mut self, id: PrimitiveId) {
        if !self.added.contains(&id) {
            self.changed.insert(id);
        }
    }

    pub(crate) fn tags(&mut self, id: PrimitiveId) {
        if !self.added.contains(&id) {
            self.tags.insert(id);
        }
    }

    pub(crate) fn selection(&mut self) {
        self.selection_dirty = true;
    }

    pub(crate) fn conflict_added(&mut self, id: PrimitiveId) {
        if !self.conflicts_removed.remove(&id) {
            self.conflicts_added.insert(id);
        }
    }

    pub(crate) fn conflict_removed(&mut self, id: PrimitiveId) {
        if !self.conflicts_added.remove(&id) {
            self.conflicts_removed.insert(id);
        }
    }

    /// Drains the queue into events. `selected` is the selection at flush time.
    pub(crate) fn drain(&mut self, selected: impl FnOnce() -> Vec<PrimitiveId>) -> Vec<DataSetEvent> {
        let mut events = Vec::new();
        let structure = StructureChange {
            added: std::mem::take(&mut self.added).into_iter().collect(),
            removed: std::mem::take(&mut self.removed).into_iter().collect(),
            changed: std::mem::take(&mut self.changed).into_iter().collect(),
        };
        if !structure.is_empty() {
            events.push(DataSetEvent::StructureChanged(structure));
        }
        let tags: Vec<PrimitiveId> = std::mem::take(&mut self.tags).into_iter().collect();
        if !tags.is_empty() {
            events.push(DataSetEvent::TagsChanged { ids: tags });
        }
        if std::mem::take(&mut self.selection_dirty) {
            events.push(DataSetEvent::SelectionChanged {
                selected: selected(),
            });
        }
        let added: Vec<PrimitiveId> = std::mem::take(&mut self.conflicts_added).into_iter().collect();
        let removed: Vec<PrimitiveId> =
            std::mem::take(&mut self.conflicts_removed).into_iter().collect();
        if !added.is_empty() || !removed.is_empty() {
            events.push(DataSetEvent::ConflictsChanged { added, removed });
        }
        events
    }
}
