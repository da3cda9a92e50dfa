//! Bounded undo/redo history of executed commands.
//!
//! [`CommandHistory`] keeps applied commands in a deque capped at `limit`
//! (oldest evicted first) and undone commands on a redo stack. Executing a
//! new command clears the redo stack. When an undo or redo fails because its
//! preconditions no longer hold, the failing entry and every entry after it
//! are discarded instead of leaving a history that cannot be replayed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use geoedit_core::DataSet;

use crate::command::{CommandRecord, EditCommand};
use crate::error::EditError;

/// Public view of one history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// Unique identifier for this edit (UUID v4).
    pub id: Uuid,
    /// Milliseconds since the Unix epoch at first execution.
    pub executed_at_ms: u64,
    pub description: String,
    /// Whether this edit is currently undone (on the redo stack).
    pub undone: bool,
}

/// Notification published after every history transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    Executed { id: Uuid, description: String },
    Undone { id: Uuid, description: String },
    Redone { id: Uuid, description: String },
    /// Entries were dropped after a failed undo/redo.
    Truncated { discarded: usize },
    Cleared,
}

pub trait HistoryListener: Send + Sync {
    fn on_history(&self, event: &HistoryEvent);
}

impl<F> HistoryListener for F
where
    F: Fn(&HistoryEvent) + Send + Sync,
{
    fn on_history(&self, event: &HistoryEvent) {
        self(event)
    }
}

struct Entry {
    id: Uuid,
    executed_at_ms: u64,
    record: CommandRecord,
}

impl Entry {
    fn view(&self, undone: bool) -> HistoryEntry {
        HistoryEntry {
            id: self.id,
            executed_at_ms: self.executed_at_ms,
            description: self.record.command().describe(),
            undone,
        }
    }
}

/// Undo/redo stacks over one DataSet.
pub struct CommandHistory {
    limit: usize,
    /// Applied entries, oldest at the front.
    undo: VecDeque<Entry>,
    /// Undone entries; the last one is redone next.
    redo: Vec<Entry>,
    listeners: Vec<Arc<dyn HistoryListener>>,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT)
    }
}

impl std::fmt::Debug for CommandHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHistory")
            .field("limit", &self.limit)
            .field("undo", &self.undo.len())
            .field("redo", &self.redo.len())
            .finish()
    }
}

impl CommandHistory {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new(limit: usize) -> Self {
        CommandHistory {
            limit,
            undo: VecDeque::new(),
            redo: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Changes the bound, evicting the oldest entries if needed.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.evict();
    }

    pub fn add_listener(&mut self, listener: Arc<dyn HistoryListener>) {
        self.listeners.push(listener);
    }

    /// Executes `command` and records it. Any redo history is dropped.
    pub fn execute(&mut self, ds: &mut DataSet, command: EditCommand) -> Result<HistoryEntry, EditError> {
        let mut record = CommandRecord::new(command);
        record.execute(ds)?;

        for mut stale in self.redo.drain(..) {
            stale.record.discard();
        }
        let entry = Entry {
            id: Uuid::new_v4(),
            executed_at_ms: now_ms(),
            record,
        };
        let view = entry.view(false);
        tracing::debug!(id = %view.id, description = %view.description, "executed command");
        self.undo.push_back(entry);
        self.evict();
        self.notify(HistoryEvent::Executed {
            id: view.id,
            description: view.description.clone(),
        });
        Ok(view)
    }

    /// Undoes the newest applied entry.
    pub fn undo(&mut self, ds: &mut DataSet) -> Result<HistoryEntry, EditError> {
        let mut entry = self.undo.pop_back().ok_or(EditError::NothingToUndo)?;
        match entry.record.undo(ds) {
            Ok(()) => {
                let view = entry.view(true);
                tracing::debug!(id = %view.id, description = %view.description, "undid command");
                self.redo.push(entry);
                self.notify(HistoryEvent::Undone {
                    id: view.id,
                    description: view.description.clone(),
                });
                Ok(view)
            }
            Err(err) => Err(self.truncate(entry, err)),
        }
    }

    /// Re-executes the most recently undone entry.
    pub fn redo(&mut self, ds: &mut DataSet) -> Result<HistoryEntry, EditError> {
        let mut entry = self.redo.pop().ok_or(EditError::NothingToRedo)?;
        match entry.record.execute(ds) {
            Ok(()) => {
                let view = entry.view(false);
                tracing::debug!(id = %view.id, description = %view.description, "redid command");
                self.undo.push_back(entry);
                self.evict();
                self.notify(HistoryEvent::Redone {
                    id: view.id,
                    description: view.description.clone(),
                });
                Ok(view)
            }
            Err(err) => Err(self.truncate(entry, err)),
        }
    }

    /// Undoes up to `n` entries, stopping early when the stack runs out.
    pub fn undo_many(&mut self, ds: &mut DataSet, n: usize) -> Result<Vec<HistoryEntry>, EditError> {
        let mut undone = Vec::new();
        for _ in 0..n {
            if !self.can_undo() {
                break;
            }
            undone.push(self.undo(ds)?);
        }
        Ok(undone)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// All entries, newest first. Undone entries come before applied ones.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.redo
            .iter()
            .map(|e| e.view(true))
            .chain(self.undo.iter().rev().map(|e| e.view(false)))
            .collect()
    }

    /// Drops the whole history without touching the DataSet.
    pub fn clear(&mut self) {
        for entry in self.undo.iter_mut().chain(self.redo.iter_mut()) {
            entry.record.discard();
        }
        self.undo.clear();
        self.redo.clear();
        self.notify(HistoryEvent::Cleared);
    }

    // Discards `failed` and every later entry (the whole redo stack).
    fn truncate(&mut self, mut failed: Entry, err: EditError) -> EditError {
        failed.record.discard();
        let discarded = 1 + self.redo.len();
        for mut later in self.redo.drain(..) {
            later.record.discard();
        }
        tracing::warn!(
            description = %failed.record.command().describe(),
            discarded,
            error = %err,
            "history truncated"
        );
        self.notify(HistoryEvent::Truncated { discarded });
        EditError::InvalidHistoryState {
            reason: err.to_string(),
            discarded,
        }
    }

    fn evict(&mut self) {
        while self.undo.len() > self.limit {
            if let Some(mut oldest) = self.undo.pop_front() {
                oldest.record.discard();
                tracing::debug!(id = %oldest.id, "evicted oldest history entry");
            }
        }
    }

    fn notify(&self, event: HistoryEvent) {
        for listener in &self.listeners {
            listener.on_history(&event);
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
