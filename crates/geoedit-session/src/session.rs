//! One editable layer: a DataSet, its undo history and the lock guarding them.
//!
//! [`EditSession`] wraps the state in `Arc<tokio::sync::RwLock<>>`. tokio's
//! RwLock queues waiters in FIFO order, so a pending writer is served before
//! readers that arrive after it. Every acquisition is bounded by
//! [`SessionConfig::lock_timeout`]; a caller that cannot get the lock in time
//! gets [`SessionError::LockTimeout`] instead of waiting forever.
//!
//! Network I/O never runs under the lock. Downloads and uploads read what
//! they need, release the lock, talk to the server, then take the write lock
//! to integrate the answer.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use geoedit_command::{
    apply_upload_result_with, merge_remote, resolution_command, CommandHistory, EditCommand,
    EditError, HistoryEntry, HistoryListener, MergeReport, Resolution, UploadResult, UploadSet,
};
use geoedit_core::{
    BBox, DataSet, DataSetListener, ListenerId, Primitive, PrimitiveId, PrimitiveKind, Tags,
    UploadPolicy,
};

use crate::cancel::CancelToken;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::hooks::UploadHook;
use crate::remote::RemoteDataService;

/// Everything guarded by the session lock.
pub struct EditState {
    pub dataset: DataSet,
    pub history: CommandHistory,
    hooks: Vec<Arc<dyn UploadHook>>,
}

impl EditState {
    fn new(dataset: DataSet, history_limit: usize) -> Self {
        EditState {
            dataset,
            history: CommandHistory::new(history_limit),
            hooks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for EditState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditState")
            .field("dataset", &self.dataset)
            .field("history", &self.history)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Shared handle to one layer. Clones refer to the same state.
#[derive(Debug, Clone)]
pub struct EditSession {
    state: Arc<RwLock<EditState>>,
    config: SessionConfig,
}

impl EditSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_dataset(config, DataSet::new())
    }

    pub fn with_dataset(config: SessionConfig, dataset: DataSet) -> Self {
        let state = EditState::new(dataset, config.history_limit);
        EditSession {
            state: Arc::new(RwLock::new(state)),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    async fn read_state(&self) -> Result<RwLockReadGuard<'_, EditState>, SessionError> {
        let timeout = self.config.lock_timeout();
        tokio::time::timeout(timeout, self.state.read())
            .await
            .map_err(|_| self.timed_out("read"))
    }

    async fn write_state(&self) -> Result<RwLockWriteGuard<'_, EditState>, SessionError> {
        let timeout = self.config.lock_timeout();
        tokio::time::timeout(timeout, self.state.write())
            .await
            .map_err(|_| self.timed_out("write"))
    }

    fn timed_out(&self, access: &'static str) -> SessionError {
        let waited_ms = self.config.lock_timeout_ms;
        tracing::warn!(access, waited_ms, "session lock timed out");
        SessionError::LockTimeout { access, waited_ms }
    }

    // -----------------------------------------------------------------------
    // Reading and editing
    // -----------------------------------------------------------------------

    /// Runs `f` against the store under the read lock.
    pub async fn read<R>(&self, f: impl FnOnce(&DataSet) -> R) -> Result<R, SessionError> {
        let state = self.read_state().await?;
        Ok(f(&state.dataset))
    }

    /// Executes `command` through the history.
    ///
    /// Structural edits touching primitives with an unresolved conflict are
    /// refused with `ConflictPending`.
    pub async fn submit(&self, command: EditCommand) -> Result<HistoryEntry, SessionError> {
        let mut guard = self.write_state().await?;
        let state = &mut *guard;
        let blocked = command.blocked_by(state.dataset.conflicts());
        if !blocked.is_empty() {
            return Err(EditError::ConflictPending { ids: blocked }.into());
        }
        Ok(state.history.execute(&mut state.dataset, command)?)
    }

    pub async fn undo(&self) -> Result<HistoryEntry, SessionError> {
        let mut guard = self.write_state().await?;
        let state = &mut *guard;
        Ok(state.history.undo(&mut state.dataset)?)
    }

    pub async fn redo(&self) -> Result<HistoryEntry, SessionError> {
        let mut guard = self.write_state().await?;
        let state = &mut *guard;
        Ok(state.history.redo(&mut state.dataset)?)
    }

    /// History entries, newest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, SessionError> {
        Ok(self.read_state().await?.history.entries())
    }

    /// Settles the conflict on `id` with an undoable command.
    pub async fn resolve_conflict(
        &self,
        id: PrimitiveId,
        resolution: Resolution,
    ) -> Result<HistoryEntry, SessionError> {
        let mut guard = self.write_state().await?;
        let state = &mut *guard;
        let command = resolution_command(&state.dataset, id, resolution)?;
        Ok(state.history.execute(&mut state.dataset, command)?)
    }

    /// Reserves a fresh negative id for a primitive about to be added.
    pub async fn allocate_id(&self, kind: PrimitiveKind) -> Result<PrimitiveId, SessionError> {
        Ok(self.write_state().await?.dataset.allocate_id(kind))
    }

    pub async fn set_selected(&self, ids: Vec<PrimitiveId>) -> Result<(), SessionError> {
        let mut state = self.write_state().await?;
        state.dataset.set_selected(ids).map_err(EditError::from)?;
        Ok(())
    }

    pub async fn set_upload_policy(&self, policy: UploadPolicy) -> Result<(), SessionError> {
        self.write_state().await?.dataset.set_upload_policy(policy);
        Ok(())
    }

    pub async fn add_listener(&self, listener: Arc<dyn DataSetListener>) -> Result<ListenerId, SessionError> {
        Ok(self.write_state().await?.dataset.add_listener(listener))
    }

    pub async fn remove_listener(&self, id: ListenerId) -> Result<bool, SessionError> {
        Ok(self.write_state().await?.dataset.remove_listener(id))
    }

    pub async fn add_history_listener(&self, listener: Arc<dyn HistoryListener>) -> Result<(), SessionError> {
        self.write_state().await?.history.add_listener(listener);
        Ok(())
    }

    /// Registers a hook. Later hooks run before earlier ones.
    pub async fn add_upload_hook(&self, hook: Arc<dyn UploadHook>) -> Result<(), SessionError> {
        self.write_state().await?.hooks.push(hook);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Server round trips
    // -----------------------------------------------------------------------

    /// Downloads `area` and merges it as one undoable history entry.
    ///
    /// Cancelling before the data is merged leaves the store untouched.
    pub async fn download(
        &self,
        remote: &dyn RemoteDataService,
        area: BBox,
        cancel: &CancelToken,
    ) -> Result<MergeReport, SessionError> {
        tracing::info!(?area, "downloading");
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            fetched = remote.download(area) => fetched?,
        };
        self.integrate(fetched, cancel).await
    }

    /// Fetches the full data of every incomplete placeholder and merges it.
    pub async fn load_incomplete(
        &self,
        remote: &dyn RemoteDataService,
        cancel: &CancelToken,
    ) -> Result<MergeReport, SessionError> {
        let ids: Vec<PrimitiveId> = self
            .read(|ds| {
                ds.all_primitives()
                    .filter(|p| p.is_incomplete())
                    .map(Primitive::id)
                    .collect()
            })
            .await?;
        if ids.is_empty() {
            return Ok(MergeReport::default());
        }
        tracing::info!(count = ids.len(), "fetching incomplete primitives");
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            fetched = remote.fetch(&ids) => fetched?,
        };
        self.integrate(fetched, cancel).await
    }

    async fn integrate(
        &self,
        fetched: Vec<Primitive>,
        cancel: &CancelToken,
    ) -> Result<MergeReport, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let received = fetched.len();
        let mut guard = self.write_state().await?;
        let state = &mut *guard;
        let plan = merge_remote(&state.dataset, fetched);
        if let Some(command) = plan.command {
            state.history.execute(&mut state.dataset, command)?;
        }
        tracing::info!(
            received,
            fast_forward = plan.report.fast_forward,
            conflicts = plan.report.conflicts.len(),
            skipped = plan.report.skipped.len(),
            "merged download"
        );
        Ok(plan.report)
    }

    /// Uploads all local changes.
    ///
    /// Fails without contacting the server if the layer is blocked, has
    /// nothing to upload, has conflicts among the changes, or a hook vetoes
    /// the upload. A transport failure or cancellation before the server
    /// answers leaves the store untouched. On success the answer is applied
    /// outside the undo history; primitives edited during the round trip
    /// keep their modified flag.
    pub async fn upload(
        &self,
        remote: &dyn RemoteDataService,
        changeset_tags: Tags,
        cancel: &CancelToken,
    ) -> Result<UploadResult, SessionError> {
        let (set, changeset) = {
            let state = self.read_state().await?;
            let ds = &state.dataset;
            match ds.upload_policy() {
                UploadPolicy::Blocked => return Err(SessionError::UploadBlocked),
                UploadPolicy::Discouraged => tracing::warn!("uploading a layer marked as discouraged"),
                UploadPolicy::Normal => {}
            }
            let set = UploadSet::from_dataset(ds)?;
            if set.is_empty() {
                return Err(SessionError::NothingToUpload);
            }
            let conflicted = set.participates_in_conflict(ds.conflicts());
            if !conflicted.is_empty() {
                return Err(SessionError::UnresolvedConflicts { ids: conflicted });
            }
            for hook in state.hooks.iter().rev() {
                hook.check_upload(&set)
                    .map_err(|reason| SessionError::UploadRejected { reason })?;
            }
            let mut tags = changeset_tags;
            for hook in state.hooks.iter().rev() {
                hook.modify_changeset_tags(&mut tags);
            }
            let changeset = set.to_changeset(tags);
            (set, changeset)
        };

        let operations = changeset.operations.len();
        tracing::info!(operations, "uploading changeset");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            result = remote.upload(changeset) => result?,
        };

        let mut guard = self.write_state().await?;
        let state = &mut *guard;
        // Edits made while the request was in flight stay modified.
        let removal = self.config.upload_removal_mode;
        if let Err(err) = apply_upload_result_with(&mut state.dataset, &set, &result, removal) {
            tracing::error!(error = %err, "server accepted upload but the result could not be applied");
            return Err(err.into());
        }
        tracing::info!(
            created = result.created.len(),
            modified = result.modified.len(),
            deleted = result.deleted.len(),
            "upload applied"
        );
        Ok(result)
    }

    /// Drops the store, history, listeners and hooks. Other handles to this
    /// session see an empty layer afterwards.
    pub(crate) async fn shutdown(&self) -> Result<(), SessionError> {
        let mut state = self.write_state().await?;
        *state = EditState::new(DataSet::new(), self.config.history_limit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoedit_core::{LatLon, TagChange, Version};
    use std::time::Duration;

    fn config(lock_timeout_ms: u64) -> SessionConfig {
        SessionConfig {
            lock_timeout_ms,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn lock_wait_is_bounded() {
        let session = EditSession::new(config(20));
        let held = Arc::clone(&session.state);
        let _guard = held.write().await;

        let err = session.read(|ds| ds.len()).await.unwrap_err();
        assert!(matches!(err, SessionError::LockTimeout { access: "read", waited_ms: 20 }));
        let err = session.undo().await.unwrap_err();
        assert!(matches!(err, SessionError::LockTimeout { access: "write", .. }));
    }

    #[tokio::test]
    async fn waiting_writer_goes_before_later_readers() {
        let session = EditSession::new(config(1_000));
        let reader = session.state.clone().read_owned().await;

        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                let command = EditCommand::Add {
                    primitive: Primitive::point(1, LatLon::new(0.0, 0.0)).with_version(Version(1)),
                };
                session.submit(command).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let later_reader = {
            let session = session.clone();
            tokio::spawn(async move { session.read(|ds| ds.len()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(reader);

        writer.await.unwrap().unwrap();
        // The later read queued behind the writer, so it sees the point.
        assert_eq!(later_reader.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_empties_every_handle() {
        let session = EditSession::new(SessionConfig::default());
        let other = session.clone();
        session
            .submit(EditCommand::Add {
                primitive: Primitive::point(1, LatLon::new(0.0, 0.0)),
            })
            .await
            .unwrap();
        session
            .submit(EditCommand::ChangeTags {
                ids: vec![PrimitiveId::point(1)],
                changes: vec![TagChange::set("name", "x")],
            })
            .await
            .unwrap();
        session.shutdown().await.unwrap();
        assert_eq!(other.read(|ds| ds.len()).await.unwrap(), 0);
        assert!(other.history().await.unwrap().is_empty());
    }
}
