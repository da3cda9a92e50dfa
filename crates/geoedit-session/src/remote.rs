//! The authoritative data service a session talks to.
//!
//! [`RemoteDataService`] is the only seam to the network. [`MemoryRemote`]
//! implements it over an in-process store with server-side version checks;
//! it backs tests and offline dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use geoedit_command::{Changeset, ChangesetOp, UploadResult};
use geoedit_core::{BBox, Geometry, Member, Primitive, PrimitiveId, PrimitiveKind, Version};

/// Transient failures talking to the server. Retrying may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait RemoteDataService: Send + Sync {
    /// Everything the server has in `area`, with referenced primitives.
    async fn download(&self, area: BBox) -> Result<Vec<Primitive>, TransportError>;

    /// Current server state of `ids`. Unknown ids are omitted.
    async fn fetch(&self, ids: &[PrimitiveId]) -> Result<Vec<Primitive>, TransportError>;

    /// Applies a changeset atomically.
    async fn upload(&self, changeset: Changeset) -> Result<UploadResult, TransportError>;
}

// ---------------------------------------------------------------------------
// MemoryRemote
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ServerState {
    primitives: BTreeMap<PrimitiveId, Primitive>,
    next_id: HashMap<PrimitiveKind, i64>,
    changesets: Vec<Changeset>,
    fail_next: Option<TransportError>,
}

/// In-process server. Deleted primitives stay as tombstones with a bumped
/// version, as on a real server.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<ServerState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the server with primitives as they are (version included).
    pub async fn with_primitives(primitives: impl IntoIterator<Item = Primitive>) -> Self {
        let remote = Self::new();
        remote.put(primitives).await;
        remote
    }

    /// Inserts or overwrites primitives; simulates edits by other users.
    pub async fn put(&self, primitives: impl IntoIterator<Item = Primitive>) {
        let mut state = self.state.lock().await;
        for p in primitives {
            let p = p.with_modified(false);
            let next = state.next_id.entry(p.kind()).or_insert(1);
            *next = (*next).max(p.id().id + 1);
            state.primitives.insert(p.id(), p);
        }
    }

    pub async fn get(&self, id: PrimitiveId) -> Option<Primitive> {
        self.state.lock().await.primitives.get(&id).cloned()
    }

    /// Makes the next request fail with `err`.
    pub async fn fail_next(&self, err: TransportError) {
        self.state.lock().await.fail_next = Some(err);
    }

    /// Changesets accepted so far, oldest first.
    pub async fn changesets(&self) -> Vec<Changeset> {
        self.state.lock().await.changesets.clone()
    }
}

#[async_trait]
impl RemoteDataService for MemoryRemote {
    async fn download(&self, area: BBox) -> Result<Vec<Primitive>, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        let live = |p: &&Primitive| !p.is_deleted();

        let mut picked: BTreeSet<PrimitiveId> = state
            .primitives
            .values()
            .filter(live)
            .filter(|p| p.coord().is_some_and(|c| area.contains(c)))
            .map(Primitive::id)
            .collect();
        // Lines touching the area come whole.
        let lines: Vec<&Primitive> = state
            .primitives
            .values()
            .filter(live)
            .filter(|p| p.kind() == PrimitiveKind::Line)
            .filter(|p| p.nodes().iter().any(|n| picked.contains(n)))
            .collect();
        for line in lines {
            picked.insert(line.id());
            picked.extend(line.nodes().iter().copied());
        }
        // Relations with a member in the result; members themselves are not
        // pulled in.
        loop {
            let before = picked.len();
            let relations: Vec<PrimitiveId> = state
                .primitives
                .values()
                .filter(live)
                .filter(|p| p.kind() == PrimitiveKind::Relation && !picked.contains(&p.id()))
                .filter(|p| p.members().iter().any(|m| picked.contains(&m.target)))
                .map(Primitive::id)
                .collect();
            picked.extend(relations);
            if picked.len() == before {
                break;
            }
        }
        Ok(picked
            .iter()
            .filter_map(|id| state.primitives.get(id).cloned())
            .collect())
    }

    async fn fetch(&self, ids: &[PrimitiveId]) -> Result<Vec<Primitive>, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.primitives.get(id).cloned())
            .collect())
    }

    async fn upload(&self, changeset: Changeset) -> Result<UploadResult, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }

        // Work on a copy so a rejected changeset changes nothing.
        let mut primitives = state.primitives.clone();
        let mut next_id = state.next_id.clone();
        let mut renames: HashMap<PrimitiveId, PrimitiveId> = HashMap::new();
        let mut result = UploadResult::default();

        for op in &changeset.operations {
            match op {
                ChangesetOp::Create { primitive } => {
                    let next = next_id.entry(primitive.kind()).or_insert(1);
                    let id = PrimitiveId::new(primitive.kind(), *next);
                    *next += 1;
                    let geometry = rename_refs(primitive.geometry(), &renames);
                    check_refs(&geometry, &primitives)?;
                    let created = Primitive::with_geometry(id, geometry)
                        .with_tags(primitive.tags().clone())
                        .with_version(Version(1));
                    renames.insert(primitive.id(), id);
                    primitives.insert(id, created);
                    result.created.push((primitive.id(), id.id, Version(1)));
                }
                ChangesetOp::Modify { primitive } => {
                    let current = current_version(&primitives, primitive.id(), primitive.version())?;
                    let geometry = rename_refs(primitive.geometry(), &renames);
                    check_refs(&geometry, &primitives)?;
                    let version = Version(current.0 + 1);
                    let modified = Primitive::with_geometry(primitive.id(), geometry)
                        .with_tags(primitive.tags().clone())
                        .with_version(version);
                    primitives.insert(primitive.id(), modified);
                    result.modified.push((primitive.id(), version));
                }
                ChangesetOp::Delete { id, version } => {
                    let current = current_version(&primitives, *id, *version)?;
                    let still_used = primitives
                        .values()
                        .any(|p| !p.is_deleted() && p.id() != *id && p.referenced_ids().contains(id));
                    if still_used {
                        return Err(TransportError::Server {
                            status: 412,
                            message: format!("{id} is still used"),
                        });
                    }
                    if let Some(p) = primitives.get_mut(id) {
                        *p = p.clone().with_deleted(true).with_version(Version(current.0 + 1));
                    }
                    result.deleted.push(*id);
                }
            }
        }

        state.primitives = primitives;
        state.next_id = next_id;
        state.changesets.push(changeset);
        Ok(result)
    }
}

fn current_version(
    primitives: &BTreeMap<PrimitiveId, Primitive>,
    id: PrimitiveId,
    claimed: Version,
) -> Result<Version, TransportError> {
    let Some(current) = primitives.get(&id) else {
        return Err(TransportError::Server {
            status: 404,
            message: format!("{id} not found"),
        });
    };
    if current.is_deleted() {
        return Err(TransportError::Server {
            status: 410,
            message: format!("{id} already deleted"),
        });
    }
    if current.version() != claimed {
        return Err(TransportError::Server {
            status: 409,
            message: format!("version mismatch for {id}: server has {}, got {claimed}", current.version()),
        });
    }
    Ok(current.version())
}

fn rename_refs(geometry: &Geometry, renames: &HashMap<PrimitiveId, PrimitiveId>) -> Geometry {
    let rename = |id: &PrimitiveId| renames.get(id).copied().unwrap_or(*id);
    match geometry {
        Geometry::Point { coord } => Geometry::Point { coord: *coord },
        Geometry::Line { nodes } => Geometry::Line {
            nodes: nodes.iter().map(rename).collect(),
        },
        Geometry::Relation { members } => Geometry::Relation {
            members: members
                .iter()
                .map(|m| Member::new(m.role.clone(), rename(&m.target)))
                .collect(),
        },
    }
}

fn check_refs(
    geometry: &Geometry,
    primitives: &BTreeMap<PrimitiveId, Primitive>,
) -> Result<(), TransportError> {
    for target in geometry.references() {
        if !primitives.get(&target).is_some_and(|p| !p.is_deleted()) {
            return Err(TransportError::Server {
                status: 412,
                message: format!("reference to unknown or deleted {target}"),
            });
        }
    }
    Ok(())
}
