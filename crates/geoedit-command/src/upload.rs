//! Partitioning local changes for upload and integrating the server's answer.
//!
//! An [`UploadSet`] is computed from the store, never edited by hand. Its
//! order is the order the server must apply it in: every creation follows
//! the creations it references, every deletion precedes the deletions it
//! references.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use geoedit_core::{
    ConflictCollection, DataSet, DataSetError, Primitive, PrimitiveId, PrimitiveKind, RemovalMode,
    Tags, Version,
};

use crate::error::UploadError;

/// Local changes split by what the server has to do with them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadSet {
    pub to_create: Vec<Primitive>,
    pub to_modify: Vec<Primitive>,
    pub to_delete: Vec<Primitive>,
}

impl UploadSet {
    /// Builds the upload set for `ds`.
    ///
    /// Creations: new, not deleted, not incomplete. Modifications: modified,
    /// not new, not deleted. Deletions: deleted, modified, not new. New
    /// primitives that were deleted again before upload are left out.
    pub fn from_dataset(ds: &DataSet) -> Result<Self, UploadError> {
        let mut creates: Vec<&Primitive> = Vec::new();
        let mut modifies: Vec<&Primitive> = Vec::new();
        let mut deletes: Vec<&Primitive> = Vec::new();
        for p in ds.all_primitives() {
            if p.is_incomplete() {
                continue;
            }
            match (p.is_new(), p.is_deleted()) {
                (true, false) => creates.push(p),
                (true, true) => {}
                (false, false) if p.is_modified() => modifies.push(p),
                (false, true) if p.is_modified() => deletes.push(p),
                _ => {}
            }
        }
        creates.sort_by_key(|p| p.id());
        modifies.sort_by_key(|p| p.id());
        deletes.sort_by_key(|p| p.id());

        Ok(UploadSet {
            to_create: order_creations(creates)?,
            to_modify: modifies.into_iter().cloned().collect(),
            to_delete: order_deletions(deletes),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_modify.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_create.len() + self.to_modify.len() + self.to_delete.len()
    }

    /// Every id in the set, in upload order.
    pub fn ids(&self) -> Vec<PrimitiveId> {
        self.to_create
            .iter()
            .chain(&self.to_modify)
            .chain(&self.to_delete)
            .map(Primitive::id)
            .collect()
    }

    /// Ids of the set that have an unresolved conflict.
    pub fn participates_in_conflict(&self, conflicts: &ConflictCollection) -> Vec<PrimitiveId> {
        conflicts.participates(&self.ids())
    }

    /// The wire form of this set.
    pub fn to_changeset(&self, tags: Tags) -> Changeset {
        let operations = self
            .to_create
            .iter()
            .map(|p| ChangesetOp::Create { primitive: p.clone() })
            .chain(self.to_modify.iter().map(|p| ChangesetOp::Modify { primitive: p.clone() }))
            .chain(self.to_delete.iter().map(|p| ChangesetOp::Delete {
                id: p.id(),
                version: p.version(),
            }))
            .collect();
        Changeset { tags, operations }
    }
}

// Points, then lines, then relations. New relations referencing other new
// relations come after them.
fn order_creations(creates: Vec<&Primitive>) -> Result<Vec<Primitive>, UploadError> {
    let (relations, mut ordered): (Vec<&Primitive>, Vec<&Primitive>) = creates
        .into_iter()
        .partition(|p| p.kind() == PrimitiveKind::Relation);
    ordered.sort_by_key(|p| (p.kind().rank(), p.id()));

    let graph = relation_graph(&relations);
    match toposort(&graph, None) {
        // Edges run referrer -> target, so targets go first.
        Ok(sorted) => ordered.extend(sorted.into_iter().rev().map(|n| graph[n])),
        Err(_) => {
            let mut ids: Vec<PrimitiveId> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1)
                .flatten()
                .map(|n| graph[n].id())
                .collect();
            ids.sort();
            return Err(UploadError::CyclicDependency { ids });
        }
    }
    Ok(ordered.into_iter().cloned().collect())
}

// Relations first with referrers ahead of their member relations, then
// lines, then points. Cycles among deleted relations are fine: any order
// inside a strongly connected component works once it is deleted whole.
fn order_deletions(deletes: Vec<&Primitive>) -> Vec<Primitive> {
    let (relations, mut rest): (Vec<&Primitive>, Vec<&Primitive>) = deletes
        .into_iter()
        .partition(|p| p.kind() == PrimitiveKind::Relation);
    rest.sort_by_key(|p| (std::cmp::Reverse(p.kind().rank()), p.id()));

    let graph = relation_graph(&relations);
    // tarjan_scc yields components targets-first; reverse for referrers-first.
    let mut ordered: Vec<&Primitive> = Vec::with_capacity(relations.len() + rest.len());
    for scc in tarjan_scc(&graph).into_iter().rev() {
        let mut component: Vec<&Primitive> = scc.into_iter().map(|n| graph[n]).collect();
        component.sort_by_key(|p| p.id());
        ordered.extend(component);
    }
    ordered.extend(rest);
    ordered.into_iter().cloned().collect()
}

// Directed graph over `relations`: an edge r -> m when r has member m.
// Self-membership adds no edge.
fn relation_graph<'a>(relations: &[&'a Primitive]) -> DiGraph<&'a Primitive, ()> {
    let mut graph = DiGraph::new();
    let mut index: HashMap<PrimitiveId, NodeIndex> = HashMap::new();
    for p in relations {
        index.insert(p.id(), graph.add_node(*p));
    }
    for p in relations {
        let from = index[&p.id()];
        for target in p.referenced_ids() {
            if target == p.id() {
                continue;
            }
            if let Some(&to) = index.get(&target) {
                graph.add_edge(from, to, ());
            }
        }
    }
    graph
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One upload as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub tags: Tags,
    pub operations: Vec<ChangesetOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangesetOp {
    Create { primitive: Primitive },
    Modify { primitive: Primitive },
    Delete { id: PrimitiveId, version: Version },
}

impl ChangesetOp {
    pub fn id(&self) -> PrimitiveId {
        match self {
            ChangesetOp::Create { primitive } | ChangesetOp::Modify { primitive } => primitive.id(),
            ChangesetOp::Delete { id, .. } => *id,
        }
    }
}

/// What the server reports after accepting a changeset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    /// `(placeholder id, server id, version)` per created primitive.
    pub created: Vec<(PrimitiveId, i64, Version)>,
    /// `(id, new version)` per modified primitive.
    pub modified: Vec<(PrimitiveId, Version)>,
    pub deleted: Vec<PrimitiveId>,
}

impl UploadResult {
    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Integrates the server's answer to `sent` into `ds` as one batch.
///
/// Created primitives are re-keyed under their server ids (referrers are
/// rewritten), modified ones take the new version, and confirmed deletions
/// are purged. A primitive edited again after `sent` was computed keeps its
/// modified flag so the newer edit goes out with the next upload. The result
/// is validated before anything changes; a rejected result leaves `ds`
/// untouched.
///
/// This bypasses the undo history. Entries captured before the upload that
/// touch re-keyed or purged primitives fail on undo.
pub fn apply_upload_result(
    ds: &mut DataSet,
    sent: &UploadSet,
    result: &UploadResult,
) -> Result<(), UploadError> {
    apply_upload_result_with(ds, sent, result, RemovalMode::Cascade)
}

/// [`apply_upload_result`] with an explicit removal mode for confirmed
/// deletions.
pub fn apply_upload_result_with(
    ds: &mut DataSet,
    sent: &UploadSet,
    result: &UploadResult,
    removal: RemovalMode,
) -> Result<(), UploadError> {
    validate_result(ds, result, removal)?;
    let edited = edited_since(ds, sent, result);

    let mut ds = ds.update();
    for (old, server_id, version) in &result.created {
        let new = ds.assign_server_id(*old, *server_id, *version)?;
        if edited.contains(old) {
            ds.set_modified(new, true)?;
        }
    }
    for (id, version) in &result.modified {
        ds.set_version(*id, *version)?;
        if !edited.contains(id) {
            ds.set_modified(*id, false)?;
        }
    }
    for id in &result.deleted {
        // An earlier cascade may already have taken it.
        if ds.contains(*id) {
            ds.remove(*id, removal)?;
        }
    }
    Ok(())
}

// Created or modified ids whose local content no longer matches what was
// sent. Ids the server reports but that were never sent count as edited.
fn edited_since(ds: &DataSet, sent: &UploadSet, result: &UploadResult) -> HashSet<PrimitiveId> {
    let sent: HashMap<PrimitiveId, &Primitive> = sent
        .to_create
        .iter()
        .chain(&sent.to_modify)
        .map(|p| (p.id(), p))
        .collect();
    result
        .created
        .iter()
        .map(|(old, _, _)| *old)
        .chain(result.modified.iter().map(|(id, _)| *id))
        .filter(|id| match (ds.get(*id), sent.get(id)) {
            (Some(now), Some(then)) => !now.content_equals(then),
            _ => true,
        })
        .collect()
}

// Everything `apply_upload_result_with` could trip over, checked up front.
fn validate_result(ds: &DataSet, result: &UploadResult, removal: RemovalMode) -> Result<(), UploadError> {
    let mut rekeyed: HashSet<PrimitiveId> = HashSet::new();
    let mut assigned: HashSet<PrimitiveId> = HashSet::new();
    for (old, server_id, _) in &result.created {
        let new = PrimitiveId::new(old.kind, *server_id);
        if !old.is_new() || *server_id <= 0 {
            return Err(DataSetError::InvalidId { id: new }.into());
        }
        if !ds.contains(*old) {
            return Err(DataSetError::NotFound { id: *old }.into());
        }
        if !rekeyed.insert(*old) {
            return Err(UploadError::InvalidResult {
                reason: format!("{old} is created twice"),
            });
        }
        if ds.contains(new) || !assigned.insert(new) {
            return Err(DataSetError::DuplicateIdentity { id: new }.into());
        }
    }
    for id in result.modified.iter().map(|(id, _)| id).chain(&result.deleted) {
        if rekeyed.contains(id) {
            return Err(UploadError::InvalidResult {
                reason: format!("{id} is reported both created and changed"),
            });
        }
        if !ds.contains(*id) {
            return Err(DataSetError::NotFound { id: *id }.into());
        }
    }
    if removal == RemovalMode::Reject {
        // Every referrer of a deletion must be purged before it.
        let mut purged: HashSet<PrimitiveId> = HashSet::new();
        for id in &result.deleted {
            let referrers: Vec<PrimitiveId> = ds
                .referrers(*id)
                .iter()
                .copied()
                .filter(|r| r != id && !purged.contains(r))
                .collect();
            if !referrers.is_empty() {
                return Err(DataSetError::StillReferenced { id: *id, referrers }.into());
            }
            purged.insert(*id);
        }
    }
    Ok(())
}
