//! The graph store: one editable layer of primitives.
//!
//! A [`DataSet`] owns an arena of primitives keyed by id, the
//! [`ReferenceIndex`] derived from their member lists, the selection, the
//! conflict records of the layer and its listeners. Every mutating method
//! validates first and mutates second, so an `Err` leaves the store exactly
//! as it was.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::conflict::{Conflict, ConflictCollection};
use crate::coord::{BBox, LatLon, Projection};
use crate::error::DataSetError;
use crate::event::{DataSetListener, EventQueue, ListenerId};
use crate::id::{PrimitiveId, PrimitiveKind, Version};
use crate::primitive::{Geometry, Member, Primitive};
use crate::refs::ReferenceIndex;
use crate::tags::Tags;

/// How [`DataSet::remove`] treats a primitive that is still referenced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMode {
    /// Fail with `StillReferenced`.
    #[default]
    Reject,
    /// Purge every referrer first, transitively.
    Cascade,
    /// Keep the id as an incomplete placeholder so referrers stay valid.
    MakeIncomplete,
}

/// Whether the layer may be uploaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPolicy {
    #[default]
    Normal,
    /// Upload allowed after explicit confirmation.
    Discouraged,
    Blocked,
}

/// Serializable observable state of a DataSet.
///
/// Primitives and selection are sorted by id; conflicts keep collection
/// order. Two snapshots compare equal iff the stores are observably equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSetSnapshot {
    pub primitives: Vec<Primitive>,
    #[serde(default)]
    pub selection: Vec<PrimitiveId>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub upload_policy: UploadPolicy,
}

/// In-memory store of primitives with referential integrity.
pub struct DataSet {
    primitives: IndexMap<PrimitiveId, Primitive>,
    refs: ReferenceIndex,
    selection: IndexSet<PrimitiveId>,
    conflicts: ConflictCollection,
    upload_policy: UploadPolicy,
    listeners: Vec<(ListenerId, Arc<dyn DataSetListener>)>,
    next_listener: u64,
    /// Next id handed out by `allocate_id`. Always negative.
    next_new_id: i64,
    update_depth: usize,
    pending: EventQueue,
}

impl Default for DataSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSet")
            .field("primitives", &self.primitives.len())
            .field("selection", &self.selection)
            .field("conflicts", &self.conflicts.len())
            .field("upload_policy", &self.upload_policy)
            .field("listeners", &self.listeners.len())
            .field("update_depth", &self.update_depth)
            .finish()
    }
}

impl DataSet {
    pub fn new() -> Self {
        DataSet {
            primitives: IndexMap::new(),
            refs: ReferenceIndex::new(),
            selection: IndexSet::new(),
            conflicts: ConflictCollection::new(),
            upload_policy: UploadPolicy::Normal,
            listeners: Vec::new(),
            next_listener: 0,
            next_new_id: -1,
            update_depth: 0,
            pending: EventQueue::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Loading and snapshots
    // -----------------------------------------------------------------------

    /// Builds a store from a snapshot. The reference index is rebuilt from
    /// scratch and every integrity rule is checked.
    pub fn from_snapshot(snapshot: DataSetSnapshot) -> Result<Self, DataSetError> {
        let mut ds = DataSet::new();
        for p in snapshot.primitives {
            check_identity(&p)?;
            if ds.primitives.contains_key(&p.id()) {
                return Err(DataSetError::DuplicateIdentity { id: p.id() });
            }
            ds.bump_counter(p.id());
            ds.primitives.insert(p.id(), p);
        }
        for p in ds.primitives.values() {
            ds.check_geometry(p.id(), p.is_deleted(), p.geometry())?;
        }
        ds.refs = ReferenceIndex::rebuild(ds.primitives.values());
        for id in snapshot.selection {
            ds.check_selectable(id)?;
            ds.selection.insert(id);
        }
        for conflict in snapshot.conflicts {
            if !ds.primitives.contains_key(&conflict.id) {
                return Err(DataSetError::NotFound { id: conflict.id });
            }
            ds.conflicts.add(conflict)?;
        }
        ds.upload_policy = snapshot.upload_policy;
        Ok(ds)
    }

    pub fn snapshot(&self) -> DataSetSnapshot {
        let mut primitives: Vec<Primitive> = self.primitives.values().cloned().collect();
        primitives.sort_by_key(|p| p.id());
        let mut selection: Vec<PrimitiveId> = self.selection.iter().copied().collect();
        selection.sort();
        DataSetSnapshot {
            primitives,
            selection,
            conflicts: self.conflicts.iter().cloned().collect(),
            upload_policy: self.upload_policy,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: PrimitiveId) -> Option<&Primitive> {
        self.primitives.get(&id)
    }

    pub fn contains(&self, id: PrimitiveId) -> bool {
        self.primitives.contains_key(&id)
    }

    /// Present primitives that are not soft-deleted.
    pub fn primitives(&self) -> impl Iterator<Item = &Primitive> {
        self.primitives.values().filter(|p| !p.is_deleted())
    }

    /// Every present primitive, including soft-deleted ones.
    pub fn all_primitives(&self) -> impl Iterator<Item = &Primitive> {
        self.primitives.values()
    }

    /// Composites whose lists mention `id`, deleted ones included.
    pub fn referrers(&self, id: PrimitiveId) -> &[PrimitiveId] {
        self.refs.referrers(id)
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn conflicts(&self) -> &ConflictCollection {
        &self.conflicts
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        self.upload_policy
    }

    pub fn set_upload_policy(&mut self, policy: UploadPolicy) {
        self.upload_policy = policy;
    }

    /// Bounding box of a primitive's geometry. `None` for primitives with no
    /// known coordinates.
    pub fn bbox_of(&self, id: PrimitiveId) -> Option<BBox> {
        let mut visited = HashSet::new();
        self.bbox_inner(id, &mut visited)
    }

    fn bbox_inner(&self, id: PrimitiveId, visited: &mut HashSet<PrimitiveId>) -> Option<BBox> {
        if !visited.insert(id) {
            return None;
        }
        let p = self.primitives.get(&id)?;
        match p.geometry() {
            Geometry::Point { coord } => coord.map(BBox::from_point),
            Geometry::Line { nodes } => {
                let mut coords = nodes
                    .iter()
                    .filter_map(|n| self.primitives.get(n).and_then(Primitive::coord));
                let mut bbox = BBox::from_point(coords.next()?);
                for c in coords {
                    bbox.extend(c);
                }
                Some(bbox)
            }
            Geometry::Relation { members } => members
                .iter()
                .filter_map(|m| self.bbox_inner(m.target, visited))
                .reduce(|a, b| a.union(&b)),
        }
    }

    /// Non-deleted primitives whose bounding box intersects `area`, sorted.
    pub fn search(&self, area: &BBox) -> Vec<PrimitiveId> {
        let mut hits: Vec<PrimitiveId> = self
            .primitives()
            .filter(|p| self.bbox_of(p.id()).is_some_and(|b| b.intersects(area)))
            .map(Primitive::id)
            .collect();
        hits.sort();
        hits
    }

    /// Closest non-deleted point to `at` in projected space, within
    /// `max_distance` projected units.
    pub fn nearest_point(
        &self,
        at: LatLon,
        projection: &dyn Projection,
        max_distance: f64,
    ) -> Option<PrimitiveId> {
        let origin = projection.project(at);
        self.primitives()
            .filter_map(|p| p.coord().map(|c| (p.id(), projection.project(c).distance(&origin))))
            .filter(|(_, d)| *d <= max_distance)
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Hands out a fresh negative id. A single counter serves all kinds, so
    /// the numeric part is unique across the layer and never reused.
    pub fn allocate_id(&mut self, kind: PrimitiveKind) -> PrimitiveId {
        let id = PrimitiveId::new(kind, self.next_new_id);
        self.next_new_id -= 1;
        id
    }

    fn bump_counter(&mut self, id: PrimitiveId) {
        if id.id <= self.next_new_id {
            self.next_new_id = id.id - 1;
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Inserts a primitive. Its references must already be present; a
    /// non-deleted primitive may not reference deleted ones.
    pub fn add(&mut self, primitive: Primitive) -> Result<(), DataSetError> {
        check_identity(&primitive)?;
        let id = primitive.id();
        if self.primitives.contains_key(&id) {
            return Err(DataSetError::DuplicateIdentity { id });
        }
        self.check_geometry(id, primitive.is_deleted(), primitive.geometry())?;

        self.bump_counter(id);
        self.refs.link(id, primitive.referenced_ids().iter());
        self.primitives.insert(id, primitive);
        self.pending.added(id);
        self.flush();
        Ok(())
    }

    /// Permanently purges `id`. Returns the pre-images of everything purged
    /// or replaced, in the order it happened.
    pub fn remove(&mut self, id: PrimitiveId, mode: RemovalMode) -> Result<Vec<Primitive>, DataSetError> {
        if !self.primitives.contains_key(&id) {
            return Err(DataSetError::NotFound { id });
        }
        // A relation listing itself does not keep itself alive.
        let referrers: Vec<PrimitiveId> = self
            .refs
            .referrers(id)
            .iter()
            .copied()
            .filter(|r| *r != id)
            .collect();
        let mut removed = Vec::new();
        match mode {
            RemovalMode::Reject => {
                if !referrers.is_empty() {
                    return Err(DataSetError::StillReferenced { id, referrers });
                }
                removed.extend(self.purge_entry(id));
            }
            RemovalMode::Cascade => {
                for target in self.cascade_order(id) {
                    removed.extend(self.purge_entry(target));
                }
            }
            RemovalMode::MakeIncomplete => {
                if referrers.is_empty() {
                    removed.extend(self.purge_entry(id));
                } else if let Some(old) = self.replace_unchecked(Primitive::incomplete(id)) {
                    self.deselect(id);
                    removed.push(old);
                }
            }
        }
        self.flush();
        Ok(removed)
    }

    // Post-order over referrers: every composite precedes what it references.
    fn cascade_order(&self, root: PrimitiveId) -> Vec<PrimitiveId> {
        fn visit(
            ds: &DataSet,
            id: PrimitiveId,
            seen: &mut HashSet<PrimitiveId>,
            out: &mut Vec<PrimitiveId>,
        ) {
            if !seen.insert(id) {
                return;
            }
            for r in ds.refs.referrers(id) {
                visit(ds, *r, seen, out);
            }
            out.push(id);
        }
        let mut out = Vec::new();
        visit(self, root, &mut HashSet::new(), &mut out);
        out
    }

    fn purge_entry(&mut self, id: PrimitiveId) -> Option<Primitive> {
        let p = self.primitives.swap_remove(&id)?;
        self.refs.unlink(id, p.referenced_ids().iter());
        self.deselect(id);
        if self.conflicts.remove(id).is_some() {
            self.pending.conflict_removed(id);
        }
        self.pending.removed(id);
        Some(p)
    }

    /// Soft delete or undelete. Returns the previous flag.
    pub fn set_deleted(&mut self, id: PrimitiveId, deleted: bool) -> Result<bool, DataSetError> {
        let p = self.require(id)?;
        let was = p.is_deleted();
        if was == deleted {
            return Ok(was);
        }
        if deleted {
            self.check_deletable(id)?;
        } else {
            self.check_geometry(id, false, p.geometry())?;
        }

        if let Some(p) = self.primitives.get_mut(&id) {
            p.set_deleted(deleted);
        }
        if deleted {
            self.deselect(id);
        }
        self.pending.changed(id);
        self.flush();
        Ok(was)
    }

    /// Replaces the whole tag map. Returns the previous tags.
    pub fn set_tags(&mut self, id: PrimitiveId, tags: Tags) -> Result<Tags, DataSetError> {
        self.require(id)?;
        let changed = self.primitives.get(&id).is_some_and(|p| p.tags() != &tags);
        let old = match self.primitives.get_mut(&id) {
            Some(p) => p.set_tags(tags),
            None => return Err(DataSetError::NotFound { id }),
        };
        if changed {
            self.pending.tags(id);
        }
        self.flush();
        Ok(old)
    }

    /// Sets the coordinate of a point. Returns the previous coordinate.
    /// Soft-deleted points cannot be moved.
    pub fn set_coord(&mut self, id: PrimitiveId, coord: LatLon) -> Result<Option<LatLon>, DataSetError> {
        if self.require_kind(id, PrimitiveKind::Point)?.is_deleted() {
            return Err(DataSetError::Deleted { id });
        }
        let old = match self.primitives.get_mut(&id) {
            Some(p) => p.set_geometry(Geometry::Point { coord: Some(coord) }),
            None => return Err(DataSetError::NotFound { id }),
        };
        self.pending.changed(id);
        self.flush();
        Ok(match old {
            Geometry::Point { coord } => coord,
            _ => None,
        })
    }

    /// Replaces a line's node list. Returns the previous list.
    pub fn set_line_nodes(
        &mut self,
        id: PrimitiveId,
        nodes: Vec<PrimitiveId>,
    ) -> Result<Vec<PrimitiveId>, DataSetError> {
        let geometry = Geometry::Line { nodes };
        self.set_composite_geometry(id, PrimitiveKind::Line, geometry)
            .map(|old| match old {
                Geometry::Line { nodes } => nodes,
                _ => Vec::new(),
            })
    }

    /// Replaces a relation's member list. Returns the previous list.
    pub fn set_relation_members(
        &mut self,
        id: PrimitiveId,
        members: Vec<Member>,
    ) -> Result<Vec<Member>, DataSetError> {
        let geometry = Geometry::Relation { members };
        self.set_composite_geometry(id, PrimitiveKind::Relation, geometry)
            .map(|old| match old {
                Geometry::Relation { members } => members,
                _ => Vec::new(),
            })
    }

    fn set_composite_geometry(
        &mut self,
        id: PrimitiveId,
        kind: PrimitiveKind,
        geometry: Geometry,
    ) -> Result<Geometry, DataSetError> {
        let p = self.require_kind(id, kind)?;
        self.check_geometry(id, p.is_deleted(), &geometry)?;
        let old_refs = p.referenced_ids();
        let new_refs: BTreeSet<PrimitiveId> = geometry.references().into_iter().collect();

        let old = match self.primitives.get_mut(&id) {
            Some(p) => {
                let old = p.set_geometry(geometry);
                p.set_incomplete(false);
                old
            }
            None => return Err(DataSetError::NotFound { id }),
        };
        self.refs.relink(id, &old_refs, &new_refs);
        self.pending.changed(id);
        self.flush();
        Ok(old)
    }

    /// Sets the modified flag. Returns the previous value. Publishes nothing.
    pub fn set_modified(&mut self, id: PrimitiveId, modified: bool) -> Result<bool, DataSetError> {
        match self.primitives.get_mut(&id) {
            Some(p) => {
                let was = p.is_modified();
                p.set_modified(modified);
                Ok(was)
            }
            None => Err(DataSetError::NotFound { id }),
        }
    }

    /// Sets the server version. Returns the previous version.
    pub fn set_version(&mut self, id: PrimitiveId, version: Version) -> Result<Version, DataSetError> {
        match self.primitives.get_mut(&id) {
            Some(p) => {
                let was = p.version();
                p.set_version(version);
                Ok(was)
            }
            None => Err(DataSetError::NotFound { id }),
        }
    }

    /// Full content replacement of a present primitive. Returns the
    /// pre-image.
    pub fn replace(&mut self, primitive: Primitive) -> Result<Primitive, DataSetError> {
        check_identity(&primitive)?;
        let id = primitive.id();
        let current = self.require(id)?;
        if primitive.is_deleted() && !current.is_deleted() {
            self.check_deletable(id)?;
        }
        self.check_geometry(id, primitive.is_deleted(), primitive.geometry())?;

        let deleted = primitive.is_deleted();
        let old = self
            .replace_unchecked(primitive)
            .ok_or(DataSetError::NotFound { id })?;
        if deleted {
            self.deselect(id);
        }
        self.flush();
        Ok(old)
    }

    // Swaps the stored primitive and fixes the index. Caller validates.
    fn replace_unchecked(&mut self, primitive: Primitive) -> Option<Primitive> {
        let id = primitive.id();
        let new_refs = primitive.referenced_ids();
        let slot = self.primitives.get_mut(&id)?;
        let old = std::mem::replace(slot, primitive);
        self.refs.relink(id, &old.referenced_ids(), &new_refs);

        let new = &self.primitives[&id];
        if old.geometry() != new.geometry()
            || old.is_deleted() != new.is_deleted()
            || old.is_incomplete() != new.is_incomplete()
        {
            self.pending.changed(id);
        }
        if old.tags() != new.tags() {
            self.pending.tags(id);
        }
        Some(old)
    }

    /// Puts the slot for `id` into exactly the given state: inserted,
    /// replaced, or purged when `state` is `None`. Returns the previous state.
    /// This is the primitive operation used by undo.
    pub fn restore(
        &mut self,
        id: PrimitiveId,
        state: Option<Primitive>,
    ) -> Result<Option<Primitive>, DataSetError> {
        if let Some(p) = &state {
            if p.id() != id {
                return Err(DataSetError::Inconsistent {
                    reason: format!("cannot restore {} into slot {id}", p.id()),
                });
            }
        }
        match (self.primitives.contains_key(&id), state) {
            (false, None) => Ok(None),
            (false, Some(p)) => self.add(p).map(|()| None),
            (true, Some(p)) => self.replace(p).map(Some),
            (true, None) => {
                let mut removed = self.remove(id, RemovalMode::Reject)?;
                Ok(removed.pop())
            }
        }
    }

    /// Re-keys a freshly uploaded primitive under its server id and version.
    /// Every referrer's list is rewritten in the same call.
    pub fn assign_server_id(
        &mut self,
        old: PrimitiveId,
        server_id: i64,
        version: Version,
    ) -> Result<PrimitiveId, DataSetError> {
        let new = PrimitiveId::new(old.kind, server_id);
        if server_id <= 0 {
            return Err(DataSetError::InvalidId { id: new });
        }
        self.require(old)?;
        if self.primitives.contains_key(&new) {
            return Err(DataSetError::DuplicateIdentity { id: new });
        }

        let Some(mut p) = self.primitives.swap_remove(&old) else {
            return Err(DataSetError::NotFound { id: old });
        };
        let targets = p.referenced_ids();
        self.refs.unlink(old, targets.iter());
        self.refs.link(new, targets.iter());
        let referrers = self.refs.referrers(old).to_vec();
        self.refs.rename_target(old, new);

        p.set_id(new);
        p.set_version(version);
        p.set_modified(false);
        self.primitives.insert(new, p);

        for r in referrers {
            if let Some(composite) = self.primitives.get_mut(&r) {
                let rewritten = match composite.geometry() {
                    Geometry::Line { nodes } => Geometry::Line {
                        nodes: nodes.iter().map(|n| if *n == old { new } else { *n }).collect(),
                    },
                    Geometry::Relation { members } => Geometry::Relation {
                        members: members
                            .iter()
                            .map(|m| {
                                let target = if m.target == old { new } else { m.target };
                                Member::new(m.role.clone(), target)
                            })
                            .collect(),
                    },
                    point => point.clone(),
                };
                composite.set_geometry(rewritten);
                self.pending.changed(r);
            }
        }

        if let Some(pos) = self.selection.get_index_of(&old) {
            self.selection.shift_remove(&old);
            self.selection.shift_insert(pos, new);
            self.pending.selection();
        }
        self.pending.removed(old);
        self.pending.added(new);
        self.flush();
        Ok(new)
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    /// Records a conflict for a present primitive.
    pub fn add_conflict(&mut self, conflict: Conflict) -> Result<(), DataSetError> {
        self.require(conflict.id)?;
        let id = conflict.id;
        self.conflicts.add(conflict)?;
        self.pending.conflict_added(id);
        self.flush();
        Ok(())
    }

    /// Removes the record for `id`, returning it with its former position.
    pub fn remove_conflict(&mut self, id: PrimitiveId) -> Option<(usize, Conflict)> {
        let pos = self.conflicts.position(id)?;
        let conflict = self.conflicts.remove(id)?;
        self.pending.conflict_removed(id);
        self.flush();
        Some((pos, conflict))
    }

    /// Re-inserts a record at a given position (undo of a resolution).
    pub fn insert_conflict_at(&mut self, index: usize, conflict: Conflict) -> Result<(), DataSetError> {
        self.require(conflict.id)?;
        if self.conflicts.contains(conflict.id) {
            return Err(DataSetError::DuplicateConflict { id: conflict.id });
        }
        let id = conflict.id;
        self.conflicts.insert_at(index, conflict);
        self.pending.conflict_added(id);
        self.flush();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Selected ids in selection order.
    pub fn selected(&self) -> Vec<PrimitiveId> {
        self.selection.iter().copied().collect()
    }

    pub fn is_selected(&self, id: PrimitiveId) -> bool {
        self.selection.contains(&id)
    }

    /// Replaces the selection. Fails without change if any id is not a
    /// present, non-deleted primitive.
    pub fn set_selected(&mut self, ids: impl IntoIterator<Item = PrimitiveId>) -> Result<(), DataSetError> {
        let ids: Vec<PrimitiveId> = ids.into_iter().collect();
        for id in &ids {
            self.check_selectable(*id)?;
        }
        let next: IndexSet<PrimitiveId> = ids.into_iter().collect();
        if next != self.selection {
            self.selection = next;
            self.pending.selection();
        }
        self.flush();
        Ok(())
    }

    pub fn add_selected(&mut self, ids: impl IntoIterator<Item = PrimitiveId>) -> Result<(), DataSetError> {
        let ids: Vec<PrimitiveId> = ids.into_iter().collect();
        for id in &ids {
            self.check_selectable(*id)?;
        }
        for id in ids {
            if self.selection.insert(id) {
                self.pending.selection();
            }
        }
        self.flush();
        Ok(())
    }

    /// Flips selection membership of `id`. Returns the new membership.
    pub fn toggle_selected(&mut self, id: PrimitiveId) -> Result<bool, DataSetError> {
        let now = if self.selection.shift_remove(&id) {
            false
        } else {
            self.check_selectable(id)?;
            self.selection.insert(id);
            true
        };
        self.pending.selection();
        self.flush();
        Ok(now)
    }

    pub fn clear_selection(&mut self) {
        if !self.selection.is_empty() {
            self.selection.clear();
            self.pending.selection();
        }
        self.flush();
    }

    fn deselect(&mut self, id: PrimitiveId) {
        if self.selection.shift_remove(&id) {
            self.pending.selection();
        }
    }

    fn check_selectable(&self, id: PrimitiveId) -> Result<(), DataSetError> {
        match self.primitives.get(&id) {
            Some(p) if !p.is_deleted() => Ok(()),
            _ => Err(DataSetError::NotFound { id }),
        }
    }

    // -----------------------------------------------------------------------
    // Batching and listeners
    // -----------------------------------------------------------------------

    pub fn add_listener(&mut self, listener: Arc<dyn DataSetListener>) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Opens a batch. Batches nest; only the outermost close publishes.
    pub fn begin_update(&mut self) {
        self.update_depth += 1;
    }

    /// Closes a batch. Unbalanced calls are ignored.
    pub fn end_update(&mut self) {
        self.update_depth = self.update_depth.saturating_sub(1);
        self.flush();
    }

    pub fn in_update(&self) -> bool {
        self.update_depth > 0
    }

    /// Opens a batch closed when the guard drops.
    pub fn update(&mut self) -> UpdateGuard<'_> {
        self.begin_update();
        UpdateGuard { ds: self }
    }

    fn flush(&mut self) {
        if self.update_depth > 0 {
            return;
        }
        let selection = &self.selection;
        let events = self.pending.drain(|| selection.iter().copied().collect());
        for event in &events {
            for (_, listener) in &self.listeners {
                listener.on_event(event);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn require(&self, id: PrimitiveId) -> Result<&Primitive, DataSetError> {
        self.primitives.get(&id).ok_or(DataSetError::NotFound { id })
    }

    fn require_kind(&self, id: PrimitiveId, kind: PrimitiveKind) -> Result<&Primitive, DataSetError> {
        if id.kind != kind {
            return Err(DataSetError::KindMismatch { id, expected: kind });
        }
        self.require(id)
    }

    // Soft delete is allowed only when no live composite still uses `id`.
    fn check_deletable(&self, id: PrimitiveId) -> Result<(), DataSetError> {
        let live: Vec<PrimitiveId> = self
            .refs
            .referrers(id)
            .iter()
            .copied()
            .filter(|r| *r != id && self.primitives.get(r).is_some_and(|p| !p.is_deleted()))
            .collect();
        if live.is_empty() {
            Ok(())
        } else {
            Err(DataSetError::StillReferenced { id, referrers: live })
        }
    }

    fn check_geometry(&self, owner: PrimitiveId, owner_deleted: bool, geometry: &Geometry) -> Result<(), DataSetError> {
        match geometry {
            Geometry::Point { .. } => Ok(()),
            Geometry::Line { nodes } => nodes.iter().try_for_each(|n| {
                if n.kind != PrimitiveKind::Point {
                    return Err(DataSetError::KindMismatch {
                        id: *n,
                        expected: PrimitiveKind::Point,
                    });
                }
                self.check_target(owner, owner_deleted, *n)
            }),
            Geometry::Relation { members } => members
                .iter()
                .filter(|m| m.target != owner)
                .try_for_each(|m| self.check_target(owner, owner_deleted, m.target)),
        }
    }

    fn check_target(&self, owner: PrimitiveId, owner_deleted: bool, target: PrimitiveId) -> Result<(), DataSetError> {
        match self.primitives.get(&target) {
            None => Err(DataSetError::DanglingReference {
                referrer: owner,
                target,
            }),
            Some(t) if t.is_deleted() && !owner_deleted => Err(DataSetError::ReferencesDeleted {
                referrer: owner,
                target,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Full recomputation of every derived structure. Test and load helper.
    pub fn verify_integrity(&self) -> Result<(), DataSetError> {
        if let Some(id) = self.refs.verify(self.primitives.values()) {
            return Err(DataSetError::Inconsistent {
                reason: format!("reference index disagrees with member lists at {id}"),
            });
        }
        for p in self.primitives.values() {
            if p.geometry().kind() != p.kind() {
                return Err(DataSetError::Inconsistent {
                    reason: format!("{} carries a {} payload", p.id(), p.geometry().kind()),
                });
            }
            for target in p.referenced_ids() {
                if !self.primitives.contains_key(&target) {
                    return Err(DataSetError::Inconsistent {
                        reason: format!("{} references missing {target}", p.id()),
                    });
                }
            }
        }
        if let Some(id) = self.selection.iter().find(|id| self.check_selectable(**id).is_err()) {
            return Err(DataSetError::Inconsistent {
                reason: format!("selection contains unavailable {id}"),
            });
        }
        if let Some(c) = self.conflicts.iter().find(|c| !self.primitives.contains_key(&c.id)) {
            return Err(DataSetError::Inconsistent {
                reason: format!("conflict recorded for missing {}", c.id),
            });
        }
        Ok(())
    }
}

fn check_identity(p: &Primitive) -> Result<(), DataSetError> {
    if p.id().id == 0 {
        return Err(DataSetError::InvalidId { id: p.id() });
    }
    if p.geometry().kind() != p.kind() {
        return Err(DataSetError::KindMismatch {
            id: p.id(),
            expected: p.geometry().kind(),
        });
    }
    Ok(())
}

/// RAII batch returned by [`DataSet::update`]. Derefs to the DataSet.
pub struct UpdateGuard<'a> {
    ds: &'a mut DataSet,
}

impl std::ops::Deref for UpdateGuard<'_> {
    type Target = DataSet;

    fn deref(&self) -> &DataSet {
        self.ds
    }
}

impl std::ops::DerefMut for UpdateGuard<'_> {
    fn deref_mut(&mut self) -> &mut DataSet {
        self.ds
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.ds.end_update();
    }
}
