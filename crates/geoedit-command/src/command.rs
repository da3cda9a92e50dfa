//! Reversible edit commands.
//!
//! [`EditCommand`] describes a mutation as data. [`CommandRecord`] executes
//! it against a [`DataSet`], capturing a pre-image of every slot it touches,
//! and restores those pre-images in reverse order on undo. Execution and undo
//! are all-or-nothing: a failure part-way through replays what was already
//! done in reverse before the error is returned.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use geoedit_core::{
    Conflict, ConflictCollection, DataSet, DataSetError, Geometry, LatLon, Member, Primitive,
    PrimitiveId, PrimitiveKind, RemovalMode, TagChange, Tags,
};

use crate::error::EditError;

/// How [`EditCommand::delete`] treats live composites referencing the
/// requested primitives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Fail with `StillReferenced` if anything outside the set uses them.
    #[default]
    Strict,
    /// Delete every live referrer too, transitively.
    Cascade,
}

/// A reversible mutation of a DataSet.
///
/// Commands that edit user content set the `modified` flag of what they
/// touch. `Add`, `Replace` and `ResolveConflict` store their primitive
/// verbatim, flags included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EditCommand {
    /// Insert a new primitive.
    Add { primitive: Primitive },
    /// Soft-delete, in the given order (composites first).
    Delete { ids: Vec<PrimitiveId> },
    /// Apply tag edits to every listed primitive.
    ChangeTags {
        ids: Vec<PrimitiveId>,
        changes: Vec<TagChange>,
    },
    /// Replace the whole tag map of one primitive.
    SetTags { id: PrimitiveId, tags: Tags },
    /// Translate points; lines and relations move the points they contain.
    Move {
        ids: Vec<PrimitiveId>,
        dlat: f64,
        dlon: f64,
    },
    SetCoord { id: PrimitiveId, coord: LatLon },
    ChangeNodes {
        id: PrimitiveId,
        nodes: Vec<PrimitiveId>,
    },
    ChangeMembers { id: PrimitiveId, members: Vec<Member> },
    /// Full content replacement of a present primitive.
    Replace { primitive: Primitive },
    /// Permanent removal, undoable.
    Purge {
        ids: Vec<PrimitiveId>,
        mode: RemovalMode,
    },
    AddConflict { conflict: Conflict },
    /// Drop the conflict record and install the resolved content.
    ResolveConflict {
        id: PrimitiveId,
        resolved: Primitive,
    },
    /// Children run forward and undo in strict reverse order.
    Sequence {
        description: String,
        commands: Vec<EditCommand>,
    },
}

impl EditCommand {
    pub fn sequence(description: impl Into<String>, commands: Vec<EditCommand>) -> Self {
        EditCommand::Sequence {
            description: description.into(),
            commands,
        }
    }

    /// Builds a `Delete` for `ids`, resolving referrers at construction time.
    ///
    /// Already-deleted primitives are skipped. The resulting id list is
    /// ordered so every composite precedes the primitives it references.
    pub fn delete(ds: &DataSet, ids: &[PrimitiveId], mode: DeleteMode) -> Result<Self, EditError> {
        let mut set = BTreeSet::new();
        for id in ids {
            let p = ds.get(*id).ok_or(DataSetError::NotFound { id: *id })?;
            if !p.is_deleted() {
                set.insert(*id);
            }
        }

        let live_referrers = |id: PrimitiveId| -> Vec<PrimitiveId> {
            ds.referrers(id)
                .iter()
                .copied()
                .filter(|r| *r != id && ds.get(*r).is_some_and(|p| !p.is_deleted()))
                .collect()
        };

        match mode {
            DeleteMode::Cascade => {
                let mut work: Vec<PrimitiveId> = set.iter().copied().collect();
                while let Some(id) = work.pop() {
                    for r in live_referrers(id) {
                        if set.insert(r) {
                            work.push(r);
                        }
                    }
                }
            }
            DeleteMode::Strict => {
                for id in &set {
                    let outside: Vec<PrimitiveId> = live_referrers(*id)
                        .into_iter()
                        .filter(|r| !set.contains(r))
                        .collect();
                    if !outside.is_empty() {
                        return Err(DataSetError::StillReferenced {
                            id: *id,
                            referrers: outside,
                        }
                        .into());
                    }
                }
            }
        }
        if set.is_empty() {
            return Err(EditError::InvalidCommand {
                reason: "nothing to delete".to_string(),
            });
        }

        // Post-order over referrers inside the set.
        fn visit(
            id: PrimitiveId,
            set: &BTreeSet<PrimitiveId>,
            referrers: &dyn Fn(PrimitiveId) -> Vec<PrimitiveId>,
            seen: &mut HashSet<PrimitiveId>,
            out: &mut Vec<PrimitiveId>,
        ) {
            if !seen.insert(id) {
                return;
            }
            for r in referrers(id) {
                if set.contains(&r) {
                    visit(r, set, referrers, seen, out);
                }
            }
            out.push(id);
        }
        let mut seen = HashSet::new();
        let mut ordered = Vec::with_capacity(set.len());
        for id in set.iter().rev() {
            visit(*id, &set, &live_referrers, &mut seen, &mut ordered);
        }
        Ok(EditCommand::Delete { ids: ordered })
    }

    /// Splits `line` at the inner node `at`.
    ///
    /// The original keeps the head up to and including `at`; a new line
    /// `new_id` gets the tail with a copy of the tags. Every relation that
    /// lists the original gets the new line right after each such membership,
    /// with the same role.
    pub fn split_line(
        ds: &DataSet,
        line: PrimitiveId,
        at: PrimitiveId,
        new_id: PrimitiveId,
    ) -> Result<Self, EditError> {
        if line.kind != PrimitiveKind::Line {
            return Err(DataSetError::KindMismatch {
                id: line,
                expected: PrimitiveKind::Line,
            }
            .into());
        }
        if new_id.kind != PrimitiveKind::Line || ds.contains(new_id) {
            return Err(EditError::InvalidCommand {
                reason: format!("{new_id} is not a free line id"),
            });
        }
        let original = ds.get(line).ok_or(DataSetError::NotFound { id: line })?;
        if original.is_deleted() {
            return Err(EditError::InvalidCommand {
                reason: format!("{line} is deleted"),
            });
        }
        let nodes = original.nodes();
        let Some(pos) = nodes
            .iter()
            .enumerate()
            .skip(1)
            .take(nodes.len().saturating_sub(2))
            .find(|(_, n)| **n == at)
            .map(|(i, _)| i)
        else {
            return Err(EditError::InvalidCommand {
                reason: format!("{at} is not an inner node of {line}"),
            });
        };

        let head = nodes[..=pos].to_vec();
        let tail = nodes[pos..].to_vec();
        let new_line = Primitive::with_geometry(new_id, Geometry::Line { nodes: tail })
            .with_tags(original.tags().clone())
            .with_modified(true);

        let mut commands = vec![
            EditCommand::Add {
                primitive: new_line,
            },
            EditCommand::ChangeNodes {
                id: line,
                nodes: head,
            },
        ];
        for r in ds.referrers(line) {
            let Some(relation) = ds.get(*r) else { continue };
            if relation.kind() != PrimitiveKind::Relation || relation.is_deleted() {
                continue;
            }
            let mut members = Vec::with_capacity(relation.members().len() + 1);
            for m in relation.members() {
                members.push(m.clone());
                if m.target == line {
                    members.push(Member::new(m.role.clone(), new_id));
                }
            }
            commands.push(EditCommand::ChangeMembers { id: *r, members });
        }
        Ok(EditCommand::sequence(format!("Split {line}"), commands))
    }

    /// One-line human-readable summary.
    pub fn describe(&self) -> String {
        match self {
            EditCommand::Add { primitive } => format!("Add {}", primitive.id()),
            EditCommand::Delete { ids } => format!("Delete {}", subject(ids)),
            EditCommand::ChangeTags { ids, .. } => format!("Change tags of {}", subject(ids)),
            EditCommand::SetTags { id, .. } => format!("Set tags of {id}"),
            EditCommand::Move { ids, .. } => format!("Move {}", subject(ids)),
            EditCommand::SetCoord { id, .. } => format!("Move {id}"),
            EditCommand::ChangeNodes { id, .. } => format!("Change nodes of {id}"),
            EditCommand::ChangeMembers { id, .. } => format!("Change members of {id}"),
            EditCommand::Replace { primitive } => format!("Replace {}", primitive.id()),
            EditCommand::Purge { ids, .. } => format!("Purge {}", subject(ids)),
            EditCommand::AddConflict { conflict } => format!("Conflict on {}", conflict.id),
            EditCommand::ResolveConflict { id, .. } => format!("Resolve conflict on {id}"),
            EditCommand::Sequence { description, .. } => description.clone(),
        }
    }

    /// Ids named directly by this command and its children, sorted.
    pub fn touched_ids(&self) -> Vec<PrimitiveId> {
        let mut out = BTreeSet::new();
        self.collect_ids(&mut out);
        out.into_iter().collect()
    }

    fn collect_ids(&self, out: &mut BTreeSet<PrimitiveId>) {
        match self {
            EditCommand::Add { primitive } | EditCommand::Replace { primitive } => {
                out.insert(primitive.id());
            }
            EditCommand::Delete { ids }
            | EditCommand::ChangeTags { ids, .. }
            | EditCommand::Move { ids, .. }
            | EditCommand::Purge { ids, .. } => out.extend(ids.iter().copied()),
            EditCommand::SetTags { id, .. }
            | EditCommand::SetCoord { id, .. }
            | EditCommand::ChangeNodes { id, .. }
            | EditCommand::ChangeMembers { id, .. }
            | EditCommand::ResolveConflict { id, .. } => {
                out.insert(*id);
            }
            EditCommand::AddConflict { conflict } => {
                out.insert(conflict.id);
            }
            EditCommand::Sequence { commands, .. } => {
                for c in commands {
                    c.collect_ids(out);
                }
            }
        }
    }

    /// `true` if the command changes geometry, membership or existence.
    /// Tag edits and conflict bookkeeping are not structural.
    pub fn is_structural(&self) -> bool {
        match self {
            EditCommand::ChangeTags { .. }
            | EditCommand::SetTags { .. }
            | EditCommand::AddConflict { .. }
            | EditCommand::ResolveConflict { .. } => false,
            EditCommand::Sequence { commands, .. } => commands.iter().any(Self::is_structural),
            _ => true,
        }
    }

    /// Ids touched structurally by this command that have an unresolved
    /// conflict. Empty if the command may run.
    pub fn blocked_by(&self, conflicts: &ConflictCollection) -> Vec<PrimitiveId> {
        let mut out = BTreeSet::new();
        self.collect_blocked(conflicts, &mut out);
        out.into_iter().collect()
    }

    fn collect_blocked(&self, conflicts: &ConflictCollection, out: &mut BTreeSet<PrimitiveId>) {
        match self {
            EditCommand::Sequence { commands, .. } => {
                for c in commands {
                    c.collect_blocked(conflicts, out);
                }
            }
            c if c.is_structural() => {
                out.extend(conflicts.participates(&c.touched_ids()));
            }
            _ => {}
        }
    }
}

fn subject(ids: &[PrimitiveId]) -> String {
    match ids {
        [one] => one.to_string(),
        _ => format!("{} primitives", ids.len()),
    }
}

// ---------------------------------------------------------------------------
// Pre-images
// ---------------------------------------------------------------------------

/// One captured pre-image. Reverting a step yields the step that reverts
/// the revert, which is what makes rollback of a failed undo possible.
#[derive(Debug, Clone)]
enum Step {
    /// `state` is the slot before the edit; `gone` records whether the edit
    /// left the slot empty. A slot found in any other condition at revert
    /// time was changed outside the history.
    Slot {
        id: PrimitiveId,
        state: Option<Primitive>,
        selected: bool,
        gone: bool,
    },
    ConflictAdded {
        id: PrimitiveId,
    },
    ConflictRemoved {
        index: usize,
        conflict: Conflict,
    },
}

fn revert(ds: &mut DataSet, step: Step) -> Result<Step, DataSetError> {
    match step {
        Step::Slot {
            id,
            state,
            selected,
            gone,
        } => {
            match (ds.contains(id), gone) {
                (false, false) => return Err(DataSetError::NotFound { id }),
                (true, true) => return Err(DataSetError::DuplicateIdentity { id }),
                _ => {}
            }
            let was_selected = ds.is_selected(id);
            let gone_after = state.is_none();
            let previous = ds.restore(id, state)?;
            let selectable = ds.get(id).is_some_and(|p| !p.is_deleted());
            if selected && selectable && !ds.is_selected(id) {
                ds.add_selected([id])?;
            } else if !selected && ds.is_selected(id) {
                ds.toggle_selected(id)?;
            }
            Ok(Step::Slot {
                id,
                state: previous,
                selected: was_selected,
                gone: gone_after,
            })
        }
        Step::ConflictAdded { id } => match ds.remove_conflict(id) {
            Some((index, conflict)) => Ok(Step::ConflictRemoved { index, conflict }),
            None => Err(DataSetError::Inconsistent {
                reason: format!("conflict record for {id} vanished"),
            }),
        },
        Step::ConflictRemoved { index, conflict } => {
            let id = conflict.id;
            ds.insert_conflict_at(index, conflict)?;
            Ok(Step::ConflictAdded { id })
        }
    }
}

/// Reverts `steps` newest first. On failure the already reverted steps are
/// replayed so the store ends where it started.
fn revert_all(ds: &mut DataSet, steps: Vec<Step>) -> Result<Vec<Step>, DataSetError> {
    let mut inverses = Vec::with_capacity(steps.len());
    let mut pending = steps;
    while let Some(step) = pending.pop() {
        match revert(ds, step) {
            Ok(inverse) => inverses.push(inverse),
            Err(err) => {
                if let Err(rollback) = replay(ds, inverses) {
                    tracing::error!(error = %rollback, "rollback failed, store may be inconsistent");
                    return Err(DataSetError::Inconsistent {
                        reason: format!("rollback failed after `{err}`: {rollback}"),
                    });
                }
                return Err(err);
            }
        }
    }
    Ok(inverses)
}

fn replay(ds: &mut DataSet, inverses: Vec<Step>) -> Result<(), DataSetError> {
    for step in inverses.into_iter().rev() {
        revert(ds, step)?;
    }
    Ok(())
}

struct Executor<'a> {
    ds: &'a mut DataSet,
    steps: Vec<Step>,
}

impl<'a> Executor<'a> {
    fn new(ds: &'a mut DataSet) -> Self {
        Executor {
            ds,
            steps: Vec::new(),
        }
    }

    /// Runs `edit` against slot `id` and records its pre-image on success.
    /// Failed DataSet calls have no effect, so nothing is recorded for them.
    fn edit(
        &mut self,
        id: PrimitiveId,
        edit: impl FnOnce(&mut DataSet) -> Result<(), DataSetError>,
    ) -> Result<(), DataSetError> {
        let state = self.ds.get(id).cloned();
        let selected = self.ds.is_selected(id);
        edit(self.ds)?;
        self.steps.push(Step::Slot {
            id,
            state,
            selected,
            gone: !self.ds.contains(id),
        });
        Ok(())
    }

    /// Like [`Executor::edit`], then marks the primitive modified.
    fn touch(
        &mut self,
        id: PrimitiveId,
        edit: impl FnOnce(&mut DataSet) -> Result<(), DataSetError>,
    ) -> Result<(), DataSetError> {
        self.edit(id, |ds| {
            edit(ds)?;
            ds.set_modified(id, true).map(|_| ())
        })
    }

    fn run(&mut self, command: &EditCommand) -> Result<(), EditError> {
        match command {
            EditCommand::Add { primitive } => {
                self.edit(primitive.id(), |ds| ds.add(primitive.clone()))?;
            }
            EditCommand::Delete { ids } => {
                for id in ids {
                    self.touch(*id, |ds| ds.set_deleted(*id, true).map(|_| ()))?;
                }
            }
            EditCommand::ChangeTags { ids, changes } => {
                for id in ids {
                    let p = self.ds.get(*id).ok_or(DataSetError::NotFound { id: *id })?;
                    let mut tags = p.tags().clone();
                    if tags.apply(changes) {
                        self.touch(*id, |ds| ds.set_tags(*id, tags).map(|_| ()))?;
                    }
                }
            }
            EditCommand::SetTags { id, tags } => {
                self.touch(*id, |ds| ds.set_tags(*id, tags.clone()).map(|_| ()))?;
            }
            EditCommand::Move { ids, dlat, dlon } => {
                for point in points_of(self.ds, ids)? {
                    let Some(coord) = self.ds.get(point).and_then(Primitive::coord) else {
                        continue;
                    };
                    let moved = coord.offset(*dlat, *dlon);
                    self.touch(point, |ds| ds.set_coord(point, moved).map(|_| ()))?;
                }
            }
            EditCommand::SetCoord { id, coord } => {
                self.touch(*id, |ds| ds.set_coord(*id, *coord).map(|_| ()))?;
            }
            EditCommand::ChangeNodes { id, nodes } => {
                self.touch(*id, |ds| ds.set_line_nodes(*id, nodes.clone()).map(|_| ()))?;
            }
            EditCommand::ChangeMembers { id, members } => {
                self.touch(*id, |ds| {
                    ds.set_relation_members(*id, members.clone()).map(|_| ())
                })?;
            }
            EditCommand::Replace { primitive } => {
                self.edit(primitive.id(), |ds| ds.replace(primitive.clone()).map(|_| ()))?;
            }
            EditCommand::Purge { ids, mode } => {
                for id in ids {
                    self.purge(*id, *mode)?;
                }
            }
            EditCommand::AddConflict { conflict } => {
                self.ds.add_conflict(conflict.clone())?;
                self.steps.push(Step::ConflictAdded { id: conflict.id });
            }
            EditCommand::ResolveConflict { id, resolved } => {
                if resolved.id() != *id {
                    return Err(EditError::InvalidCommand {
                        reason: format!("resolution for {id} carries {}", resolved.id()),
                    });
                }
                let (index, conflict) = self
                    .ds
                    .remove_conflict(*id)
                    .ok_or(EditError::NoSuchConflict { id: *id })?;
                self.steps.push(Step::ConflictRemoved { index, conflict });
                self.edit(*id, |ds| ds.replace(resolved.clone()).map(|_| ()))?;
            }
            EditCommand::Sequence { commands, .. } => {
                for child in commands {
                    self.run(child)?;
                }
            }
        }
        Ok(())
    }

    // Purge may drop conflict records and takes referrers with it under
    // Cascade; every purged slot gets its own pre-image. Conflict steps go
    // first so undo re-inserts them after their primitives are back.
    fn purge(&mut self, id: PrimitiveId, mode: RemovalMode) -> Result<(), EditError> {
        let conflicts: Vec<(usize, Conflict)> = self.ds.conflicts().iter().cloned().enumerate().collect();
        let selected: HashSet<PrimitiveId> = self.ds.selected().into_iter().collect();
        let removed = self.ds.remove(id, mode)?;
        for (index, conflict) in conflicts {
            if !self.ds.conflicts().contains(conflict.id) {
                self.steps.push(Step::ConflictRemoved { index, conflict });
            }
        }
        for p in removed {
            let id = p.id();
            self.steps.push(Step::Slot {
                id,
                state: Some(p),
                selected: selected.contains(&id),
                gone: !self.ds.contains(id),
            });
        }
        Ok(())
    }
}

/// Distinct points contained in `ids`, recursing through relations.
fn points_of(ds: &DataSet, ids: &[PrimitiveId]) -> Result<BTreeSet<PrimitiveId>, DataSetError> {
    fn walk(
        ds: &DataSet,
        id: PrimitiveId,
        seen: &mut HashSet<PrimitiveId>,
        out: &mut BTreeSet<PrimitiveId>,
    ) -> Result<(), DataSetError> {
        if !seen.insert(id) {
            return Ok(());
        }
        let p = ds.get(id).ok_or(DataSetError::NotFound { id })?;
        if p.is_deleted() {
            return Ok(());
        }
        match p.geometry() {
            Geometry::Point { .. } => {
                out.insert(id);
            }
            Geometry::Line { nodes } => {
                for n in nodes {
                    walk(ds, *n, seen, out)?;
                }
            }
            Geometry::Relation { members } => {
                for m in members {
                    walk(ds, m.target, seen, out)?;
                }
            }
        }
        Ok(())
    }
    let mut seen = HashSet::new();
    let mut out = BTreeSet::new();
    for id in ids {
        walk(ds, *id, &mut seen, &mut out)?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// CommandRecord
// ---------------------------------------------------------------------------

/// Lifecycle of a [`CommandRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Created,
    Applied,
    Reversed,
    Discarded,
}

/// A command plus the pre-images captured by its last execution.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    command: EditCommand,
    state: CommandState,
    undo_steps: Vec<Step>,
}

impl CommandRecord {
    pub fn new(command: EditCommand) -> Self {
        CommandRecord {
            command,
            state: CommandState::Created,
            undo_steps: Vec::new(),
        }
    }

    pub fn command(&self) -> &EditCommand {
        &self.command
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Applies the command. Valid from `Created` or `Reversed`.
    pub fn execute(&mut self, ds: &mut DataSet) -> Result<(), EditError> {
        if !matches!(self.state, CommandState::Created | CommandState::Reversed) {
            return Err(self.bad_state("execute"));
        }
        let mut ds = ds.update();
        let mut exec = Executor::new(&mut ds);
        match exec.run(&self.command) {
            Ok(()) => {
                self.undo_steps = exec.steps;
                self.state = CommandState::Applied;
                Ok(())
            }
            Err(err) => {
                let steps = std::mem::take(&mut exec.steps);
                let ds = exec.ds;
                if let Err(rollback) = replay_forward_failure(ds, steps) {
                    return Err(rollback.into());
                }
                Err(err)
            }
        }
    }

    /// Restores the captured pre-images. Valid only from `Applied`.
    pub fn undo(&mut self, ds: &mut DataSet) -> Result<(), EditError> {
        if self.state != CommandState::Applied {
            return Err(self.bad_state("undo"));
        }
        let mut ds = ds.update();
        let steps = std::mem::take(&mut self.undo_steps);
        match revert_all(&mut ds, steps.clone()) {
            Ok(_) => {
                self.state = CommandState::Reversed;
                Ok(())
            }
            Err(err) => {
                self.undo_steps = steps;
                Err(err.into())
            }
        }
    }

    /// Marks the record dead. It can no longer execute or undo.
    pub fn discard(&mut self) {
        self.state = CommandState::Discarded;
        self.undo_steps.clear();
    }

    fn bad_state(&self, op: &str) -> EditError {
        EditError::InvalidHistoryState {
            reason: format!("cannot {op} `{}` in state {:?}", self.command.describe(), self.state),
            discarded: 0,
        }
    }
}

// Undo of a partially executed command: revert newest first, no inverse kept.
fn replay_forward_failure(ds: &mut DataSet, steps: Vec<Step>) -> Result<(), DataSetError> {
    revert_all(ds, steps).map(|_| ()).inspect_err(|err| {
        tracing::error!(error = %err, "failed to roll back partially executed command");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoedit_core::{ConflictKind, Version};

    fn ll(lat: f64, lon: f64) -> LatLon {
        LatLon::new(lat, lon)
    }

    /// Square of four points, a closed line and a relation over the line.
    fn square() -> DataSet {
        let mut ds = DataSet::new();
        ds.add(Primitive::point(1, ll(0.0, 0.0))).unwrap();
        ds.add(Primitive::point(2, ll(0.0, 1.0))).unwrap();
        ds.add(Primitive::point(3, ll(1.0, 1.0))).unwrap();
        ds.add(Primitive::point(4, ll(1.0, 0.0))).unwrap();
        ds.add(Primitive::line(10, [1, 2, 3, 4, 1]).with_tag("building", "yes"))
            .unwrap();
        ds.add(Primitive::relation(20, vec![Member::new("outer", PrimitiveId::line(10))]))
            .unwrap();
        ds
    }

    fn run(ds: &mut DataSet, command: EditCommand) -> CommandRecord {
        let mut record = CommandRecord::new(command);
        record.execute(ds).unwrap();
        record
    }

    #[test]
    fn delete_builder_orders_composites_first() {
        let ds = square();
        let cmd = EditCommand::delete(&ds, &[PrimitiveId::point(1)], DeleteMode::Cascade).unwrap();
        assert_eq!(
            cmd,
            EditCommand::Delete {
                ids: vec![PrimitiveId::relation(20), PrimitiveId::line(10), PrimitiveId::point(1)]
            }
        );
    }

    #[test]
    fn strict_delete_rejects_live_referrers() {
        let ds = square();
        let err = EditCommand::delete(&ds, &[PrimitiveId::point(2)], DeleteMode::Strict).unwrap_err();
        assert!(matches!(err, EditError::DataSet(DataSetError::StillReferenced { .. })));
    }

    #[test]
    fn delete_then_undo_restores_points_and_line() {
        let mut ds = square();
        let before = ds.snapshot();
        let cmd = EditCommand::delete(
            &ds,
            &[PrimitiveId::line(10), PrimitiveId::point(1), PrimitiveId::point(2)],
            DeleteMode::Cascade,
        )
        .unwrap();
        let mut record = run(&mut ds, cmd);
        assert!(ds.get(PrimitiveId::point(1)).unwrap().is_deleted());
        assert!(ds.get(PrimitiveId::point(1)).unwrap().is_modified());
        record.undo(&mut ds).unwrap();
        assert_eq!(ds.snapshot(), before);
        assert_eq!(record.state(), CommandState::Reversed);
    }

    #[test]
    fn undo_only_from_applied() {
        let mut ds = square();
        let mut record = CommandRecord::new(EditCommand::SetCoord {
            id: PrimitiveId::point(1),
            coord: ll(5.0, 5.0),
        });
        assert!(matches!(record.undo(&mut ds), Err(EditError::InvalidHistoryState { .. })));
        record.execute(&mut ds).unwrap();
        assert!(matches!(record.execute(&mut ds), Err(EditError::InvalidHistoryState { .. })));
        record.discard();
        assert!(matches!(record.undo(&mut ds), Err(EditError::InvalidHistoryState { .. })));
    }

    #[test]
    fn failed_sequence_leaves_store_unchanged() {
        let mut ds = square();
        ds.set_selected([PrimitiveId::point(3)]).unwrap();
        let before = ds.snapshot();
        let cmd = EditCommand::sequence(
            "broken",
            vec![
                EditCommand::SetCoord {
                    id: PrimitiveId::point(3),
                    coord: ll(9.0, 9.0),
                },
                EditCommand::Delete {
                    ids: vec![PrimitiveId::point(3)],
                },
                EditCommand::ChangeTags {
                    ids: vec![PrimitiveId::point(99)],
                    changes: vec![TagChange::set("a", "b")],
                },
            ],
        );
        // Point 3 is referenced by the live line, so the delete step fails.
        let mut record = CommandRecord::new(cmd);
        let err = record.execute(&mut ds).unwrap_err();
        assert!(matches!(err, EditError::DataSet(DataSetError::StillReferenced { .. })));
        assert_eq!(ds.snapshot(), before);
        assert_eq!(record.state(), CommandState::Created);
    }

    #[test]
    fn move_line_shifts_each_point_once() {
        let mut ds = square();
        run(
            &mut ds,
            EditCommand::Move {
                ids: vec![PrimitiveId::line(10)],
                dlat: 1.0,
                dlon: 0.0,
            },
        );
        assert_eq!(ds.get(PrimitiveId::point(1)).unwrap().coord(), Some(ll(1.0, 0.0)));
        assert_eq!(ds.get(PrimitiveId::point(3)).unwrap().coord(), Some(ll(2.0, 1.0)));
        assert!(!ds.get(PrimitiveId::line(10)).unwrap().is_modified());
    }

    #[test]
    fn change_tags_skips_no_op_targets() {
        let mut ds = square();
        run(
            &mut ds,
            EditCommand::ChangeTags {
                ids: vec![PrimitiveId::line(10), PrimitiveId::point(1)],
                changes: vec![TagChange::set("building", "yes")],
            },
        );
        assert!(!ds.get(PrimitiveId::line(10)).unwrap().is_modified());
        assert!(ds.get(PrimitiveId::point(1)).unwrap().is_modified());
    }

    #[test]
    fn split_line_inserts_after_each_membership() {
        let mut ds = DataSet::new();
        for (i, lon) in [(1, 0.0), (2, 1.0), (3, 2.0)] {
            ds.add(Primitive::point(i, ll(0.0, lon))).unwrap();
        }
        ds.add(Primitive::line(10, [1, 2, 3]).with_tag("highway", "primary")).unwrap();
        ds.add(Primitive::relation(
            20,
            vec![
                Member::new("forward", PrimitiveId::line(10)),
                Member::new("", PrimitiveId::point(1)),
            ],
        ))
        .unwrap();
        let new_id = ds.allocate_id(PrimitiveKind::Line);
        let cmd = EditCommand::split_line(&ds, PrimitiveId::line(10), PrimitiveId::point(2), new_id).unwrap();
        let before = ds.snapshot();
        let mut record = run(&mut ds, cmd);

        assert_eq!(
            ds.get(PrimitiveId::line(10)).unwrap().nodes(),
            &[PrimitiveId::point(1), PrimitiveId::point(2)]
        );
        let tail = ds.get(new_id).unwrap();
        assert_eq!(tail.nodes(), &[PrimitiveId::point(2), PrimitiveId::point(3)]);
        assert_eq!(tail.tags().get("highway"), Some("primary"));
        let members = ds.get(PrimitiveId::relation(20)).unwrap().members().to_vec();
        assert_eq!(members[1], Member::new("forward", new_id));
        assert_eq!(members.len(), 3);
        ds.verify_integrity().unwrap();

        record.undo(&mut ds).unwrap();
        assert_eq!(ds.snapshot(), before);
    }

    #[test]
    fn split_rejects_end_nodes() {
        let ds = square();
        let err = EditCommand::split_line(&ds, PrimitiveId::line(10), PrimitiveId::point(1), PrimitiveId::line(-1))
            .unwrap_err();
        assert!(matches!(err, EditError::InvalidCommand { .. }));
    }

    #[test]
    fn purge_undo_restores_conflicts_and_selection() {
        let mut ds = square();
        let local = ds.get(PrimitiveId::line(10)).cloned().unwrap();
        let remote = local.clone().with_version(Version(4)).with_tag("name", "Hall");
        ds.add_conflict(Conflict::new(ConflictKind::TrueConflict, local, remote)).unwrap();
        ds.set_selected([PrimitiveId::line(10), PrimitiveId::point(2)]).unwrap();
        let before = ds.snapshot();

        let mut record = run(
            &mut ds,
            EditCommand::Purge {
                ids: vec![PrimitiveId::point(2)],
                mode: RemovalMode::Cascade,
            },
        );
        assert!(ds.conflicts().is_empty());
        assert_eq!(ds.len(), 3);
        record.undo(&mut ds).unwrap();
        assert_eq!(ds.snapshot(), before);
        ds.verify_integrity().unwrap();
    }

    #[test]
    fn resolve_conflict_undo_reopens() {
        let mut ds = square();
        let local = ds.get(PrimitiveId::point(1)).cloned().unwrap().with_modified(true);
        let remote = Primitive::point(1, ll(0.5, 0.5)).with_version(Version(2));
        run(
            &mut ds,
            EditCommand::AddConflict {
                conflict: Conflict::new(ConflictKind::TrueConflict, local, remote.clone()),
            },
        );
        let mut record = run(
            &mut ds,
            EditCommand::ResolveConflict {
                id: PrimitiveId::point(1),
                resolved: remote,
            },
        );
        assert!(ds.conflicts().is_empty());
        assert_eq!(ds.get(PrimitiveId::point(1)).unwrap().version(), Version(2));
        record.undo(&mut ds).unwrap();
        assert!(ds.conflicts().contains(PrimitiveId::point(1)));
    }

    #[test]
    fn resolving_missing_conflict_fails() {
        let mut ds = square();
        let mut record = CommandRecord::new(EditCommand::ResolveConflict {
            id: PrimitiveId::point(1),
            resolved: Primitive::point(1, ll(0.0, 0.0)),
        });
        assert_eq!(
            record.execute(&mut ds),
            Err(EditError::NoSuchConflict { id: PrimitiveId::point(1) })
        );
    }

    #[test]
    fn structural_classification() {
        let tags = EditCommand::SetTags {
            id: PrimitiveId::point(1),
            tags: Tags::new(),
        };
        let coord = EditCommand::SetCoord {
            id: PrimitiveId::point(2),
            coord: ll(0.0, 0.0),
        };
        assert!(!tags.is_structural());
        assert!(coord.is_structural());
        let seq = EditCommand::sequence("mixed", vec![tags, coord]);
        assert!(seq.is_structural());
        assert_eq!(seq.touched_ids(), vec![PrimitiveId::point(1), PrimitiveId::point(2)]);

        let mut conflicts = ConflictCollection::new();
        for id in [1, 2] {
            let p = Primitive::point(id, ll(0.0, 0.0));
            conflicts
                .add(Conflict::new(ConflictKind::TrueConflict, p.clone(), p))
                .unwrap();
        }
        // Only the structural child is blocked.
        assert_eq!(seq.blocked_by(&conflicts), vec![PrimitiveId::point(2)]);
    }

    #[test]
    fn commands_serialize_tagged() {
        let cmd = EditCommand::Delete {
            ids: vec![PrimitiveId::point(3)],
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "Delete");
        let back: EditCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }
}
