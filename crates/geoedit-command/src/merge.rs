//! Turning downloaded snapshots into one undoable command.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use geoedit_core::{Conflict, ConflictKind, DataSet, Primitive, PrimitiveId, PrimitiveKind};

use crate::command::EditCommand;
use crate::resolver::{classify, Classification};

/// Per-classification counts of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub unchanged: usize,
    pub fast_forward: usize,
    pub conflicts: Vec<PrimitiveId>,
    /// Placeholders added for referenced but undownloaded primitives.
    pub placeholders: usize,
    /// Remote primitives that could not be installed because they reference
    /// primitives deleted locally.
    pub skipped: Vec<PrimitiveId>,
}

/// The outcome of [`merge_remote`]. `command` is `None` when nothing changes.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub command: Option<EditCommand>,
    pub report: MergeReport,
}

/// Classifies each remote snapshot against `ds` and builds the command that
/// installs the result.
///
/// Creations and updates run points first, then lines, then relations, with
/// member relations ahead of the relations listing them; deletions run in
/// the opposite direction. Relations referencing each other in a cycle are
/// first added as incomplete placeholders, then filled in. Any referenced primitive missing
/// from both the store and the download is added as an incomplete
/// placeholder first. Primitives that already have an open conflict are left
/// alone.
pub fn merge_remote(ds: &DataSet, remote: Vec<Primitive>) -> MergePlan {
    // Highest version wins if the download repeats an id.
    let mut by_id: BTreeMap<PrimitiveId, Primitive> = BTreeMap::new();
    for p in remote {
        match by_id.get(&p.id()) {
            Some(existing) if existing.version() >= p.version() => {}
            _ => {
                by_id.insert(p.id(), p);
            }
        }
    }

    let mut report = MergeReport::default();
    let mut verdicts: BTreeMap<PrimitiveId, Classification> = BTreeMap::new();
    for (id, p) in &by_id {
        let verdict = if ds.conflicts().contains(*id) {
            Classification::Unchanged
        } else {
            match classify(ds.get(*id), p) {
                // Nothing to install for an unknown primitive already deleted remotely.
                Classification::FastForward if p.is_deleted() && !ds.contains(*id) => {
                    Classification::Unchanged
                }
                other => other,
            }
        };
        verdicts.insert(*id, verdict);
    }

    demote_blocked_deletions(ds, &by_id, &mut verdicts);
    let deleted_after = deleted_after_merge(ds, &by_id, &verdicts);

    // Remote content that would reference a primitive staying deleted cannot
    // be installed as is.
    let live_refs_deleted = |p: &Primitive| {
        !p.is_deleted() && p.referenced_ids().iter().any(|r| deleted_after.contains(r))
    };
    for (id, p) in &by_id {
        if verdicts.get(id) == Some(&Classification::FastForward) && live_refs_deleted(p) {
            if ds.contains(*id) {
                verdicts.insert(*id, Classification::Conflict(ConflictKind::TrueConflict));
            } else {
                verdicts.insert(*id, Classification::Unchanged);
                report.skipped.push(*id);
            }
        }
    }

    let mut placeholders = Vec::new();
    let mut known: HashSet<PrimitiveId> = HashSet::new();
    let mut forward = Vec::new();
    let mut deletions = Vec::new();
    let mut conflicts = Vec::new();
    for (id, p) in &by_id {
        let verdict = verdicts.get(id).copied().unwrap_or(Classification::Unchanged);
        if matches!(verdict, Classification::Unchanged) {
            if !report.skipped.contains(id) {
                report.unchanged += 1;
            }
            continue;
        }
        for r in p.referenced_ids() {
            if !ds.contains(r) && !by_id.contains_key(&r) && known.insert(r) {
                placeholders.push(EditCommand::Add {
                    primitive: Primitive::incomplete(r),
                });
            }
        }
        match verdict {
            Classification::FastForward => {
                report.fast_forward += 1;
                if p.is_deleted() {
                    deletions.push((*id, install(ds, p.clone())));
                } else {
                    forward.push(p.clone());
                }
            }
            Classification::Conflict(kind) => {
                report.conflicts.push(*id);
                if let Some(local) = ds.get(*id) {
                    conflicts.push(EditCommand::AddConflict {
                        conflict: Conflict::new(kind, local.clone(), p.clone()),
                    });
                }
            }
            Classification::Unchanged => {}
        }
    }
    report.placeholders = placeholders.len();

    let (cycle_placeholders, forward) = order_forward(ds, forward);
    let mut commands = placeholders;
    commands.extend(cycle_placeholders);
    commands.extend(forward);
    commands.extend(order_deletions(ds, deletions));
    commands.extend(conflicts);

    let command = if commands.is_empty() {
        None
    } else {
        Some(EditCommand::sequence(
            format!(
                "Merge download ({} updated, {} conflicts)",
                report.fast_forward,
                report.conflicts.len()
            ),
            commands,
        ))
    };
    MergePlan { command, report }
}

fn install(ds: &DataSet, primitive: Primitive) -> EditCommand {
    if ds.contains(primitive.id()) {
        EditCommand::Replace { primitive }
    } else {
        EditCommand::Add { primitive }
    }
}

// `forward` arrives in id order, so points and lines already precede the
// relations. Relations are emitted one strongly connected component at a
// time, members first. A component larger than one is a membership cycle:
// its new relations get an empty placeholder up front and are installed by
// `Replace` once all of them exist. Returns (placeholders, installs).
fn order_forward(ds: &DataSet, forward: Vec<Primitive>) -> (Vec<EditCommand>, Vec<EditCommand>) {
    let (relations, rest): (Vec<Primitive>, Vec<Primitive>) = forward
        .into_iter()
        .partition(|p| p.kind() == PrimitiveKind::Relation);
    let mut installs: Vec<EditCommand> = rest.into_iter().map(|p| install(ds, p)).collect();

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index: HashMap<PrimitiveId, NodeIndex> = HashMap::new();
    for (i, p) in relations.iter().enumerate() {
        index.insert(p.id(), graph.add_node(i));
    }
    for p in &relations {
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

    let mut placeholders = Vec::new();
    // tarjan_scc yields components targets-first.
    for scc in tarjan_scc(&graph) {
        let mut component: Vec<&Primitive> = scc.iter().map(|n| &relations[graph[*n]]).collect();
        component.sort_by_key(|p| p.id());
        let cyclic = component.len() > 1;
        for p in component {
            if cyclic && !ds.contains(p.id()) {
                placeholders.push(EditCommand::Add {
                    primitive: Primitive::incomplete(p.id()),
                });
                installs.push(EditCommand::Replace {
                    primitive: p.clone(),
                });
            } else {
                installs.push(install(ds, p.clone()));
            }
        }
    }
    (placeholders, installs)
}

// A remote deletion can only be adopted once every live local referrer is
// itself deleted or updated to drop the reference. Otherwise it is a
// deleted-on-server conflict.
fn demote_blocked_deletions(
    ds: &DataSet,
    by_id: &BTreeMap<PrimitiveId, Primitive>,
    verdicts: &mut BTreeMap<PrimitiveId, Classification>,
) {
    fn adopted(id: PrimitiveId, verdicts: &BTreeMap<PrimitiveId, Classification>) -> bool {
        verdicts.get(&id) == Some(&Classification::FastForward)
    }

    loop {
        let mut blocked = Vec::new();
        for (id, p) in by_id {
            if !p.is_deleted() || !adopted(*id, verdicts) {
                continue;
            }
            let held = ds.referrers(*id).iter().any(|r| {
                let live = ds.get(*r).is_some_and(|rp| !rp.is_deleted());
                let released = adopted(*r, verdicts)
                    && by_id
                        .get(r)
                        .is_some_and(|rp| rp.is_deleted() || !rp.referenced_ids().contains(id));
                live && !released
            });
            if held {
                blocked.push(*id);
            }
        }
        if blocked.is_empty() {
            return;
        }
        for id in blocked {
            verdicts.insert(id, Classification::Conflict(ConflictKind::DeletedOnServer));
        }
    }
}

fn deleted_after_merge(
    ds: &DataSet,
    by_id: &BTreeMap<PrimitiveId, Primitive>,
    verdicts: &BTreeMap<PrimitiveId, Classification>,
) -> BTreeSet<PrimitiveId> {
    let mut out: BTreeSet<PrimitiveId> = ds
        .all_primitives()
        .filter(|p| p.is_deleted())
        .map(Primitive::id)
        .collect();
    for (id, p) in by_id {
        if verdicts.get(id) == Some(&Classification::FastForward) {
            if p.is_deleted() {
                out.insert(*id);
            } else {
                out.remove(id);
            }
        }
    }
    out
}

// Referrers before referenced: relations, then lines, then points, with
// relations among themselves in reference order.
fn order_deletions(ds: &DataSet, mut deletions: Vec<(PrimitiveId, EditCommand)>) -> Vec<EditCommand> {
    let ids: HashSet<PrimitiveId> = deletions.iter().map(|(id, _)| *id).collect();
    let depth = |id: PrimitiveId| -> usize {
        let mut seen = HashSet::new();
        let mut frontier = vec![id];
        let mut depth = 0;
        while let Some(next) = frontier.pop() {
            for r in ds.referrers(next) {
                if ids.contains(r) && seen.insert(*r) {
                    depth += 1;
                    frontier.push(*r);
                }
            }
        }
        depth
    };
    deletions.sort_by_key(|(id, _)| (std::cmp::Reverse(id.kind.rank()), depth(*id), *id));
    deletions.into_iter().map(|(_, c)| c).collect()
}
