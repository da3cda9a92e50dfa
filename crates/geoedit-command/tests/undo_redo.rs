//! History round trips over random edit sessions.
//!
//! Whatever sequence of commands succeeds, undoing all of them restores the
//! starting snapshot, and redoing all of them restores the edited one.

use geoedit_command::{CommandHistory, DeleteMode, EditCommand};
use geoedit_core::{
    DataSet, LatLon, Member, Primitive, PrimitiveId, PrimitiveKind, RemovalMode, TagChange, Version,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    AddPoint(f64, f64),
    AddLine(Vec<usize>),
    /// Members by pick index; `true` also lists the relation itself.
    AddRelation(Vec<usize>, bool),
    Delete(usize, DeleteMode),
    Tag(usize, String, Option<String>),
    Move(usize, f64, f64),
    ChangeNodes(usize, Vec<usize>),
    Purge(usize, RemovalMode),
    Split(usize, usize),
    Select(Vec<usize>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let idx = 0usize..16;
    let key = prop_oneof![Just("name".to_string()), Just("highway".to_string())];
    let value = proptest::option::of("[a-z]{1,4}");
    let delete_mode = prop_oneof![Just(DeleteMode::Strict), Just(DeleteMode::Cascade)];
    let removal = prop_oneof![
        Just(RemovalMode::Reject),
        Just(RemovalMode::Cascade),
        Just(RemovalMode::MakeIncomplete),
    ];
    prop_oneof![
        3 => (-1.0f64..1.0, -1.0f64..1.0).prop_map(|(a, b)| Op::AddPoint(a, b)),
        2 => proptest::collection::vec(idx.clone(), 2..5).prop_map(Op::AddLine),
        1 => (proptest::collection::vec(idx.clone(), 1..3), any::<bool>())
            .prop_map(|(m, own)| Op::AddRelation(m, own)),
        2 => (idx.clone(), delete_mode).prop_map(|(i, m)| Op::Delete(i, m)),
        2 => (idx.clone(), key, value).prop_map(|(i, k, v)| Op::Tag(i, k, v)),
        1 => (idx.clone(), -0.1f64..0.1, -0.1f64..0.1).prop_map(|(i, a, b)| Op::Move(i, a, b)),
        1 => (idx.clone(), proptest::collection::vec(idx.clone(), 2..5)).prop_map(|(l, n)| Op::ChangeNodes(l, n)),
        1 => (idx.clone(), removal).prop_map(|(i, m)| Op::Purge(i, m)),
        1 => (idx.clone(), idx.clone()).prop_map(|(l, n)| Op::Split(l, n)),
        1 => proptest::collection::vec(idx, 0..3).prop_map(Op::Select),
    ]
}

/// A synced store to edit on top of.
fn base() -> DataSet {
    let mut ds = DataSet::new();
    for (id, lon) in [(1, 0.0), (2, 0.5), (3, 1.0)] {
        ds.add(Primitive::point(id, LatLon::new(0.0, lon)).with_version(Version(1)))
            .unwrap();
    }
    ds.add(Primitive::line(10, [1, 2, 3]).with_tag("highway", "path").with_version(Version(2)))
        .unwrap();
    ds.add(
        Primitive::relation(20, vec![Member::new("route", PrimitiveId::line(10))])
            .with_version(Version(1)),
    )
    .unwrap();
    ds
}

fn pick(ds: &DataSet, kind: Option<PrimitiveKind>, i: usize) -> Option<PrimitiveId> {
    let mut ids: Vec<PrimitiveId> = ds
        .primitives()
        .filter(|p| !p.is_incomplete())
        .map(Primitive::id)
        .filter(|id| kind.map_or(true, |k| id.kind == k))
        .collect();
    ids.sort();
    (!ids.is_empty()).then(|| ids[i % ids.len()])
}

fn points(ds: &DataSet, picks: &[usize]) -> Vec<PrimitiveId> {
    picks
        .iter()
        .filter_map(|i| pick(ds, Some(PrimitiveKind::Point), *i))
        .collect()
}

/// Builds the command for `op` against the current store, if it makes sense.
fn command_for(ds: &mut DataSet, op: &Op) -> Option<EditCommand> {
    match op {
        Op::AddPoint(lat, lon) => {
            let id = ds.allocate_id(PrimitiveKind::Point);
            let primitive = Primitive::point(id.id, LatLon::new(*lat, *lon)).with_modified(true);
            Some(EditCommand::Add { primitive })
        }
        Op::AddLine(picks) => {
            let nodes = points(ds, picks);
            let id = ds.allocate_id(PrimitiveKind::Line);
            let primitive = Primitive::line(id.id, nodes.iter().map(|n| n.id)).with_modified(true);
            Some(EditCommand::Add { primitive })
        }
        Op::AddRelation(picks, own) => {
            let mut members: Vec<Member> = picks
                .iter()
                .filter_map(|i| pick(ds, None, *i))
                .map(|target| Member::new("", target))
                .collect();
            let id = ds.allocate_id(PrimitiveKind::Relation);
            if *own {
                members.push(Member::new("subarea", id));
            }
            let primitive = Primitive::relation(id.id, members).with_modified(true);
            Some(EditCommand::Add { primitive })
        }
        Op::Delete(i, mode) => {
            let id = pick(ds, None, *i)?;
            EditCommand::delete(ds, &[id], *mode).ok()
        }
        Op::Tag(i, key, value) => {
            let id = pick(ds, None, *i)?;
            let change = match value {
                Some(v) => TagChange::set(key.clone(), v.clone()),
                None => TagChange::remove(key.clone()),
            };
            Some(EditCommand::ChangeTags {
                ids: vec![id],
                changes: vec![change],
            })
        }
        Op::Move(i, dlat, dlon) => Some(EditCommand::Move {
            ids: vec![pick(ds, None, *i)?],
            dlat: *dlat,
            dlon: *dlon,
        }),
        Op::ChangeNodes(l, picks) => Some(EditCommand::ChangeNodes {
            id: pick(ds, Some(PrimitiveKind::Line), *l)?,
            nodes: points(ds, picks),
        }),
        Op::Purge(i, mode) => Some(EditCommand::Purge {
            ids: vec![pick(ds, None, *i)?],
            mode: *mode,
        }),
        Op::Split(l, n) => {
            let line = pick(ds, Some(PrimitiveKind::Line), *l)?;
            let nodes = ds.get(line)?.nodes().to_vec();
            let at = *nodes.get(n % nodes.len().max(1))?;
            let new_id = ds.allocate_id(PrimitiveKind::Line);
            EditCommand::split_line(ds, line, at, new_id).ok()
        }
        Op::Select(picks) => {
            let ids: Vec<PrimitiveId> = picks.iter().filter_map(|i| pick(ds, None, *i)).collect();
            let _ = ds.set_selected(ids);
            None
        }
    }
}

proptest! {
    #[test]
    fn undo_everything_restores_start(ops in proptest::collection::vec(op_strategy(), 1..30)) {
        let mut ds = base();
        let mut history = CommandHistory::default();
        let mut executed = 0;
        let start = ds.snapshot();
        for op in &ops {
            let Some(command) = command_for(&mut ds, op) else {
                continue;
            };
            let before = ds.snapshot();
            match history.execute(&mut ds, command) {
                Ok(_) => executed += 1,
                Err(_) => prop_assert_eq!(&ds.snapshot(), &before),
            }
            prop_assert_eq!(ds.verify_integrity(), Ok(()));
        }

        // Selection changes are not history entries, so compare content only.
        let edited = ds.snapshot();
        let undone = history.undo_many(&mut ds, executed).unwrap();
        prop_assert_eq!(undone.len(), executed);
        prop_assert!(!history.can_undo());
        prop_assert_eq!(
            ds.snapshot().primitives,
            start.primitives,
            "undo of {} commands",
            executed
        );
        prop_assert_eq!(ds.snapshot().conflicts, start.conflicts);
        prop_assert_eq!(ds.verify_integrity(), Ok(()));

        for _ in 0..executed {
            history.redo(&mut ds).unwrap();
        }
        prop_assert_eq!(ds.snapshot().primitives, edited.primitives);
        prop_assert_eq!(ds.verify_integrity(), Ok(()));
    }

    #[test]
    fn execute_undo_redo_equals_execute(op in op_strategy()) {
        let mut ds = base();
        let mut history = CommandHistory::default();
        let Some(command) = command_for(&mut ds, &op) else {
            return Ok(());
        };
        let start = ds.snapshot();
        if history.execute(&mut ds, command).is_err() {
            prop_assert_eq!(ds.snapshot(), start);
            return Ok(());
        }
        let applied = ds.snapshot();
        history.undo(&mut ds).unwrap();
        prop_assert_eq!(&ds.snapshot(), &start);
        history.redo(&mut ds).unwrap();
        prop_assert_eq!(ds.snapshot(), applied);
    }
}

#[test]
fn new_command_after_undo_clears_redo() {
    let mut ds = base();
    let mut history = CommandHistory::default();
    let tag = |value: &str| EditCommand::ChangeTags {
        ids: vec![PrimitiveId::line(10)],
        changes: vec![TagChange::set("name", value)],
    };
    history.execute(&mut ds, tag("a")).unwrap();
    history.execute(&mut ds, tag("b")).unwrap();
    history.undo(&mut ds).unwrap();
    assert!(history.can_redo());

    history.execute(&mut ds, tag("c")).unwrap();
    assert!(!history.can_redo());
    let line = ds.get(PrimitiveId::line(10)).unwrap();
    assert_eq!(line.tags().get("name"), Some("c"));
    assert!(line.is_modified());

    history.undo_many(&mut ds, 2).unwrap();
    let line = ds.get(PrimitiveId::line(10)).unwrap();
    assert_eq!(line.tags().get("name"), None);
    assert!(!line.is_modified());
}
