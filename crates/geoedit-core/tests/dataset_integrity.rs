//! Random mutation sequences against a DataSet: every operation either
//! succeeds with a consistent reference index or fails with no effect.

use geoedit_core::{
    DataSet, DataSetError, LatLon, Member, Primitive, PrimitiveId, PrimitiveKind, RemovalMode,
    Version,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    AddPoint(f64, f64),
    AddLine(Vec<usize>),
    AddRelation(Vec<usize>),
    SetNodes(usize, Vec<usize>),
    Delete(usize),
    Undelete(usize),
    Purge(usize, RemovalMode),
    AssignServerId(usize),
    Select(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let idx = 0usize..12;
    let mode = prop_oneof![
        Just(RemovalMode::Reject),
        Just(RemovalMode::Cascade),
        Just(RemovalMode::MakeIncomplete),
    ];
    prop_oneof![
        3 => (-1.0f64..1.0, -1.0f64..1.0).prop_map(|(a, b)| Op::AddPoint(a, b)),
        2 => proptest::collection::vec(idx.clone(), 0..5).prop_map(Op::AddLine),
        1 => proptest::collection::vec(idx.clone(), 0..3).prop_map(Op::AddRelation),
        1 => (idx.clone(), proptest::collection::vec(idx.clone(), 0..5)).prop_map(|(l, n)| Op::SetNodes(l, n)),
        2 => idx.clone().prop_map(Op::Delete),
        1 => idx.clone().prop_map(Op::Undelete),
        1 => (idx.clone(), mode).prop_map(|(i, m)| Op::Purge(i, m)),
        1 => idx.clone().prop_map(Op::AssignServerId),
        1 => idx.prop_map(Op::Select),
    ]
}

/// Picks the `i`-th present id of a kind (modulo), if any.
fn pick(ds: &DataSet, kind: Option<PrimitiveKind>, i: usize) -> Option<PrimitiveId> {
    let mut ids: Vec<PrimitiveId> = ds
        .all_primitives()
        .map(Primitive::id)
        .filter(|id| kind.map_or(true, |k| id.kind == k))
        .collect();
    ids.sort();
    if ids.is_empty() {
        None
    } else {
        Some(ids[i % ids.len()])
    }
}

fn points(ds: &DataSet, picks: &[usize]) -> Vec<PrimitiveId> {
    picks
        .iter()
        .filter_map(|i| pick(ds, Some(PrimitiveKind::Point), *i))
        .collect()
}

fn apply(ds: &mut DataSet, op: &Op, next_server_id: &mut i64) -> Result<(), DataSetError> {
    match op {
        Op::AddPoint(lat, lon) => {
            let id = ds.allocate_id(PrimitiveKind::Point);
            ds.add(Primitive::point(id.id, LatLon::new(*lat, *lon)))
        }
        Op::AddLine(picks) => {
            let nodes = points(ds, picks);
            let id = ds.allocate_id(PrimitiveKind::Line);
            ds.add(Primitive::line(id.id, nodes.iter().map(|n| n.id)))
        }
        Op::AddRelation(picks) => {
            let members = picks
                .iter()
                .filter_map(|i| pick(ds, None, *i))
                .map(|target| Member::new("", target))
                .collect();
            let id = ds.allocate_id(PrimitiveKind::Relation);
            ds.add(Primitive::relation(id.id, members))
        }
        Op::SetNodes(l, picks) => match pick(ds, Some(PrimitiveKind::Line), *l) {
            Some(line) => {
                let nodes = points(ds, picks);
                ds.set_line_nodes(line, nodes).map(|_| ())
            }
            None => Ok(()),
        },
        Op::Delete(i) => match pick(ds, None, *i) {
            Some(id) => ds.set_deleted(id, true).map(|_| ()),
            None => Ok(()),
        },
        Op::Undelete(i) => match pick(ds, None, *i) {
            Some(id) => ds.set_deleted(id, false).map(|_| ()),
            None => Ok(()),
        },
        Op::Purge(i, mode) => match pick(ds, None, *i) {
            Some(id) => ds.remove(id, *mode).map(|_| ()),
            None => Ok(()),
        },
        Op::AssignServerId(i) => match pick(ds, None, *i).filter(|id| id.is_new()) {
            Some(id) => {
                *next_server_id += 1;
                ds.assign_server_id(id, *next_server_id, Version(1)).map(|_| ())
            }
            None => Ok(()),
        },
        Op::Select(i) => match pick(ds, None, *i) {
            Some(id) => ds.add_selected([id]),
            None => Ok(()),
        },
    }
}

proptest! {
    #[test]
    fn mutations_keep_index_consistent(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let mut ds = DataSet::new();
        let mut server_id = 1000;
        for op in &ops {
            let before = ds.snapshot();
            match apply(&mut ds, op, &mut server_id) {
                Ok(()) => {}
                Err(err) => {
                    let expected_kind = err.is_integrity_violation() || matches!(err, DataSetError::NotFound { .. });
                    prop_assert!(expected_kind);
                    prop_assert_eq!(&ds.snapshot(), &before, "failed {:?} changed the store", op);
                }
            }
            prop_assert_eq!(ds.verify_integrity(), Ok(()));
        }
    }

    #[test]
    fn snapshot_reload_is_identical(ops in proptest::collection::vec(op_strategy(), 1..30)) {
        let mut ds = DataSet::new();
        let mut server_id = 1000;
        for op in &ops {
            let _ = apply(&mut ds, op, &mut server_id);
        }
        let snap = ds.snapshot();
        let loaded = DataSet::from_snapshot(snap.clone()).unwrap();
        prop_assert_eq!(loaded.snapshot(), snap);
    }
}

#[test]
fn referrers_of_shared_point() {
    let mut ds = DataSet::new();
    ds.add(Primitive::point(1, LatLon::new(0.0, 0.0))).unwrap();
    ds.add(Primitive::point(2, LatLon::new(0.0, 1.0))).unwrap();
    ds.add(Primitive::line(10, [1, 2])).unwrap();
    ds.add(Primitive::line(11, [2, 1, 2])).unwrap();
    assert_eq!(
        ds.referrers(PrimitiveId::point(2)),
        &[PrimitiveId::line(10), PrimitiveId::line(11)]
    );
    ds.remove(PrimitiveId::line(10), RemovalMode::Reject).unwrap();
    assert_eq!(ds.referrers(PrimitiveId::point(1)), &[PrimitiveId::line(11)]);
    ds.verify_integrity().unwrap();
}
