//! History behaviour across merges, conflict resolution and uploads.

use std::sync::{Arc, Mutex};

use geoedit_command::{
    apply_upload_result, merge_remote, resolution_command, CommandHistory, DeleteMode, EditCommand,
    EditError, HistoryEvent, Resolution, UploadResult, UploadSet,
};
use geoedit_core::{
    DataSet, DataSetEvent, LatLon, Primitive, PrimitiveId, PrimitiveKind, TagChange, Version,
};

fn synced() -> DataSet {
    let mut ds = DataSet::new();
    ds.add(Primitive::point(1, LatLon::new(0.0, 0.0)).with_version(Version(1)))
        .unwrap();
    ds.add(Primitive::point(2, LatLon::new(0.0, 1.0)).with_version(Version(1)))
        .unwrap();
    ds.add(Primitive::line(10, [1, 2]).with_version(Version(1))).unwrap();
    ds
}

fn recorder(ds: &mut DataSet) -> Arc<Mutex<Vec<DataSetEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    ds.add_listener(Arc::new(move |e: &DataSetEvent| sink.lock().unwrap().push(e.clone())));
    events
}

#[test]
fn composite_command_notifies_once() {
    let mut ds = synced();
    let events = recorder(&mut ds);
    let mut history = CommandHistory::default();

    let command = EditCommand::delete(&ds, &[PrimitiveId::point(1)], DeleteMode::Cascade).unwrap();
    history.execute(&mut ds, command).unwrap();
    let structural = |events: &[DataSetEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, DataSetEvent::StructureChanged(_)))
            .count()
    };
    assert_eq!(structural(&events.lock().unwrap()), 1);

    history.undo(&mut ds).unwrap();
    assert_eq!(structural(&events.lock().unwrap()), 2);
    assert!(!ds.get(PrimitiveId::line(10)).unwrap().is_deleted());
}

#[test]
fn upload_then_undo_of_purged_edit_truncates_history() {
    let mut ds = synced();
    let mut history = CommandHistory::default();
    let history_events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&history_events);
    history.add_listener(Arc::new(move |e: &HistoryEvent| sink.lock().unwrap().push(e.clone())));

    let delete = EditCommand::delete(&ds, &[PrimitiveId::line(10)], DeleteMode::Strict).unwrap();
    history.execute(&mut ds, delete).unwrap();

    let set = UploadSet::from_dataset(&ds).unwrap();
    assert_eq!(set.ids(), vec![PrimitiveId::line(10)]);
    let result = UploadResult {
        deleted: vec![PrimitiveId::line(10)],
        ..UploadResult::default()
    };
    apply_upload_result(&mut ds, &set, &result).unwrap();
    assert!(!ds.contains(PrimitiveId::line(10)));

    let err = history.undo(&mut ds).unwrap_err();
    assert!(matches!(err, EditError::InvalidHistoryState { discarded: 1, .. }));
    assert!(!history.can_undo());
    assert!(!history.can_redo());
    assert!(!ds.contains(PrimitiveId::line(10)));
    assert!(history_events
        .lock()
        .unwrap()
        .contains(&HistoryEvent::Truncated { discarded: 1 }));
}

#[test]
fn undo_of_created_primitive_after_upload_fails_cleanly() {
    let mut ds = synced();
    let mut history = CommandHistory::default();
    let id = ds.allocate_id(PrimitiveKind::Point);
    let add = EditCommand::Add {
        primitive: Primitive::point(id.id, LatLon::new(2.0, 2.0)).with_modified(true),
    };
    history.execute(&mut ds, add).unwrap();

    let set = UploadSet::from_dataset(&ds).unwrap();
    let result = UploadResult {
        created: vec![(id, 300, Version(1))],
        ..UploadResult::default()
    };
    apply_upload_result(&mut ds, &set, &result).unwrap();
    let before = ds.snapshot();

    assert!(matches!(
        history.undo(&mut ds),
        Err(EditError::InvalidHistoryState { .. })
    ));
    assert_eq!(ds.snapshot(), before);
    assert!(ds.contains(PrimitiveId::point(300)));
}

#[test]
fn merge_conflict_resolution_is_undoable() {
    let mut ds = synced();
    let mut history = CommandHistory::default();
    let rename = EditCommand::ChangeTags {
        ids: vec![PrimitiveId::point(1)],
        changes: vec![TagChange::set("name", "local")],
    };
    history.execute(&mut ds, rename).unwrap();

    let remote = Primitive::point(1, LatLon::new(0.0, 0.0))
        .with_version(Version(2))
        .with_tag("name", "remote");
    let plan = merge_remote(&ds, vec![remote.clone()]);
    assert_eq!(plan.report.conflicts, vec![PrimitiveId::point(1)]);
    history.execute(&mut ds, plan.command.unwrap()).unwrap();
    assert!(ds.conflicts().contains(PrimitiveId::point(1)));

    // Structural edits on the conflicted point are refused.
    let moving = EditCommand::Move {
        ids: vec![PrimitiveId::point(1)],
        dlat: 1.0,
        dlon: 0.0,
    };
    assert_eq!(moving.blocked_by(ds.conflicts()), vec![PrimitiveId::point(1)]);

    let resolve = resolution_command(&ds, PrimitiveId::point(1), Resolution::KeepRemote).unwrap();
    history.execute(&mut ds, resolve).unwrap();
    assert!(ds.conflicts().is_empty());
    assert_eq!(ds.get(PrimitiveId::point(1)), Some(&remote));

    history.undo(&mut ds).unwrap();
    let conflict = ds.conflicts().get(PrimitiveId::point(1)).unwrap();
    assert_eq!(conflict.remote, remote);
    assert_eq!(
        ds.get(PrimitiveId::point(1)).unwrap().tags().get("name"),
        Some("local")
    );

    history.undo_many(&mut ds, 2).unwrap();
    assert!(ds.conflicts().is_empty());
    assert_eq!(ds.snapshot(), synced().snapshot());
}

#[test]
fn history_limit_evicts_oldest() {
    let mut ds = synced();
    let mut history = CommandHistory::new(3);
    for i in 0..5 {
        let command = EditCommand::ChangeTags {
            ids: vec![PrimitiveId::line(10)],
            changes: vec![TagChange::set("ref", i.to_string())],
        };
        history.execute(&mut ds, command).unwrap();
    }
    assert_eq!(history.undo_len(), 3);
    let undone = history.undo_many(&mut ds, 10).unwrap();
    assert_eq!(undone.len(), 3);
    assert_eq!(ds.get(PrimitiveId::line(10)).unwrap().tags().get("ref"), Some("1"));
    assert!(matches!(history.undo(&mut ds), Err(EditError::NothingToUndo)));
}
