use std::collections::BTreeSet;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use opr_place_sync::domain::EntityType;
use opr_place_sync::error::OprError;
use opr_place_sync::store::{JsonSyncStateStore, Store};
use opr_place_sync::sync_state::{SyncState, SyncStateStore};

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, Store::new_with_root(root))
}

#[test]
fn layout_paths() {
    let (_temp, store) = temp_store();
    assert!(store.sync_state_path("amenity").starts_with(store.root()));
    assert!(store.sync_state_path("amenity").ends_with("sync-state/amenity.json"));
    assert!(store.ledger_snapshot_path().ends_with("ledger.json"));
    assert!(store.lock_path().ends_with("sync.lock"));
}

#[test]
fn json_roundtrip_is_atomic() {
    let (_temp, store) = temp_store();
    let path = store.root().join("nested").join("value.json");
    assert_eq!(Store::read_json::<Vec<u32>>(&path).unwrap(), None);

    Store::write_json_atomic(&path, &vec![1u32, 2, 3]).unwrap();
    Store::write_json_atomic(&path, &vec![4u32]).unwrap();
    assert_eq!(Store::read_json::<Vec<u32>>(&path).unwrap(), Some(vec![4]));

    let leftovers = std::fs::read_dir(path.parent().unwrap().as_std_path())
        .unwrap()
        .count();
    assert_eq!(leftovers, 1);
}

#[test]
fn corrupt_json_is_a_filesystem_error() {
    let (_temp, store) = temp_store();
    let path = store.root().join("broken.json");
    Store::write_bytes_atomic(&path, b"{ nope").unwrap();
    let err = Store::read_json::<Vec<u32>>(&path).unwrap_err();
    assert_matches!(err, OprError::Filesystem(_));
}

#[test]
fn sync_state_store_get_put() {
    let (_temp, store) = temp_store();
    let durable = JsonSyncStateStore::new(store.clone());
    assert_eq!(durable.get("amenity").unwrap(), None);

    let state = SyncState {
        key: "amenity".to_string(),
        values: BTreeSet::from(["cafe".to_string()]),
        kinds: BTreeSet::from([EntityType::Node, EntityType::Way]),
        bbox: None,
        date: "2024-03-01T10:00:00Z".to_string(),
    };
    durable.put("amenity", &state).unwrap();
    assert_eq!(durable.get("amenity").unwrap(), Some(state));
    assert!(store.sync_state_path("amenity").as_std_path().exists());
}

#[test]
fn cycle_lock_is_exclusive() {
    let (_temp, store) = temp_store();
    let lock = store.acquire_lock().unwrap();
    assert!(store.lock_path().as_std_path().exists());

    let err = store.acquire_lock().unwrap_err();
    assert_matches!(err, OprError::CycleInProgress(_));

    drop(lock);
    assert!(!store.lock_path().as_std_path().exists());
    assert!(store.acquire_lock().is_ok());
}
