use std::io::{BufReader, Cursor};
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::json;

use opr_place_sync::app::{App, ProgressEvent, ProgressSink};
use opr_place_sync::config::{Config, ConfigLoader, RetrySection, SplitSection, TagGroupEntry};
use opr_place_sync::domain::{ExternalKey, EntityType, LatLon};
use opr_place_sync::error::OprError;
use opr_place_sync::ledger::{Ledger, MemoryLedger};
use opr_place_sync::output::JsonOutput;
use opr_place_sync::overpass::{FeedReader, OverpassClient, OverpassQuery};
use opr_place_sync::record::{LocalRecord, PLACE_TYPE};
use opr_place_sync::store::{JsonSyncStateStore, Store};
use opr_place_sync::sync_state::{SyncStateStore, SyncStatus, tracked_state};

struct Place {
    id: i64,
    lat: f64,
    lon: f64,
    name: &'static str,
}

struct MockOverpass {
    latest: Mutex<String>,
    places: Vec<Place>,
    diff: Mutex<String>,
    counts: Mutex<usize>,
    fetches: Mutex<usize>,
    reject_world: bool,
}

impl MockOverpass {
    fn new(latest: &str) -> Self {
        Self {
            latest: Mutex::new(latest.to_string()),
            places: vec![
                Place { id: 1, lat: 10.0, lon: 10.0, name: "Alpha" },
                Place { id: 2, lat: 10.0, lon: -100.0, name: "Beta" },
                Place { id: 3, lat: -30.0, lon: 50.0, name: "Gamma" },
                Place { id: 4, lat: 60.0, lon: 120.0, name: "Delta" },
                Place { id: 5, lat: 61.0, lon: 121.0, name: "Epsilon" },
            ],
            diff: Mutex::new("<osm></osm>".to_string()),
            counts: Mutex::new(0),
            fetches: Mutex::new(0),
            reject_world: false,
        }
    }

    fn matching(&self, query: &OverpassQuery) -> Vec<&Place> {
        self.places
            .iter()
            .filter(|place| {
                query
                    .bbox
                    .is_none_or(|bbox| bbox.contains(LatLon::new(place.lat, place.lon)))
            })
            .collect()
    }
}

impl OverpassClient for MockOverpass {
    fn latest_timestamp(&self) -> Result<String, OprError> {
        Ok(self.latest.lock().unwrap().clone())
    }

    fn count(&self, query: &OverpassQuery) -> Result<u64, OprError> {
        *self.counts.lock().unwrap() += 1;
        Ok(self.matching(query).len() as u64)
    }

    fn fetch(&self, query: &OverpassQuery) -> Result<FeedReader, OprError> {
        *self.fetches.lock().unwrap() += 1;
        if self.reject_world && query.bbox.is_none_or(|bbox| bbox.spans_full_width()) {
            return Err(OprError::UpstreamStatus {
                status: 504,
                message: "Gateway Timeout".to_string(),
            });
        }
        let body = if query.is_diff() {
            self.diff.lock().unwrap().clone()
        } else {
            let nodes = self
                .matching(query)
                .iter()
                .map(|place| {
                    format!(
                        r#"<node id="{}" lat="{}" lon="{}" version="1" timestamp="2024-02-01T00:00:00Z"><tag k="amenity" v="cafe"/><tag k="name" v="{}"/></node>"#,
                        place.id, place.lat, place.lon, place.name
                    )
                })
                .collect::<String>();
            format!("<osm>{nodes}</osm>")
        };
        Ok(Box::new(BufReader::new(Cursor::new(body.into_bytes()))))
    }
}

struct Silent;

impl ProgressSink for Silent {
    fn event(&self, _event: ProgressEvent) {}
}

fn test_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, Store::new_with_root(root))
}

fn test_app(store: &Store, client: MockOverpass) -> App<MockOverpass, JsonSyncStateStore> {
    test_app_with_threshold(store, client, 3)
}

fn test_app_with_threshold(
    store: &Store,
    client: MockOverpass,
    threshold: u64,
) -> App<MockOverpass, JsonSyncStateStore> {
    let config = Config {
        workers: Some(3),
        places_per_operation: Some(2),
        operations_per_block: Some(2),
        tag_groups: vec![TagGroupEntry::Shorthand("amenity=cafe".to_string())],
        split: Some(SplitSection {
            threshold: Some(threshold),
            max_depth: None,
        }),
        stale_index: Some(RetrySection {
            attempts: None,
            backoff_ms: Some(1),
        }),
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    App::new(
        store.clone(),
        resolved,
        client,
        JsonSyncStateStore::new(store.clone()),
        MemoryLedger::new("osm-sync"),
    )
}

fn place_for(ledger: &MemoryLedger, id: i64) -> LocalRecord {
    let value = ledger
        .find_by_external_index(PLACE_TYPE, "osmid", ExternalKey::new(EntityType::Node, id))
        .unwrap()
        .unwrap();
    LocalRecord::from_value(&value).unwrap()
}

#[test]
fn fresh_sync_splits_and_creates_every_place() {
    let (_temp, store) = test_store();
    let app = test_app(&store, MockOverpass::new("2024-03-01T10:07:00Z"));
    let cancel = AtomicBool::new(false);

    let result = app.sync(&cancel, &Silent).unwrap();
    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.groups[0].status, SyncStatus::Fresh);
    assert_eq!(result.groups[0].target, "2024-03-01T10:00:00Z");
    assert_eq!(result.stats.created, 5);
    assert!(result.tasks > 1);
    assert!(*app.client().counts.lock().unwrap() > 1);

    let ledger = app.ledger();
    assert_eq!(ledger.objects(PLACE_TYPE).unwrap().len(), 5);
    assert_eq!(ledger.all_external_ids(PLACE_TYPE).unwrap().len(), 5);
    assert!(ledger.block_count() >= 1);

    let tracked = tracked_state(ledger.bot_state("osm-sync").unwrap().as_ref(), "amenity").unwrap();
    assert_eq!(tracked.date, "2024-03-01T10:00:00Z");
    let durable = JsonSyncStateStore::new(store.clone())
        .get("amenity")
        .unwrap()
        .unwrap();
    assert_eq!(durable, tracked);
    assert!(store.ledger_snapshot_path().as_std_path().exists());
    assert!(JsonOutput::print_sync(&result).is_ok());
}

#[test]
fn failed_world_fetch_is_split_and_retried_per_cell() {
    let (_temp, store) = test_store();
    let client = MockOverpass {
        reject_world: true,
        ..MockOverpass::new("2024-03-01T10:07:00Z")
    };
    let app = test_app_with_threshold(&store, client, 100);
    let cancel = AtomicBool::new(false);

    let result = app.sync(&cancel, &Silent).unwrap();
    assert_eq!(result.groups[0].status, SyncStatus::Fresh);
    assert_eq!(result.stats.created, 5);
    assert!(result.tasks > 1);
    assert!(*app.client().fetches.lock().unwrap() > 1);
    assert_eq!(app.ledger().all_external_ids(PLACE_TYPE).unwrap().len(), 5);
}

#[test]
fn repeated_cycle_is_up_to_date() {
    let (_temp, store) = test_store();
    let app = test_app(&store, MockOverpass::new("2024-03-01T10:07:00Z"));
    let cancel = AtomicBool::new(false);
    app.sync(&cancel, &Silent).unwrap();
    let fetches = *app.client().fetches.lock().unwrap();

    let result = app.sync(&cancel, &Silent).unwrap();
    assert_eq!(result.groups[0].status, SyncStatus::UpToDate);
    assert_eq!(result.groups[0].requests, 0);
    assert_eq!(result.stats.processed, 0);
    assert_eq!(*app.client().fetches.lock().unwrap(), fetches);
}

#[test]
fn incremental_cycle_applies_diff() {
    let (_temp, store) = test_store();
    let client = MockOverpass::new("2024-03-01T10:07:00Z");
    *client.diff.lock().unwrap() = r#"<osm>
  <action type="modify">
    <old><node id="1" lat="10" lon="10" version="1"><tag k="amenity" v="cafe"/><tag k="name" v="Alpha"/></node></old>
    <new><node id="1" lat="10" lon="10" version="2" timestamp="2024-03-01T11:00:00Z"><tag k="amenity" v="cafe"/><tag k="name" v="Alpha"/><tag k="cuisine" v="coffee_shop"/></node></new>
  </action>
  <action type="delete">
    <old><node id="2" lat="10" lon="-100" version="1"><tag k="amenity" v="cafe"/></node></old>
    <new><node id="2" visible="false" version="2"/></new>
  </action>
</osm>"#
        .to_string();
    let app = test_app(&store, client);
    let cancel = AtomicBool::new(false);
    app.sync(&cancel, &Silent).unwrap();

    let before = place_for(app.ledger(), 2);
    *app_latest(&app) = "2024-03-01T11:20:00Z".to_string();

    let result = app.sync(&cancel, &Silent).unwrap();
    assert_eq!(result.groups[0].status, SyncStatus::Incremental);
    assert_eq!(result.groups[0].from, "2024-03-01T10:00:00Z");
    assert_eq!(result.groups[0].target, "2024-03-01T11:15:00Z");
    assert_eq!(result.stats.edited, 1);
    assert_eq!(result.stats.tombstoned, 1);

    let edited = place_for(app.ledger(), 1);
    assert_eq!(
        edited.source.osm[0].tags.get("cuisine").map(String::as_str),
        Some("coffee_shop")
    );
    assert_eq!(edited.source.osm[0].version, Some(2));

    let removed = app
        .ledger()
        .object(PLACE_TYPE, &[before.id.tile.clone(), before.id.suffix.clone()])
        .unwrap()
        .map(|value| LocalRecord::from_value(&value).unwrap())
        .unwrap();
    assert!(removed.source.osm[0].is_deleted());
    assert_eq!(removed.source.old_osm_ids.len(), 1);
    assert!(!removed.is_live());
}

fn app_latest(app: &App<MockOverpass, JsonSyncStateStore>) -> std::sync::MutexGuard<'_, String> {
    app.client().latest.lock().unwrap()
}

#[test]
fn cancelled_cycle_keeps_sync_state() {
    let (_temp, store) = test_store();
    let app = test_app(&store, MockOverpass::new("2024-03-01T10:07:00Z"));
    let cancel = AtomicBool::new(true);

    let err = app.sync(&cancel, &Silent).unwrap_err();
    assert_matches!(err, OprError::Cancelled);
    assert!(
        JsonSyncStateStore::new(store.clone())
            .get("amenity")
            .unwrap()
            .is_none()
    );
    assert!(!store.lock_path().as_std_path().exists());
}

#[test]
fn concurrent_cycle_is_rejected() {
    let (_temp, store) = test_store();
    let app = test_app(&store, MockOverpass::new("2024-03-01T10:07:00Z"));
    let _held = store.acquire_lock().unwrap();

    let err = app.sync(&AtomicBool::new(false), &Silent).unwrap_err();
    assert_matches!(err, OprError::CycleInProgress(_));
}

#[test]
fn status_lists_planned_requests() {
    let (_temp, store) = test_store();
    let app = test_app(&store, MockOverpass::new("2024-03-01T10:07:00Z"));

    let result = app.status(&Silent).unwrap();
    assert_eq!(result.groups[0].status, SyncStatus::Fresh);
    assert_eq!(result.groups[0].tracked_date, None);
    assert_eq!(result.groups[0].requests.len(), 1);
    assert!(result.groups[0].requests[0].contains("node[\"amenity\"=\"cafe\"]"));
}

#[test]
fn merge_dry_run_reads_feature_file() {
    let (temp, store) = test_store();
    let app = test_app(&store, MockOverpass::new("2024-03-01T10:07:00Z"));
    let input = temp.path().join("features.json");
    let features = json!([
        {"place_id": ["u09tvw", "new"], "lat": 48.8570, "lon": 2.3522, "tags": {"name": "Cafe de Paris"}},
        {"place_id": ["u09tvw", "old"], "lat": 48.8566, "lon": 2.3522, "tags": {"name": "de paris cafe"}, "deleted": true}
    ]);
    std::fs::write(&input, serde_json::to_vec(&features).unwrap()).unwrap();
    let input = Utf8PathBuf::from_path_buf(input).unwrap();

    let result = app.merge(Some(&input), true, &Silent).unwrap();
    assert_eq!(result.features, 2);
    assert_eq!(result.report.groups, 1);
    assert_eq!(result.report.merged, 1);
    assert!(result.report.dry_run);
    assert!(result.report_path.is_none());
}
