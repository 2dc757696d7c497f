use std::sync::Mutex;

use assert_matches::assert_matches;

use opr_place_sync::domain::{BBox, EntityType, LatLon};
use opr_place_sync::error::OprError;
use opr_place_sync::overpass::{FeedReader, OverpassClient, OverpassQuery, TagFilter};
use opr_place_sync::planner::{Probe, QueryPlanner, Region, SplitSettings};

struct CountingOverpass {
    points: Vec<LatLon>,
    refuse_world: bool,
    probes: Mutex<usize>,
}

impl CountingOverpass {
    fn new(points: Vec<LatLon>) -> Self {
        Self {
            points,
            refuse_world: false,
            probes: Mutex::new(0),
        }
    }
}

impl OverpassClient for CountingOverpass {
    fn latest_timestamp(&self) -> Result<String, OprError> {
        Ok("2024-03-01T10:00:00Z".to_string())
    }

    fn count(&self, query: &OverpassQuery) -> Result<u64, OprError> {
        *self.probes.lock().unwrap() += 1;
        let bbox = query.bbox.unwrap_or(BBox::WORLD);
        if self.refuse_world && bbox == BBox::WORLD {
            return Err(OprError::UpstreamTooLarge("runtime error".to_string()));
        }
        Ok(self.points.iter().filter(|p| bbox.contains(**p)).count() as u64)
    }

    fn fetch(&self, _query: &OverpassQuery) -> Result<FeedReader, OprError> {
        Err(OprError::Decode("not used".to_string()))
    }
}

fn query() -> OverpassQuery {
    OverpassQuery::snapshot(
        "2024-03-01T10:00:00Z",
        TagFilter {
            key: "amenity".to_string(),
            values: vec!["cafe".to_string()],
            kinds: vec![EntityType::Node],
        },
        None,
    )
}

fn spread_points() -> Vec<LatLon> {
    vec![
        LatLon::new(48.85, 2.35),
        LatLon::new(48.86, 2.34),
        LatLon::new(40.71, -74.0),
        LatLon::new(-33.86, 151.2),
        LatLon::new(35.68, 139.69),
        LatLon::new(-22.9, -43.2),
        LatLon::new(55.75, 37.61),
    ]
}

#[test]
fn small_region_is_fetched_directly() {
    let client = CountingOverpass::new(spread_points());
    let planner = QueryPlanner::default();
    let probe = planner
        .probe(&client, &query(), &Region::root(BBox::WORLD))
        .unwrap();
    assert_eq!(probe, Probe::Fetch(7));
}

#[test]
fn empty_region_is_skipped() {
    let client = CountingOverpass::new(spread_points());
    let planner = QueryPlanner::default();
    let region = Region::root("0,-30,10,-20".parse().unwrap());
    assert_eq!(planner.probe(&client, &query(), &region).unwrap(), Probe::Empty);
}

#[test]
fn leaves_cover_every_point() {
    let points = spread_points();
    let client = CountingOverpass::new(points.clone());
    let planner = QueryPlanner::new(SplitSettings {
        threshold: 3,
        max_depth: 6,
    });

    let leaves = planner
        .leaves(&client, &query(), Region::root(BBox::WORLD))
        .unwrap();
    assert!(leaves.len() > 1);
    assert!(leaves.iter().all(|leaf| leaf.depth >= 1));
    for point in &points {
        assert!(leaves.iter().any(|leaf| leaf.bbox.contains(*point)));
    }
    let fetched: u64 = leaves
        .iter()
        .map(|leaf| client.count(&query().with_bbox(leaf.bbox)).unwrap())
        .sum();
    assert_eq!(fetched, points.len() as u64);
}

#[test]
fn failed_probe_counts_as_oversized() {
    let mut client = CountingOverpass::new(spread_points());
    client.refuse_world = true;
    let planner = QueryPlanner::default();

    let probe = planner
        .probe(&client, &query(), &Region::root(BBox::WORLD))
        .unwrap();
    assert_matches!(probe, Probe::Split(cells) if cells.len() == 32);

    let leaves = planner
        .leaves(&client, &query(), Region::root(BBox::WORLD))
        .unwrap();
    assert_eq!(leaves.len(), 5);
    assert!(*client.probes.lock().unwrap() > 32);
}

#[test]
fn dense_cluster_exceeds_max_depth() {
    let client = CountingOverpass::new(vec![LatLon::new(48.85, 2.35); 5]);
    let planner = QueryPlanner::new(SplitSettings {
        threshold: 2,
        max_depth: 2,
    });
    let err = planner
        .leaves(&client, &query(), Region::root(BBox::WORLD))
        .unwrap_err();
    assert_matches!(err, OprError::SplitTooDeep { max_depth: 2, .. });
}
