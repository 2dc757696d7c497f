use assert_matches::assert_matches;

use opr_place_sync::domain::{BBox, EntityType, ExternalKey, LatLon};
use opr_place_sync::error::OprError;

#[test]
fn parse_entity_type() {
    let kind: EntityType = " Relation ".parse().unwrap();
    assert_eq!(kind, EntityType::Relation);
    assert_eq!(kind.to_string(), "relation");

    let err = "area".parse::<EntityType>().unwrap_err();
    assert_matches!(err, OprError::Config(_));
}

#[test]
fn parse_external_key_valid() {
    let key: ExternalKey = "node/123456789".parse().unwrap();
    assert_eq!(key.entity_type, EntityType::Node);
    assert_eq!(key.id, 123456789);
}

#[test]
fn parse_external_key_missing_separator() {
    let err = "node123".parse::<ExternalKey>().unwrap_err();
    assert_matches!(err, OprError::MalformedRecord(_));
}

#[test]
fn same_id_differs_by_type() {
    let node = ExternalKey::new(EntityType::Node, 5);
    let way = ExternalKey::new(EntityType::Way, 5);
    assert_ne!(node, way);
}

#[test]
fn parse_bbox_valid() {
    let bbox: BBox = "45, 5, 48, 10".parse().unwrap();
    assert_eq!(bbox.width(), 5.0);
    assert_eq!(bbox.height(), 3.0);
    assert!(bbox.contains(LatLon::new(46.0, 7.0)));
    assert!(bbox.contains(LatLon::new(45.0, 10.0)));
    assert!(!bbox.contains(LatLon::new(44.9, 7.0)));
    assert_eq!(bbox.to_overpass(), "45.0000000,5.0000000,48.0000000,10.0000000");
}

#[test]
fn parse_bbox_invalid() {
    assert_matches!("45,5,48".parse::<BBox>(), Err(OprError::Config(_)));
    assert_matches!("45,5,48,x".parse::<BBox>(), Err(OprError::Config(_)));
    assert_matches!(BBox::new(0.0, 0.0, 95.0, 1.0), Err(OprError::Config(_)));
    assert_matches!(BBox::new(0.0, 2.0, 1.0, 1.0), Err(OprError::Config(_)));
    assert_matches!(BBox::new(f64::NAN, 0.0, 1.0, 1.0), Err(OprError::Config(_)));
}

#[test]
fn bbox_serializes_at_full_precision() {
    let bbox = BBox::new(1.0, 2.0, 3.0, 4.0).unwrap();
    let json = serde_json::to_string(&bbox).unwrap();
    assert_eq!(json, "\"1,2,3,4\"");
    let back: BBox = serde_json::from_str(&json).unwrap();
    assert_eq!(back, bbox);

    let precise = BBox::new(48.123456789, 11.5, 48.2, 11.612345678).unwrap();
    let back: BBox = serde_json::from_str(&serde_json::to_string(&precise).unwrap()).unwrap();
    assert_eq!(back, precise);
    assert_eq!(precise.to_overpass(), "48.1234568,11.5000000,48.2000000,11.6123457");
}
