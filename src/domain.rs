use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Node,
    Way,
    Relation,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Node => "node",
            EntityType::Way => "way",
            EntityType::Relation => "relation",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = OprError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "node" => Ok(EntityType::Node),
            "way" => Ok(EntityType::Way),
            "relation" => Ok(EntityType::Relation),
            other => Err(OprError::Config(format!("unknown entity type: {other}"))),
        }
    }
}

/// Identity of an upstream object: ids are only unique per entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalKey {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: i64,
}

impl ExternalKey {
    pub fn new(entity_type: EntityType, id: i64) -> Self {
        Self { entity_type, id }
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

impl FromStr for ExternalKey {
    type Err = OprError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, id) = value
            .trim()
            .split_once('/')
            .ok_or_else(|| OprError::MalformedRecord(format!("invalid external key: {value}")))?;
        let id = id
            .parse::<i64>()
            .map_err(|_| OprError::MalformedRecord(format!("invalid external key: {value}")))?;
        Ok(Self::new(kind.parse()?, id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Axis-aligned box in degrees. Serialized the Overpass way: `south,west,north,east`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BBox {
    pub const WORLD: BBox = BBox {
        min_lat: -90.0,
        min_lon: -180.0,
        max_lat: 90.0,
        max_lon: 180.0,
    };

    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Result<Self, OprError> {
        let valid = min_lat.is_finite()
            && min_lon.is_finite()
            && max_lat.is_finite()
            && max_lon.is_finite()
            && min_lat < max_lat
            && min_lon < max_lon
            && (-90.0..=90.0).contains(&min_lat)
            && (-90.0..=90.0).contains(&max_lat)
            && (-180.0..=180.0).contains(&min_lon)
            && (-180.0..=180.0).contains(&max_lon);
        if !valid {
            return Err(OprError::Config(format!(
                "invalid bbox: {min_lat},{min_lon},{max_lat},{max_lon}"
            )));
        }
        Ok(Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        })
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn spans_full_width(&self) -> bool {
        self.width() >= BBox::WORLD.width()
    }

    pub fn spans_full_height(&self) -> bool {
        self.height() >= BBox::WORLD.height()
    }

    pub fn contains(&self, point: LatLon) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lon >= self.min_lon
            && point.lon <= self.max_lon
    }

    pub fn to_overpass(&self) -> String {
        format!(
            "{:.7},{:.7},{:.7},{:.7}",
            self.min_lat, self.min_lon, self.max_lat, self.max_lon
        )
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_overpass())
    }
}

impl FromStr for BBox {
    type Err = OprError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| OprError::Config(format!("invalid bbox: {value}")))?;
        match parts.as_slice() {
            [south, west, north, east] => BBox::new(*south, *west, *north, *east),
            _ => Err(OprError::Config(format!("invalid bbox: {value}"))),
        }
    }
}

/// Stored at full precision so a saved bbox compares equal to the configured one.
impl Serialize for BBox {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!(
            "{},{},{},{}",
            self.min_lat, self.min_lon, self.max_lat, self.max_lon
        ))
    }
}

impl<'de> Deserialize<'de> for BBox {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub version: Option<u64>,
    pub timestamp: Option<String>,
    pub changeset: Option<u64>,
    pub uid: Option<u64>,
    pub user: Option<String>,
    pub visible: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WayNode {
    pub id: i64,
    pub position: Option<LatLon>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationMember {
    pub member_type: EntityType,
    pub reference: i64,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Node,
    Way { nodes: Vec<WayNode> },
    Relation { members: Vec<RelationMember> },
}

impl Shape {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Shape::Node => EntityType::Node,
            Shape::Way { .. } => EntityType::Way,
            Shape::Relation { .. } => EntityType::Relation,
        }
    }
}

/// One upstream object snapshot. Lines and relations carry a representative point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEntity {
    pub id: i64,
    pub shape: Shape,
    pub position: LatLon,
    pub tags: BTreeMap<String, String>,
    pub meta: VersionMeta,
}

impl ExternalEntity {
    pub fn key(&self) -> ExternalKey {
        ExternalKey::new(self.shape.entity_type(), self.id)
    }

    pub fn entity_type(&self) -> EntityType {
        self.shape.entity_type()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

impl FromStr for ChangeKind {
    type Err = OprError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(ChangeKind::Create),
            "modify" => Ok(ChangeKind::Modify),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(OprError::MalformedRecord(format!(
                "unknown diff action: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffEntity {
    Create { new: ExternalEntity },
    Modify { old: ExternalEntity, new: ExternalEntity },
    Delete { old: ExternalEntity },
}

impl DiffEntity {
    pub fn from_parts(
        kind: ChangeKind,
        old: Option<ExternalEntity>,
        new: Option<ExternalEntity>,
    ) -> Result<Self, OprError> {
        match (kind, old, new) {
            (ChangeKind::Create, _, Some(new)) => Ok(DiffEntity::Create { new }),
            (ChangeKind::Modify, Some(old), Some(new)) => Ok(DiffEntity::Modify { old, new }),
            (ChangeKind::Delete, Some(old), _) => Ok(DiffEntity::Delete { old }),
            (kind, old, new) => Err(OprError::MalformedRecord(format!(
                "{kind:?} action with old={} new={}",
                old.is_some(),
                new.is_some()
            ))),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            DiffEntity::Create { .. } => ChangeKind::Create,
            DiffEntity::Modify { .. } => ChangeKind::Modify,
            DiffEntity::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// The key the local index is searched with.
    pub fn lookup_key(&self) -> ExternalKey {
        match self {
            DiffEntity::Create { new } => new.key(),
            DiffEntity::Modify { old, .. } => old.key(),
            DiffEntity::Delete { old } => old.key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn node(id: i64) -> ExternalEntity {
        ExternalEntity {
            id,
            shape: Shape::Node,
            position: LatLon::new(1.0, 2.0),
            tags: BTreeMap::new(),
            meta: VersionMeta::default(),
        }
    }

    #[test]
    fn parse_external_key() {
        let key: ExternalKey = "way/42".parse().unwrap();
        assert_eq!(key, ExternalKey::new(EntityType::Way, 42));
        assert_eq!(key.to_string(), "way/42");
    }

    #[test]
    fn parse_external_key_invalid() {
        let err = "area/1".parse::<ExternalKey>().unwrap_err();
        assert_matches!(err, OprError::Config(_));
        let err = "node/abc".parse::<ExternalKey>().unwrap_err();
        assert_matches!(err, OprError::MalformedRecord(_));
    }

    #[test]
    fn parse_bbox_roundtrip() {
        let bbox: BBox = "10.5,-3,11,4.25".parse().unwrap();
        assert_eq!(bbox.min_lat, 10.5);
        assert_eq!(bbox.max_lon, 4.25);
        assert!(!bbox.spans_full_width());
        assert!(BBox::WORLD.spans_full_width());
        assert!(BBox::WORLD.spans_full_height());
    }

    #[test]
    fn reject_inverted_bbox() {
        let err = "11,0,10,1".parse::<BBox>().unwrap_err();
        assert_matches!(err, OprError::Config(_));
    }

    #[test]
    fn diff_halves_are_checked() {
        let diff = DiffEntity::from_parts(ChangeKind::Modify, Some(node(1)), Some(node(1))).unwrap();
        assert_eq!(diff.kind(), ChangeKind::Modify);

        let err = DiffEntity::from_parts(ChangeKind::Modify, None, Some(node(1))).unwrap_err();
        assert_matches!(err, OprError::MalformedRecord(_));

        let diff = DiffEntity::from_parts(ChangeKind::Delete, Some(node(7)), Some(node(7))).unwrap();
        assert_matches!(diff, DiffEntity::Delete { .. });
        assert_eq!(diff.lookup_key().id, 7);
    }
}
