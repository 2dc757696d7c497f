use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{EntityType, ExternalEntity, ExternalKey, LatLon};
use crate::error::OprError;
use crate::geo;
use crate::matching::FingerprintSource;

pub const PLACE_TYPE: &str = "opr.place";
pub const F_SOURCE: &str = "source";
pub const F_OSM: &str = "osm";
pub const F_OLD_OSM_IDS: &str = "old-osm-ids";
pub const F_TAGS: &str = "tags";
pub const F_DELETED: &str = "deleted";

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LENGTH: usize = 6;

/// Composite place id: geohash tile code plus a random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct RecordId {
    pub tile: String,
    pub suffix: String,
}

impl RecordId {
    pub fn new(tile: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            tile: tile.into(),
            suffix: suffix.into(),
        }
    }

    pub fn generate<R: Rng + ?Sized>(point: LatLon, rng: &mut R) -> Self {
        let suffix = (0..SUFFIX_LENGTH)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect::<String>();
        Self::new(geo::tile_code(point), suffix)
    }

    pub fn to_value(&self) -> Value {
        Value::from(vec![self.tile.clone(), self.suffix.clone()])
    }
}

impl From<(String, String)> for RecordId {
    fn from((tile, suffix): (String, String)) -> Self {
        Self { tile, suffix }
    }
}

impl From<RecordId> for (String, String) {
    fn from(id: RecordId) -> Self {
        (id.tile, id.suffix)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.tile, self.suffix)
    }
}

/// One upstream snapshot attached to a place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub id: i64,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub osm_tag: String,
    pub osm_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

impl SourceEntry {
    /// `osm_tag` is the filter key the entity was fetched with.
    pub fn from_entity(entity: &ExternalEntity, osm_tag: &str) -> Self {
        Self {
            id: entity.id,
            entity_type: entity.entity_type(),
            lat: entity.position.lat,
            lon: entity.position.lon,
            tags: entity.tags.clone(),
            osm_tag: osm_tag.to_string(),
            osm_value: entity.tag(osm_tag).unwrap_or_default().to_string(),
            version: entity.meta.version,
            changeset: entity.meta.changeset,
            timestamp: entity.meta.timestamp.clone(),
            deleted: None,
        }
    }

    pub fn key(&self) -> ExternalKey {
        ExternalKey::new(self.entity_type, self.id)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    /// Scalar attributes compared by the field diff, tags excluded.
    pub fn attributes(&self) -> BTreeMap<&'static str, Value> {
        let mut attrs = BTreeMap::new();
        attrs.insert("id", Value::from(self.id));
        attrs.insert("type", Value::from(self.entity_type.as_str()));
        attrs.insert("lat", Value::from(self.lat));
        attrs.insert("lon", Value::from(self.lon));
        attrs.insert("osm_tag", Value::from(self.osm_tag.as_str()));
        attrs.insert("osm_value", Value::from(self.osm_value.as_str()));
        if let Some(version) = self.version {
            attrs.insert("version", Value::from(version));
        }
        if let Some(changeset) = self.changeset {
            attrs.insert("changeset", Value::from(changeset));
        }
        if let Some(timestamp) = &self.timestamp {
            attrs.insert("timestamp", Value::from(timestamp.as_str()));
        }
        attrs
    }
}

impl FingerprintSource for SourceEntry {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.to_string()),
            "type" => Some(self.entity_type.to_string()),
            "osm_tag" => Some(self.osm_tag.clone()),
            "osm_value" => Some(self.osm_value.clone()),
            "lat" => Some(self.lat.to_string()),
            "lon" => Some(self.lon.to_string()),
            "version" => self.version.map(|v| v.to_string()),
            _ => None,
        }
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// An external id a place has stopped tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldSourceId {
    pub id: i64,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sources {
    #[serde(default)]
    pub osm: Vec<SourceEntry>,
    #[serde(rename = "old-osm-ids", default)]
    pub old_osm_ids: Vec<OldSourceId>,
}

/// A place as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: RecordId,
    #[serde(default)]
    pub source: Sources,
    /// Open-ended collections such as `images`.
    #[serde(flatten)]
    pub collections: BTreeMap<String, Value>,
}

impl LocalRecord {
    pub fn new(id: RecordId, entry: SourceEntry) -> Self {
        Self {
            id,
            source: Sources {
                osm: vec![entry],
                old_osm_ids: Vec::new(),
            },
            collections: BTreeMap::new(),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, OprError> {
        serde_json::from_value(value.clone())
            .map_err(|err| OprError::MalformedRecord(format!("place object: {err}")))
    }

    pub fn to_value(&self) -> Result<Value, OprError> {
        serde_json::to_value(self).map_err(|err| OprError::Ledger(err.to_string()))
    }

    /// Index of the live source entry tracking `key`.
    pub fn live_entry(&self, key: ExternalKey) -> Option<usize> {
        self.source
            .osm
            .iter()
            .position(|entry| entry.key() == key && !entry.is_deleted())
    }

    pub fn is_live(&self) -> bool {
        self.source.osm.iter().any(|entry| !entry.is_deleted())
    }

    /// Representative live entry: the first one not tombstoned.
    pub fn primary_entry(&self) -> Option<&SourceEntry> {
        self.source.osm.iter().find(|entry| !entry.is_deleted())
    }
}

/// Wraps keys that would break the dotted path grammar.
pub fn escape_key(key: &str) -> String {
    if key.contains('.') || key.contains('[') || key.contains(']') {
        format!("{{{}}}", key.replace('[', "\\[").replace(']', "\\]"))
    } else {
        key.to_string()
    }
}

pub fn entry_path(index: usize) -> String {
    format!("{F_SOURCE}.{F_OSM}[{index}]")
}

pub fn entry_field_path(index: usize, field: &str) -> String {
    format!("{}.{}", entry_path(index), escape_key(field))
}

pub fn tag_path(index: usize, key: &str) -> String {
    format!("{}.{F_TAGS}.{}", entry_path(index), escape_key(key))
}

pub fn old_ids_path() -> String {
    format!("{F_SOURCE}.{F_OLD_OSM_IDS}")
}
