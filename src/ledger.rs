//! Ledger collaborator: operations, dotted-path edits and an in-process store.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::domain::ExternalKey;
use crate::error::OprError;
use crate::record::{F_DELETED, F_OSM, F_SOURCE, PLACE_TYPE};

pub const BOT_TYPE: &str = "sys.bot";
pub const F_BOT_STATE: &str = "bot_state";
pub const OSM_ID_INDEX: &str = "osmid";

pub type ObjectId = Vec<String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Set(Value),
    Delete,
    Append(Value),
    #[serde(rename = "appendmany")]
    AppendMany(Vec<Value>),
}

/// Field-level edit of one object. `current` holds the values the editor
/// expects to replace; a mismatch rejects the whole operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditObject {
    pub id: ObjectId,
    pub change: BTreeMap<String, ChangeOp>,
    #[serde(default)]
    pub current: BTreeMap<String, Value>,
}

impl EditObject {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.change.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit: Vec<EditObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Operation {
    pub fn new(object_type: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            create: Vec::new(),
            edit: Vec::new(),
            delete: Vec::new(),
            signed_by: None,
            signed_at: None,
            hash: None,
        }
    }

    pub fn object_count(&self) -> usize {
        self.create.len() + self.edit.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_count() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub operations: usize,
    pub hash: String,
    pub created_at: String,
}

pub trait Ledger: Send + Sync {
    /// Attaches the signer and a content hash.
    fn sign_and_stamp(&self, operation: Operation) -> Result<Operation, OprError>;
    /// Validates and applies a signed operation, queueing it for the next block.
    fn add_operation(&self, operation: Operation) -> Result<(), OprError>;
    fn queued_operations(&self) -> usize;
    /// Seals the queue into a block. Returns `None` when nothing was queued.
    fn create_block(&self) -> Result<Option<BlockHeader>, OprError>;
    fn find_by_external_index(
        &self,
        object_type: &str,
        index: &str,
        key: ExternalKey,
    ) -> Result<Option<Value>, OprError>;
    fn all_external_ids(&self, object_type: &str) -> Result<HashSet<ExternalKey>, OprError>;
    fn object(&self, object_type: &str, id: &[String]) -> Result<Option<Value>, OprError>;
    fn objects(&self, object_type: &str) -> Result<Vec<Value>, OprError>;
    fn bot_state(&self, bot: &str) -> Result<Option<Value>, OprError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parses `a.b[2].{c.d}` style paths. Braces quote a key; `\[` and `\]`
/// inside braces are literal brackets.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, OprError> {
    let invalid = || OprError::Ledger(format!("invalid field path: {path}"));
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '{' => {
                let mut quoted = String::new();
                loop {
                    match chars.next().ok_or_else(invalid)? {
                        '}' => break,
                        '\\' => quoted.push(chars.next().ok_or_else(invalid)?),
                        other => quoted.push(other),
                    }
                }
                segments.push(Segment::Key(quoted));
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                loop {
                    match chars.next().ok_or_else(invalid)? {
                        ']' => break,
                        digit if digit.is_ascii_digit() => digits.push(digit),
                        _ => return Err(invalid()),
                    }
                }
                segments.push(Segment::Index(digits.parse().map_err(|_| invalid())?));
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    if segments.is_empty() {
        return Err(invalid());
    }
    Ok(segments)
}

pub fn get_path<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |cursor, segment| match segment {
        Segment::Key(key) => cursor.get(key.as_str()),
        Segment::Index(index) => cursor.get(*index),
    })
}

fn container_mut<'a>(
    root: &'a mut Value,
    segments: &[Segment],
    create: bool,
    path: &str,
) -> Result<&'a mut Value, OprError> {
    let missing = || OprError::Ledger(format!("path {path} does not exist"));
    let mut cursor = root;
    for segment in segments {
        cursor = match segment {
            Segment::Key(key) => {
                let map = cursor.as_object_mut().ok_or_else(missing)?;
                if create {
                    map.entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new()))
                } else {
                    map.get_mut(key).ok_or_else(missing)?
                }
            }
            Segment::Index(index) => cursor
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or_else(missing)?,
        };
    }
    Ok(cursor)
}

pub fn apply_change(root: &mut Value, path: &str, op: &ChangeOp) -> Result<(), OprError> {
    let segments = parse_path(path)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| OprError::Ledger(format!("invalid field path: {path}")))?;
    let creating = !matches!(op, ChangeOp::Delete);
    let parent = container_mut(root, parents, creating, path)?;
    let mismatch = || OprError::Ledger(format!("path {path} has an incompatible type"));

    match (last, op) {
        (Segment::Key(key), ChangeOp::Set(value)) => {
            parent
                .as_object_mut()
                .ok_or_else(mismatch)?
                .insert(key.clone(), value.clone());
        }
        (Segment::Index(index), ChangeOp::Set(value)) => {
            let items = parent.as_array_mut().ok_or_else(mismatch)?;
            match (*index).cmp(&items.len()) {
                std::cmp::Ordering::Less => items[*index] = value.clone(),
                std::cmp::Ordering::Equal => items.push(value.clone()),
                std::cmp::Ordering::Greater => return Err(mismatch()),
            }
        }
        (Segment::Key(key), ChangeOp::Delete) => {
            parent
                .as_object_mut()
                .ok_or_else(mismatch)?
                .remove(key)
                .ok_or_else(|| OprError::Ledger(format!("path {path} does not exist")))?;
        }
        (Segment::Index(index), ChangeOp::Delete) => {
            let items = parent.as_array_mut().ok_or_else(mismatch)?;
            if *index >= items.len() {
                return Err(mismatch());
            }
            items.remove(*index);
        }
        (Segment::Key(key), ChangeOp::Append(_) | ChangeOp::AppendMany(_)) => {
            let target = parent
                .as_object_mut()
                .ok_or_else(mismatch)?
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            let items = target.as_array_mut().ok_or_else(mismatch)?;
            match op {
                ChangeOp::Append(value) => items.push(value.clone()),
                ChangeOp::AppendMany(values) => items.extend(values.iter().cloned()),
                _ => {}
            }
        }
        (Segment::Index(_), _) => return Err(mismatch()),
    }
    Ok(())
}

/// Applies an edit after checking every `current` expectation.
pub fn apply_edit(object: &mut Value, edit: &EditObject) -> Result<(), OprError> {
    for (path, expected) in &edit.current {
        let actual = get_path(object, &parse_path(path)?);
        if actual != Some(expected) {
            return Err(OprError::Ledger(format!(
                "current value of {path} does not match for {}",
                edit.id.join(",")
            )));
        }
    }
    for (path, op) in &edit.change {
        apply_change(object, path, op)?;
    }
    Ok(())
}

pub fn object_id(value: &Value) -> Result<ObjectId, OprError> {
    value
        .get("id")
        .and_then(Value::as_array)
        .and_then(|parts| {
            parts
                .iter()
                .map(|part| part.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .filter(|id| !id.is_empty())
        .ok_or_else(|| OprError::Ledger("object is missing a string id list".to_string()))
}

/// External keys of the live source entries of a place object.
pub fn live_external_keys(value: &Value) -> Vec<ExternalKey> {
    value
        .get(F_SOURCE)
        .and_then(|source| source.get(F_OSM))
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| entry.get(F_DELETED).is_none())
                .filter_map(|entry| serde_json::from_value::<ExternalKey>(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    objects: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    blocks: Vec<BlockHeader>,
    #[serde(skip)]
    queue: Vec<Operation>,
    #[serde(skip)]
    index: HashMap<ExternalKey, ObjectId>,
}

impl LedgerState {
    fn rebuild_index(&mut self) {
        self.index.clear();
        if let Some(places) = self.objects.get(PLACE_TYPE) {
            for value in places.values() {
                reindex(&mut self.index, value);
            }
        }
    }
}

fn unindex(index: &mut HashMap<ExternalKey, ObjectId>, value: &Value) {
    for key in live_external_keys(value) {
        index.remove(&key);
    }
}

fn reindex(index: &mut HashMap<ExternalKey, ObjectId>, value: &Value) {
    if let Ok(id) = object_id(value) {
        for key in live_external_keys(value) {
            index.insert(key, id.clone());
        }
    }
}

fn storage_key(id: &[String]) -> String {
    id.join(",")
}

fn operation_hash(operation: &Operation) -> Result<String, OprError> {
    let mut unsigned = operation.clone();
    unsigned.hash = None;
    let bytes = serde_json::to_vec(&unsigned).map_err(|err| OprError::Sign(err.to_string()))?;
    Ok(format!("json:sha256:{}", hex::encode(Sha256::digest(&bytes))))
}

/// In-process ledger that applies operations immediately and keeps a
/// snapshot of the resulting objects.
pub struct MemoryLedger {
    signer: String,
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new(signer: impl Into<String>) -> Self {
        Self {
            signer: signer.into(),
            state: RwLock::new(LedgerState::default()),
        }
    }

    pub fn from_snapshot(signer: impl Into<String>, snapshot: &[u8]) -> Result<Self, OprError> {
        let mut state: LedgerState = serde_json::from_slice(snapshot)
            .map_err(|err| OprError::Ledger(format!("invalid ledger snapshot: {err}")))?;
        state.rebuild_index();
        debug!(
            places = state.objects.get(PLACE_TYPE).map(BTreeMap::len).unwrap_or(0),
            blocks = state.blocks.len(),
            "ledger snapshot loaded"
        );
        Ok(Self {
            signer: signer.into(),
            state: RwLock::new(state),
        })
    }

    /// Serializes sealed and queued state alike.
    pub fn snapshot(&self) -> Result<Vec<u8>, OprError> {
        let state = self.state.read();
        serde_json::to_vec_pretty(&*state).map_err(|err| OprError::Ledger(err.to_string()))
    }

    /// Creates the bot configuration object if it is missing.
    pub fn ensure_bot(&self, bot: &str) {
        let mut state = self.state.write();
        let bots = state.objects.entry(BOT_TYPE.to_string()).or_default();
        bots.entry(bot.to_string())
            .or_insert_with(|| serde_json::json!({ "id": [bot], "bot_state": {} }));
    }

    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }
}

impl Ledger for MemoryLedger {
    fn sign_and_stamp(&self, mut operation: Operation) -> Result<Operation, OprError> {
        if operation.is_empty() {
            return Err(OprError::Sign("refusing to sign an empty operation".to_string()));
        }
        operation.signed_by = Some(self.signer.clone());
        operation.signed_at = Some(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        operation.hash = Some(operation_hash(&operation)?);
        Ok(operation)
    }

    fn add_operation(&self, operation: Operation) -> Result<(), OprError> {
        let expected = operation_hash(&operation)?;
        if operation.hash.as_deref() != Some(expected.as_str()) {
            return Err(OprError::Ledger("operation is not signed".to_string()));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        let existing = state.objects.get(&operation.object_type);
        // Only the touched objects are staged; `None` marks a deletion.
        let mut staged: BTreeMap<String, Option<Value>> = BTreeMap::new();
        let is_live = |staged: &BTreeMap<String, Option<Value>>, key: &str| match staged.get(key) {
            Some(value) => value.is_some(),
            None => existing.is_some_and(|objects| objects.contains_key(key)),
        };

        for created in &operation.create {
            let key = storage_key(&object_id(created)?);
            if is_live(&staged, &key) {
                return Err(OprError::Ledger(format!("object {key} already exists")));
            }
            staged.insert(key, Some(created.clone()));
        }
        for edit in &operation.edit {
            let key = storage_key(&edit.id);
            let current = match staged.remove(&key) {
                Some(value) => value,
                None => existing.and_then(|objects| objects.get(&key)).cloned(),
            };
            let mut object =
                current.ok_or_else(|| OprError::Ledger(format!("object {key} not found")))?;
            apply_edit(&mut object, edit)?;
            staged.insert(key, Some(object));
        }
        for deleted in &operation.delete {
            let key = storage_key(deleted);
            if !is_live(&staged, &key) {
                return Err(OprError::Ledger(format!("object {key} not found")));
            }
            staged.insert(key, None);
        }

        if operation.object_type == PLACE_TYPE {
            for key in staged.keys() {
                if let Some(old) = existing.and_then(|objects| objects.get(key)) {
                    unindex(&mut state.index, old);
                }
            }
            for new in staged.values().flatten() {
                reindex(&mut state.index, new);
            }
        }

        let objects = state
            .objects
            .entry(operation.object_type.clone())
            .or_default();
        for (key, value) in staged {
            match value {
                Some(value) => objects.insert(key, value),
                None => objects.remove(&key),
            };
        }
        debug!(
            object_type = %operation.object_type,
            created = operation.create.len(),
            edited = operation.edit.len(),
            deleted = operation.delete.len(),
            "operation applied"
        );
        state.queue.push(operation);
        Ok(())
    }

    fn queued_operations(&self) -> usize {
        self.state.read().queue.len()
    }

    fn create_block(&self) -> Result<Option<BlockHeader>, OprError> {
        let mut state = self.state.write();
        if state.queue.is_empty() {
            return Ok(None);
        }
        let operations = std::mem::take(&mut state.queue);
        let mut hasher = Sha256::new();
        for operation in &operations {
            hasher.update(operation.hash.as_deref().unwrap_or_default().as_bytes());
        }
        let header = BlockHeader {
            number: state.blocks.len() as u64,
            operations: operations.len(),
            hash: hex::encode(hasher.finalize()),
            created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        };
        info!(
            block = header.number,
            operations = header.operations,
            "block created"
        );
        state.blocks.push(header.clone());
        Ok(Some(header))
    }

    fn find_by_external_index(
        &self,
        object_type: &str,
        index: &str,
        key: ExternalKey,
    ) -> Result<Option<Value>, OprError> {
        if object_type != PLACE_TYPE || index != OSM_ID_INDEX {
            return Err(OprError::Ledger(format!(
                "no index {index} on {object_type}"
            )));
        }
        let state = self.state.read();
        Ok(state.index.get(&key).and_then(|id| {
            state
                .objects
                .get(object_type)
                .and_then(|objects| objects.get(&storage_key(id)))
                .cloned()
        }))
    }

    fn all_external_ids(&self, object_type: &str) -> Result<HashSet<ExternalKey>, OprError> {
        if object_type != PLACE_TYPE {
            return Ok(HashSet::new());
        }
        Ok(self.state.read().index.keys().copied().collect())
    }

    fn object(&self, object_type: &str, id: &[String]) -> Result<Option<Value>, OprError> {
        Ok(self
            .state
            .read()
            .objects
            .get(object_type)
            .and_then(|objects| objects.get(&storage_key(id)))
            .cloned())
    }

    fn objects(&self, object_type: &str) -> Result<Vec<Value>, OprError> {
        Ok(self
            .state
            .read()
            .objects
            .get(object_type)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default())
    }

    fn bot_state(&self, bot: &str) -> Result<Option<Value>, OprError> {
        Ok(self
            .object(BOT_TYPE, &[bot.to_string()])?
            .and_then(|object| object.get(F_BOT_STATE).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::domain::EntityType;

    fn place(id: &str, osm_id: i64) -> Value {
        json!({
            "id": ["u09tvw", id],
            "source": {
                "osm": [{"id": osm_id, "type": "node", "lat": 1.0, "lon": 2.0,
                         "tags": {"name": "A"}, "osm_tag": "amenity", "osm_value": "cafe"}],
                "old-osm-ids": []
            }
        })
    }

    fn signed(ledger: &MemoryLedger, operation: Operation) -> Operation {
        ledger.sign_and_stamp(operation).unwrap()
    }

    #[test]
    fn parse_paths_with_quoted_keys() {
        let segments = parse_path("source.osm[0].tags.{addr.street}").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Key("source".into()),
                Segment::Key("osm".into()),
                Segment::Index(0),
                Segment::Key("tags".into()),
                Segment::Key("addr.street".into()),
            ]
        );
        let segments = parse_path("tags.{a\\[1\\]}").unwrap();
        assert_eq!(segments[1], Segment::Key("a[1]".into()));
        assert!(parse_path("tags.{open").is_err());
        assert!(parse_path("").is_err());
    }

    #[test]
    fn change_ops_apply() {
        let mut value = json!({"tags": {"a": "1"}, "images": {"outdoor": [1]}});
        apply_change(&mut value, "tags.b", &ChangeOp::Set(json!("2"))).unwrap();
        apply_change(&mut value, "tags.a", &ChangeOp::Delete).unwrap();
        apply_change(&mut value, "images.outdoor", &ChangeOp::Append(json!(2))).unwrap();
        apply_change(
            &mut value,
            "images.indoor",
            &ChangeOp::AppendMany(vec![json!(3), json!(4)]),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"tags": {"b": "2"}, "images": {"outdoor": [1, 2], "indoor": [3, 4]}})
        );
        assert!(apply_change(&mut value, "tags.missing", &ChangeOp::Delete).is_err());
    }

    #[test]
    fn change_ops_serialize_like_the_ledger_expects() {
        assert_eq!(serde_json::to_value(ChangeOp::Set(json!(3))).unwrap(), json!({"set": 3}));
        assert_eq!(serde_json::to_value(ChangeOp::Delete).unwrap(), json!("delete"));
        assert_eq!(
            serde_json::to_value(ChangeOp::AppendMany(vec![json!(1)])).unwrap(),
            json!({"appendmany": [1]})
        );
    }

    #[test]
    fn stale_current_rejects_edit() {
        let ledger = MemoryLedger::new("test");
        let mut create = Operation::new(PLACE_TYPE);
        create.create.push(place("a", 1));
        ledger.add_operation(signed(&ledger, create)).unwrap();

        let mut edit = EditObject::new(vec!["u09tvw".into(), "a".into()]);
        edit.change
            .insert("source.osm[0].tags.name".into(), ChangeOp::Set(json!("B")));
        edit.current
            .insert("source.osm[0].tags.name".into(), json!("Z"));
        let mut operation = Operation::new(PLACE_TYPE);
        operation.edit.push(edit);
        let err = ledger.add_operation(signed(&ledger, operation)).unwrap_err();
        assert_matches!(err, OprError::Ledger(_));
    }

    #[test]
    fn rejected_operation_changes_nothing() {
        let ledger = MemoryLedger::new("test");
        let mut create = Operation::new(PLACE_TYPE);
        create.create.push(place("a", 1));
        ledger.add_operation(signed(&ledger, create)).unwrap();

        let mut operation = Operation::new(PLACE_TYPE);
        operation.create.push(place("b", 2));
        operation.delete.push(vec!["u09tvw".into(), "a".into()]);
        operation.delete.push(vec!["u09tvw".into(), "missing".into()]);
        let err = ledger.add_operation(signed(&ledger, operation)).unwrap_err();
        assert_matches!(err, OprError::Ledger(_));

        assert!(ledger.object(PLACE_TYPE, &["u09tvw".into(), "a".into()]).unwrap().is_some());
        assert!(ledger.object(PLACE_TYPE, &["u09tvw".into(), "b".into()]).unwrap().is_none());
        let ids = ledger.all_external_ids(PLACE_TYPE).unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&ExternalKey::new(EntityType::Node, 1)));
        assert_eq!(ledger.queued_operations(), 1);
    }

    #[test]
    fn operation_touches_only_named_objects() {
        let ledger = MemoryLedger::new("test");
        let mut create = Operation::new(PLACE_TYPE);
        create.create.push(place("a", 1));
        create.create.push(place("b", 2));
        ledger.add_operation(signed(&ledger, create)).unwrap();

        let mut operation = Operation::new(PLACE_TYPE);
        operation.create.push(place("c", 3));
        operation.delete.push(vec!["u09tvw".into(), "a".into()]);
        ledger.add_operation(signed(&ledger, operation)).unwrap();

        assert!(ledger.object(PLACE_TYPE, &["u09tvw".into(), "a".into()]).unwrap().is_none());
        assert_eq!(
            ledger.object(PLACE_TYPE, &["u09tvw".into(), "b".into()]).unwrap(),
            Some(place("b", 2))
        );
        let ids = ledger.all_external_ids(PLACE_TYPE).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&ExternalKey::new(EntityType::Node, 1)));
        assert!(ids.contains(&ExternalKey::new(EntityType::Node, 3)));
    }

    #[test]
    fn index_follows_tombstones() {
        let ledger = MemoryLedger::new("test");
        let mut create = Operation::new(PLACE_TYPE);
        create.create.push(place("a", 1));
        ledger.add_operation(signed(&ledger, create)).unwrap();
        let key = ExternalKey::new(EntityType::Node, 1);
        assert!(
            ledger
                .find_by_external_index(PLACE_TYPE, OSM_ID_INDEX, key)
                .unwrap()
                .is_some()
        );

        let mut edit = EditObject::new(vec!["u09tvw".into(), "a".into()]);
        edit.change.insert(
            "source.osm[0].deleted".into(),
            ChangeOp::Set(json!("2024-01-01T00:00:00Z")),
        );
        let mut operation = Operation::new(PLACE_TYPE);
        operation.edit.push(edit);
        ledger.add_operation(signed(&ledger, operation)).unwrap();

        assert!(
            ledger
                .find_by_external_index(PLACE_TYPE, OSM_ID_INDEX, key)
                .unwrap()
                .is_none()
        );
        assert!(ledger.all_external_ids(PLACE_TYPE).unwrap().is_empty());
    }

    #[test]
    fn unsigned_operations_are_rejected() {
        let ledger = MemoryLedger::new("test");
        let mut create = Operation::new(PLACE_TYPE);
        create.create.push(place("a", 1));
        let err = ledger.add_operation(create).unwrap_err();
        assert_matches!(err, OprError::Ledger(_));
    }

    #[test]
    fn blocks_drain_the_queue_and_snapshot_restores() {
        let ledger = MemoryLedger::new("test");
        ledger.ensure_bot("osm-sync");
        let mut create = Operation::new(PLACE_TYPE);
        create.create.push(place("a", 1));
        create.create.push(place("b", 2));
        ledger.add_operation(signed(&ledger, create)).unwrap();
        assert_eq!(ledger.queued_operations(), 1);

        let header = ledger.create_block().unwrap().unwrap();
        assert_eq!(header.operations, 1);
        assert_eq!(ledger.queued_operations(), 0);
        assert!(ledger.create_block().unwrap().is_none());

        let restored = MemoryLedger::from_snapshot("test", &ledger.snapshot().unwrap()).unwrap();
        assert_eq!(restored.all_external_ids(PLACE_TYPE).unwrap().len(), 2);
        assert_eq!(restored.block_count(), 1);
        assert_eq!(restored.bot_state("osm-sync").unwrap(), Some(json!({})));
    }
}
