//! Folds decoded upstream entities into place records.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{DiffEntity, ExternalEntity, ExternalKey};
use crate::error::OprError;
use crate::ledger::{ChangeOp, EditObject, Ledger, OSM_ID_INDEX, Operation};
use crate::matching::{FingerprintSelector, MatchFingerprint};
use crate::record::{
    LocalRecord, OldSourceId, PLACE_TYPE, RecordId, SourceEntry, entry_field_path, entry_path,
    escape_key, old_ids_path,
};
use crate::sync_state::format_timestamp;

const ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileSettings {
    pub places_per_operation: usize,
    pub operations_per_block: usize,
    pub fingerprint: Vec<FingerprintSelector>,
}

/// External ids already handled in the current phase.
#[derive(Debug, Default)]
pub struct SeenIds {
    keys: Mutex<HashSet<ExternalKey>>,
}

impl SeenIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if another worker already claimed `key`.
    pub fn claim(&self, key: ExternalKey) -> bool {
        self.keys.lock().insert(key)
    }

    pub fn release(&self, keys: &[ExternalKey]) {
        let mut seen = self.keys.lock();
        for key in keys {
            seen.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub processed: usize,
    pub created: usize,
    pub edited: usize,
    pub tombstoned: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub duplicates: usize,
}

impl ReconcileStats {
    pub fn absorb(&mut self, other: &ReconcileStats) {
        self.processed += other.processed;
        self.created += other.created;
        self.edited += other.edited;
        self.tombstoned += other.tombstoned;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
    }
}

/// Change set between two flat maps: changed and added keys are `set`,
/// removed keys are `delete`, `current` keeps the replaced values.
pub fn diff_fields(
    prefix: &str,
    old: &BTreeMap<String, Value>,
    new: &BTreeMap<String, Value>,
) -> (BTreeMap<String, ChangeOp>, BTreeMap<String, Value>) {
    let mut change = BTreeMap::new();
    let mut current = BTreeMap::new();
    for (key, value) in old {
        if !new.contains_key(key) {
            let path = format!("{prefix}{}", escape_key(key));
            change.insert(path.clone(), ChangeOp::Delete);
            current.insert(path, value.clone());
        }
    }
    for (key, value) in new {
        let previous = old.get(key);
        if previous != Some(value) {
            let path = format!("{prefix}{}", escape_key(key));
            change.insert(path.clone(), ChangeOp::Set(value.clone()));
            if let Some(previous) = previous {
                current.insert(path, previous.clone());
            }
        }
    }
    (change, current)
}

fn tag_values(tags: &BTreeMap<String, String>) -> BTreeMap<String, Value> {
    tags.iter()
        .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
        .collect()
}

fn attribute_values(entry: &SourceEntry) -> BTreeMap<String, Value> {
    entry
        .attributes()
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Edit turning the stored entry at `index` into `incoming`. Empty when
/// nothing differs.
pub fn entry_edit(
    id: &RecordId,
    index: usize,
    stored: &SourceEntry,
    incoming: &SourceEntry,
) -> EditObject {
    let mut edit = EditObject::new(vec![id.tile.clone(), id.suffix.clone()]);
    let (change, current) = diff_fields(
        &format!("{}.", entry_field_path(index, "tags")),
        &tag_values(&stored.tags),
        &tag_values(&incoming.tags),
    );
    edit.change.extend(change);
    edit.current.extend(current);
    let (change, current) = diff_fields(
        &format!("{}.", entry_path(index)),
        &attribute_values(stored),
        &attribute_values(incoming),
    );
    edit.change.extend(change);
    edit.current.extend(current);
    edit
}

/// Edit tombstoning the entry at `index` and recording its id in the history.
pub fn tombstone_edit(
    id: &RecordId,
    index: usize,
    stored: &SourceEntry,
    at: &str,
) -> Result<EditObject, OprError> {
    let mut edit = EditObject::new(vec![id.tile.clone(), id.suffix.clone()]);
    let history = OldSourceId {
        id: stored.id,
        entity_type: stored.entity_type,
        version: stored.version,
        timestamp: at.to_string(),
    };
    edit.change.insert(
        entry_field_path(index, "deleted"),
        ChangeOp::Set(Value::from(at)),
    );
    edit.change.insert(
        old_ids_path(),
        ChangeOp::Append(
            serde_json::to_value(history).map_err(|err| OprError::Ledger(err.to_string()))?,
        ),
    );
    edit.current
        .insert(entry_field_path(index, "id"), Value::from(stored.id));
    Ok(edit)
}

struct Batch {
    operation: Operation,
    keys: Vec<ExternalKey>,
}

impl Batch {
    fn new() -> Self {
        Self {
            operation: Operation::new(PLACE_TYPE),
            keys: Vec::new(),
        }
    }
}

/// Stateless per-batch worker; the shared pieces are borrowed.
pub struct Reconciler<'a> {
    ledger: &'a dyn Ledger,
    settings: &'a ReconcileSettings,
    seen: &'a SeenIds,
    commit_fence: &'a Mutex<()>,
    osm_tag: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ledger: &'a dyn Ledger,
        settings: &'a ReconcileSettings,
        seen: &'a SeenIds,
        commit_fence: &'a Mutex<()>,
        osm_tag: &'a str,
    ) -> Self {
        Self {
            ledger,
            settings,
            seen,
            commit_fence,
            osm_tag,
        }
    }

    pub fn reconcile_entities(
        &self,
        entities: &[ExternalEntity],
    ) -> Result<ReconcileStats, OprError> {
        let mut stats = ReconcileStats::default();
        let mut batch = Batch::new();
        for entity in entities {
            let key = entity.key();
            if !self.seen.claim(key) {
                stats.duplicates += 1;
                continue;
            }
            batch.keys.push(key);
            stats.processed += 1;
            let outcome = self.apply_entity(entity, &mut batch, &mut stats);
            self.settle(outcome, key, &mut batch, &mut stats)?;
        }
        self.flush(&mut batch)?;
        Ok(stats)
    }

    pub fn reconcile_diffs(&self, diffs: &[DiffEntity]) -> Result<ReconcileStats, OprError> {
        let mut stats = ReconcileStats::default();
        let mut batch = Batch::new();
        for diff in diffs {
            let key = diff.lookup_key();
            if !self.seen.claim(key) {
                stats.duplicates += 1;
                continue;
            }
            batch.keys.push(key);
            stats.processed += 1;
            let outcome = self.apply_diff(diff, &mut batch, &mut stats);
            self.settle(outcome, key, &mut batch, &mut stats)?;
        }
        self.flush(&mut batch)?;
        Ok(stats)
    }

    fn settle(
        &self,
        outcome: Result<(), OprError>,
        key: ExternalKey,
        batch: &mut Batch,
        stats: &mut ReconcileStats,
    ) -> Result<(), OprError> {
        match outcome {
            Ok(()) => {}
            Err(OprError::MalformedRecord(reason)) => {
                warn!(%key, reason = %reason, "skipping record");
                stats.skipped += 1;
            }
            Err(err) => {
                self.seen.release(&batch.keys);
                return Err(err);
            }
        }
        if batch.operation.object_count() >= self.settings.places_per_operation {
            self.flush(batch)?;
        }
        Ok(())
    }

    fn apply_diff(
        &self,
        diff: &DiffEntity,
        batch: &mut Batch,
        stats: &mut ReconcileStats,
    ) -> Result<(), OprError> {
        match diff {
            DiffEntity::Create { new } => self.apply_entity(new, batch, stats),
            DiffEntity::Modify { old, new } => {
                if old.key() != new.key() {
                    return Err(OprError::MalformedRecord(format!(
                        "modify changes identity {} -> {}",
                        old.key(),
                        new.key()
                    )));
                }
                if self.lookup(old.key())?.is_none() {
                    warn!(key = %old.key(), "modified entity has no local place");
                    stats.skipped += 1;
                    return Ok(());
                }
                self.apply_entity(new, batch, stats)
            }
            DiffEntity::Delete { old } => match self.lookup(old.key())? {
                Some((record, index)) => {
                    let at = format_timestamp(Utc::now());
                    batch.operation.edit.push(tombstone_edit(
                        &record.id,
                        index,
                        &record.source.osm[index],
                        &at,
                    )?);
                    stats.tombstoned += 1;
                    Ok(())
                }
                None => {
                    warn!(key = %old.key(), "deleted entity has no local place");
                    stats.skipped += 1;
                    Ok(())
                }
            },
        }
    }

    fn apply_entity(
        &self,
        entity: &ExternalEntity,
        batch: &mut Batch,
        stats: &mut ReconcileStats,
    ) -> Result<(), OprError> {
        let incoming = SourceEntry::from_entity(entity, self.osm_tag);
        let Some((record, index)) = self.lookup(entity.key())? else {
            return self.create(entity, incoming, batch, stats);
        };

        let stored = &record.source.osm[index];
        let fingerprint = &self.settings.fingerprint;
        if MatchFingerprint::compute(fingerprint, stored)
            != MatchFingerprint::compute(fingerprint, &incoming)
        {
            debug!(key = %entity.key(), place = %record.id, "identity changed, superseding place");
            let at = format_timestamp(Utc::now());
            batch
                .operation
                .edit
                .push(tombstone_edit(&record.id, index, stored, &at)?);
            stats.tombstoned += 1;
            return self.create(entity, incoming, batch, stats);
        }

        let edit = entry_edit(&record.id, index, stored, &incoming);
        if edit.is_empty() {
            stats.unchanged += 1;
        } else {
            batch.operation.edit.push(edit);
            stats.edited += 1;
        }
        Ok(())
    }

    fn create(
        &self,
        entity: &ExternalEntity,
        incoming: SourceEntry,
        batch: &mut Batch,
        stats: &mut ReconcileStats,
    ) -> Result<(), OprError> {
        let id = self.fresh_id(entity, batch)?;
        let record = LocalRecord::new(id, incoming);
        batch.operation.create.push(record.to_value()?);
        stats.created += 1;
        Ok(())
    }

    fn fresh_id(&self, entity: &ExternalEntity, batch: &Batch) -> Result<RecordId, OprError> {
        let mut rng = rand::thread_rng();
        for _ in 0..ID_ATTEMPTS {
            let id = RecordId::generate(entity.position, &mut rng);
            let key = vec![id.tile.clone(), id.suffix.clone()];
            let queued = batch
                .operation
                .create
                .iter()
                .any(|value| value.get("id") == Some(&id.to_value()));
            if !queued && self.ledger.object(PLACE_TYPE, &key)?.is_none() {
                return Ok(id);
            }
        }
        Err(OprError::Ledger(format!(
            "no free place id near {}",
            entity.key()
        )))
    }

    fn lookup(&self, key: ExternalKey) -> Result<Option<(LocalRecord, usize)>, OprError> {
        let Some(value) = self
            .ledger
            .find_by_external_index(PLACE_TYPE, OSM_ID_INDEX, key)?
        else {
            return Ok(None);
        };
        let record = LocalRecord::from_value(&value)?;
        Ok(record.live_entry(key).map(|index| (record, index)))
    }

    fn flush(&self, batch: &mut Batch) -> Result<(), OprError> {
        if !batch.operation.is_empty() {
            let operation = std::mem::replace(&mut batch.operation, Operation::new(PLACE_TYPE));
            let result = self
                .ledger
                .sign_and_stamp(operation)
                .and_then(|signed| self.ledger.add_operation(signed));
            if let Err(err) = result {
                self.seen.release(&batch.keys);
                return Err(err);
            }
        }
        batch.keys.clear();
        if self.ledger.queued_operations() >= self.settings.operations_per_block {
            let _fence = self.commit_fence.lock();
            if self.ledger.queued_operations() >= self.settings.operations_per_block {
                self.ledger.create_block()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn field_diff_is_minimal() {
        let (change, current) = diff_fields(
            "tags.",
            &map(json!({"a": 1, "b": 2})),
            &map(json!({"a": 1, "b": 3, "c": 4})),
        );
        assert_eq!(change.len(), 2);
        assert_eq!(change["tags.b"], ChangeOp::Set(json!(3)));
        assert_eq!(change["tags.c"], ChangeOp::Set(json!(4)));
        assert_eq!(current, map(json!({"tags.b": 2})));
    }

    #[test]
    fn removed_fields_are_deleted() {
        let (change, current) = diff_fields(
            "",
            &map(json!({"addr.street": "x", "keep": 1})),
            &map(json!({"keep": 1})),
        );
        assert_eq!(change["{addr.street}"], ChangeOp::Delete);
        assert_eq!(current["{addr.street}"], json!("x"));
    }

    #[test]
    fn seen_ids_claim_once() {
        let seen = SeenIds::new();
        let key: ExternalKey = "node/1".parse().unwrap();
        assert!(seen.claim(key));
        assert!(!seen.claim(key));
        seen.release(&[key]);
        assert!(seen.claim(key));
    }
}
