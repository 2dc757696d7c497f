//! Post-hoc merge of places that were re-created upstream under a new id.

use std::collections::BTreeMap;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::LatLon;
use crate::error::OprError;
use crate::geo;
use crate::ledger::{ChangeOp, EditObject, Ledger, ObjectId, Operation, object_id};
use crate::matching::{self, NAME, WEBSITE, WIKIDATA};
use crate::record::{LocalRecord, PLACE_TYPE, RecordId, SourceEntry, escape_key};
use crate::sync_state::parse_timestamp;

pub const DEFAULT_MERGE_RADIUS_M: f64 = 150.0;
pub const DEFAULT_MONTHS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub place_id: RecordId,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Feature {
    fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }

    fn name(&self) -> Option<&str> {
        self.tags
            .get(NAME)
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    NameMatch,
    OtherTagsMatch,
    OtherNameMatch,
    EmptyNameMatch,
}

/// Outcome for one deleted feature. Indices point into the group slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    Merge {
        deleted: usize,
        created: usize,
        by: MatchType,
    },
    /// No created place within the radius.
    Closed { deleted: usize },
    Ambiguous { deleted: usize },
    NoMatch { deleted: usize },
    /// Several deleted places compete for the created ones in range.
    Skipped { deleted: usize },
}

impl MergeDecision {
    pub fn deleted(&self) -> usize {
        match *self {
            MergeDecision::Merge { deleted, .. }
            | MergeDecision::Closed { deleted }
            | MergeDecision::Ambiguous { deleted }
            | MergeDecision::NoMatch { deleted }
            | MergeDecision::Skipped { deleted } => deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub groups: usize,
    pub closed: usize,
    pub similar: usize,
    pub merged: usize,
    pub ambiguous: usize,
    pub skipped: usize,
    pub operations: usize,
    pub dry_run: bool,
}

/// Splits an ordered export into groups; a group ends where a created
/// feature follows a deleted one.
pub fn merge_groups(features: &[Feature]) -> Vec<&[Feature]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for index in 1..features.len() {
        if !features[index].deleted && features[index - 1].deleted {
            groups.push(&features[start..index]);
            start = index;
        }
    }
    if start < features.len() {
        groups.push(&features[start..]);
    }
    groups
}

fn matches_by(by: MatchType, deleted: &Feature, created: &Feature) -> bool {
    match by {
        MatchType::NameMatch => match (deleted.name(), created.name()) {
            (Some(left), Some(right)) => matching::names_match(left, right),
            _ => false,
        },
        MatchType::OtherTagsMatch => [WIKIDATA, WEBSITE].iter().any(|key| {
            matching::equals_non_empty(
                deleted.tags.get(*key).map(String::as_str),
                created.tags.get(*key).map(String::as_str),
            )
        }),
        MatchType::OtherNameMatch => {
            let created_names = matching::name_variants(&created.tags);
            matching::name_variants(&deleted.tags).iter().any(|left| {
                created_names
                    .iter()
                    .any(|right| matching::names_match(left, right))
            })
        }
        MatchType::EmptyNameMatch => deleted.name().is_none(),
    }
}

/// Decides every deleted feature of one group. Deleted features with no
/// created place in range are closed. A group where more than one deleted
/// feature still has a created place in range is skipped as a whole.
pub fn resolve_group(group: &[Feature], radius_m: f64) -> Vec<MergeDecision> {
    let created = group
        .iter()
        .enumerate()
        .filter(|(_, feature)| !feature.deleted)
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    if created.is_empty() {
        return Vec::new();
    }

    let mut decisions = Vec::new();
    let mut in_range = Vec::new();
    for (deleted, feature) in group.iter().enumerate().filter(|(_, f)| f.deleted) {
        let nearby = created
            .iter()
            .copied()
            .filter(|index| {
                geo::distance_m(feature.position(), group[*index].position()) < radius_m
            })
            .collect::<Vec<_>>();
        if nearby.is_empty() {
            decisions.push(MergeDecision::Closed { deleted });
        } else {
            in_range.push((deleted, nearby));
        }
    }

    match in_range.as_slice() {
        [] => {}
        [(deleted, nearby)] => decisions.push(resolve_candidate(group, *deleted, nearby)),
        _ => decisions.extend(
            in_range
                .iter()
                .map(|(deleted, _)| MergeDecision::Skipped { deleted: *deleted }),
        ),
    }
    decisions.sort_by_key(MergeDecision::deleted);
    decisions
}

fn resolve_candidate(group: &[Feature], deleted: usize, nearby: &[usize]) -> MergeDecision {
    let feature = &group[deleted];
    let mut ambiguous = false;
    for by in [
        MatchType::NameMatch,
        MatchType::OtherTagsMatch,
        MatchType::OtherNameMatch,
        MatchType::EmptyNameMatch,
    ] {
        if by == MatchType::EmptyNameMatch && nearby.len() != 1 {
            continue;
        }
        let hits = nearby
            .iter()
            .copied()
            .filter(|index| matches_by(by, feature, &group[*index]))
            .collect::<Vec<_>>();
        match hits.as_slice() {
            [] => {}
            [created] => {
                return MergeDecision::Merge {
                    deleted,
                    created: *created,
                    by,
                };
            }
            _ => ambiguous = true,
        }
    }
    if ambiguous {
        MergeDecision::Ambiguous { deleted }
    } else {
        MergeDecision::NoMatch { deleted }
    }
}

/// Edit copying the collections of `removed` onto `survivor`: `set` when the
/// survivor lacks the list, otherwise `append`/`appendmany`.
pub fn merge_edit(survivor: &Value, removed: &Value) -> Result<EditObject, OprError> {
    let mut edit = EditObject::new(object_id(survivor)?);
    let fields = removed
        .as_object()
        .ok_or_else(|| OprError::MalformedRecord("place is not an object".to_string()))?;
    for (field, value) in fields {
        if field == "id" {
            continue;
        }
        let Some(categories) = value.as_object() else {
            continue;
        };
        for (category, list) in categories {
            let Some(items) = list.as_array().filter(|items| !items.is_empty()) else {
                continue;
            };
            let path = format!("{}.{}", escape_key(field), escape_key(category));
            let existing = survivor.get(field).and_then(|f| f.get(category));
            let change = match existing {
                None => ChangeOp::Set(list.clone()),
                Some(existing) => {
                    edit.current.insert(path.clone(), existing.clone());
                    match items.as_slice() {
                        [single] => ChangeOp::Append(single.clone()),
                        _ => ChangeOp::AppendMany(items.clone()),
                    }
                }
            };
            edit.change.insert(path, change);
        }
    }
    Ok(edit)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSettings {
    pub radius_m: f64,
    pub places_per_operation: usize,
    pub operations_per_block: usize,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            radius_m: DEFAULT_MERGE_RADIUS_M,
            places_per_operation: 250,
            operations_per_block: 16,
        }
    }
}

pub struct MergeEngine<'a> {
    ledger: &'a dyn Ledger,
    settings: MergeSettings,
}

impl<'a> MergeEngine<'a> {
    pub fn new(ledger: &'a dyn Ledger, settings: MergeSettings) -> Self {
        Self { ledger, settings }
    }

    /// Pairs `(survivor, removed)` for every merge decision, plus counts.
    pub fn plan(&self, features: &[Feature]) -> (Vec<(RecordId, RecordId)>, MergeReport) {
        let mut report = MergeReport::default();
        let mut pairs = Vec::new();
        for group in merge_groups(features) {
            report.groups += 1;
            for decision in resolve_group(group, self.settings.radius_m) {
                match decision {
                    MergeDecision::Merge {
                        deleted,
                        created,
                        by,
                    } => {
                        report.similar += 1;
                        debug!(
                            survivor = %group[created].place_id,
                            removed = %group[deleted].place_id,
                            by = ?by,
                            "places merge"
                        );
                        pairs.push((
                            group[created].place_id.clone(),
                            group[deleted].place_id.clone(),
                        ));
                    }
                    MergeDecision::Closed { .. } => report.closed += 1,
                    MergeDecision::Ambiguous { deleted } => {
                        report.similar += 1;
                        report.ambiguous += 1;
                        debug!(removed = %group[deleted].place_id, "ambiguous merge candidates");
                    }
                    MergeDecision::NoMatch { .. } => report.similar += 1,
                    MergeDecision::Skipped { deleted } => {
                        report.skipped += 1;
                        debug!(
                            removed = %group[deleted].place_id,
                            "competing deleted places, group skipped"
                        );
                    }
                }
            }
        }
        (pairs, report)
    }

    pub fn run(&self, features: &[Feature], dry_run: bool) -> Result<MergeReport, OprError> {
        let (pairs, mut report) = self.plan(features);
        report.dry_run = dry_run;
        if dry_run {
            report.merged = pairs.len();
            info!(?report, "merge dry run finished");
            return Ok(report);
        }

        let mut operation = Operation::new(PLACE_TYPE);
        for (survivor, removed) in &pairs {
            let survivor_id = id_parts(survivor);
            let removed_id = id_parts(removed);
            let (Some(survivor_value), Some(removed_value)) = (
                self.ledger.object(PLACE_TYPE, &survivor_id)?,
                self.ledger.object(PLACE_TYPE, &removed_id)?,
            ) else {
                warn!(survivor = %survivor, removed = %removed, "merge pair no longer exists");
                continue;
            };
            operation.edit.push(merge_edit(&survivor_value, &removed_value)?);
            operation.delete.push(removed_id);
            report.merged += 1;
            if operation.edit.len() >= self.settings.places_per_operation {
                self.commit(std::mem::replace(&mut operation, Operation::new(PLACE_TYPE)))?;
                report.operations += 1;
            }
        }
        if !operation.is_empty() {
            self.commit(operation)?;
            report.operations += 1;
        }
        self.ledger.create_block()?;
        info!(
            groups = report.groups,
            closed = report.closed,
            similar = report.similar,
            merged = report.merged,
            ambiguous = report.ambiguous,
            skipped = report.skipped,
            operations = report.operations,
            "merge finished"
        );
        Ok(report)
    }

    fn commit(&self, operation: Operation) -> Result<(), OprError> {
        let signed = self.ledger.sign_and_stamp(operation)?;
        self.ledger.add_operation(signed)?;
        if self.ledger.queued_operations() >= self.settings.operations_per_block {
            self.ledger.create_block()?;
        }
        Ok(())
    }
}

fn id_parts(id: &RecordId) -> ObjectId {
    vec![id.tile.clone(), id.suffix.clone()]
}

fn in_window(timestamp: Option<&str>, since: DateTime<Utc>) -> bool {
    timestamp
        .and_then(|value| parse_timestamp(value).ok())
        .is_some_and(|at| at >= since)
}

fn feature_from(id: &RecordId, entry: &SourceEntry, deleted: bool) -> Feature {
    Feature {
        place_id: id.clone(),
        lat: entry.lat,
        lon: entry.lon,
        tags: entry.tags.clone(),
        deleted,
    }
}

/// Start of the scan window: `months` before `now`.
pub fn window_start(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(months)).unwrap_or(now)
}

/// Places created or closed since `since`, ordered by tile with created
/// features ahead of deleted ones.
pub fn export_features(ledger: &dyn Ledger, since: DateTime<Utc>) -> Result<Vec<Feature>, OprError> {
    let mut features = Vec::new();
    for value in ledger.objects(PLACE_TYPE)? {
        let record = match LocalRecord::from_value(&value) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "skipping unreadable place");
                continue;
            }
        };
        if let Some(entry) = record.primary_entry() {
            if in_window(entry.timestamp.as_deref(), since) {
                features.push(feature_from(&record.id, entry, false));
            }
        } else if let Some(entry) = record.source.osm.last() {
            if in_window(entry.deleted.as_deref(), since) {
                features.push(feature_from(&record.id, entry, true));
            }
        }
    }
    features.sort_by(|a, b| {
        (a.place_id.tile.as_str(), a.deleted).cmp(&(b.place_id.tile.as_str(), b.deleted))
    });
    debug!(features = features.len(), "features exported");
    Ok(features)
}
