//! Per tag-group sync state and the status transitions derived from it.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{BBox, EntityType};
use crate::error::OprError;
use crate::ledger::{ChangeOp, EditObject, F_BOT_STATE};
use crate::overpass::{OverpassQuery, TagFilter};
use crate::record::escape_key;

pub const F_OSM_TAGS: &str = "osm_tags";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A named key/value filter the sync keeps current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagGroup {
    pub name: String,
    pub key: String,
    pub values: BTreeSet<String>,
    pub kinds: BTreeSet<EntityType>,
    pub bbox: Option<BBox>,
}

impl TagGroup {
    pub fn filter(&self) -> TagFilter {
        TagFilter {
            key: self.key.clone(),
            values: self.values.iter().cloned().collect(),
            kinds: self.kinds.iter().copied().collect(),
        }
    }
}

/// What has been synchronized for one group, and up to when.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub values: BTreeSet<String>,
    #[serde(default, rename = "type")]
    pub kinds: BTreeSet<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
    #[serde(default)]
    pub date: String,
}

impl SyncState {
    pub fn is_empty(&self) -> bool {
        self.date.is_empty()
    }

    pub fn for_group(group: &TagGroup, date: &str) -> Self {
        Self {
            key: group.key.clone(),
            values: group.values.clone(),
            kinds: group.kinds.clone(),
            bbox: group.bbox,
            date: date.to_string(),
        }
    }

    fn same_tags(&self, other: &SyncState) -> bool {
        self.key == other.key && self.values == other.values && self.kinds == other.kinds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Fresh,
    FullResync,
    TagChange,
    Incremental,
    UpToDate,
}

/// Classifies a group from its tracked state, which carries the configured
/// tags, and the durable record of what was actually synchronized. Every
/// input yields exactly one status.
pub fn status(tracked: &SyncState, durable: Option<&SyncState>, target: &str) -> SyncStatus {
    let Some(durable) = durable else {
        return if tracked.is_empty() {
            SyncStatus::Fresh
        } else {
            SyncStatus::FullResync
        };
    };
    if tracked.is_empty() || durable.date != tracked.date {
        SyncStatus::FullResync
    } else if tracked.date == target {
        if tracked.same_tags(durable) {
            SyncStatus::UpToDate
        } else {
            SyncStatus::TagChange
        }
    } else {
        SyncStatus::Incremental
    }
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, OprError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| OprError::Timestamp(format!("{value}: {err}")))
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub interval: Duration,
    pub safety_delay: Duration,
    pub max_diff_window: Duration,
}

impl Default for Alignment {
    fn default() -> Self {
        Self {
            interval: Duration::minutes(15),
            safety_delay: Duration::minutes(3),
            max_diff_window: Duration::hours(3),
        }
    }
}

impl Alignment {
    /// Pulls the upstream timestamp back by the safety delay and floors it
    /// to the interval grid.
    pub fn align(&self, latest: &str) -> Result<DateTime<Utc>, OprError> {
        let delayed = parse_timestamp(latest)? - self.safety_delay;
        delayed
            .duration_trunc(self.interval)
            .map_err(|err| OprError::Timestamp(err.to_string()))
    }

    /// Target date for one group: never behind the tracked date and never
    /// more than one diff window ahead of it.
    pub fn group_target(
        &self,
        aligned: DateTime<Utc>,
        tracked: &SyncState,
    ) -> Result<String, OprError> {
        if tracked.is_empty() {
            return Ok(format_timestamp(aligned));
        }
        let from = parse_timestamp(&tracked.date)?;
        if aligned <= from {
            return Ok(tracked.date.clone());
        }
        Ok(format_timestamp(aligned.min(from + self.max_diff_window)))
    }
}

/// A request of a plan; snapshot requests may be split by region.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub query: OverpassQuery,
    pub splittable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlan {
    pub group: String,
    pub status: SyncStatus,
    pub target: String,
    pub requests: Vec<SyncRequest>,
    pub next_state: SyncState,
}

impl GroupPlan {
    pub fn is_noop(&self) -> bool {
        self.requests.is_empty() && self.status == SyncStatus::UpToDate
    }
}

fn check_compatible(group: &TagGroup, tracked: &SyncState) -> Result<(), OprError> {
    if tracked.key.is_empty() {
        return Ok(());
    }
    if tracked.key != group.key {
        return Err(OprError::Config(format!(
            "group {}: changing the sync key from {} to {} is not supported",
            group.name, tracked.key, group.key
        )));
    }
    if tracked.bbox != group.bbox {
        return Err(OprError::Config(format!(
            "group {}: changing the bbox is not supported",
            group.name
        )));
    }
    Ok(())
}

/// Filter selecting only what `synced` does not cover yet.
fn added_tags(group: &TagGroup, synced: &SyncState) -> Result<Option<TagFilter>, OprError> {
    let new_kinds = group
        .kinds
        .difference(&synced.kinds)
        .copied()
        .collect::<Vec<_>>();
    let new_values = group
        .values
        .difference(&synced.values)
        .cloned()
        .collect::<Vec<_>>();
    match (new_kinds.is_empty(), new_values.is_empty()) {
        (true, true) => Ok(None),
        (false, true) => Ok(Some(TagFilter {
            key: group.key.clone(),
            values: group.values.iter().cloned().collect(),
            kinds: new_kinds,
        })),
        (true, false) => Ok(Some(TagFilter {
            key: group.key.clone(),
            values: new_values,
            kinds: group.kinds.iter().copied().collect(),
        })),
        (false, false) => Err(OprError::Config(format!(
            "group {}: kinds and values cannot be added at the same time",
            group.name
        ))),
    }
}

fn snapshot(date: &str, filter: TagFilter, bbox: Option<BBox>) -> SyncRequest {
    SyncRequest {
        query: OverpassQuery::snapshot(date, filter, bbox),
        splittable: true,
    }
}

pub fn plan_group(
    group: &TagGroup,
    tracked: &SyncState,
    durable: Option<&SyncState>,
    target: &str,
) -> Result<GroupPlan, OprError> {
    let configured = SyncState::for_group(group, &tracked.date);
    let status = status(&configured, durable, target);
    if matches!(status, SyncStatus::TagChange | SyncStatus::Incremental) {
        check_compatible(group, tracked)?;
    }
    // Both statuses imply a durable state; the tag delta is taken against it.
    let synced = durable.unwrap_or(tracked);

    let mut requests = Vec::new();
    match status {
        SyncStatus::Fresh | SyncStatus::FullResync => {
            requests.push(snapshot(target, group.filter(), group.bbox));
        }
        SyncStatus::TagChange => {
            if let Some(filter) = added_tags(group, synced)? {
                requests.push(snapshot(target, filter, group.bbox));
            }
        }
        SyncStatus::Incremental => {
            // Values added since the last cycle are caught up at the old date
            // before the diff moves everything forward.
            if let Some(filter) = added_tags(group, synced)? {
                requests.push(snapshot(&tracked.date, filter, group.bbox));
            }
            requests.push(SyncRequest {
                query: OverpassQuery::diff(&tracked.date, target, group.filter()),
                splittable: false,
            });
        }
        SyncStatus::UpToDate => {}
    }
    requests.retain(|request| !request.query.filter.is_empty());

    Ok(GroupPlan {
        group: group.name.clone(),
        status,
        target: target.to_string(),
        requests,
        next_state: SyncState::for_group(group, target),
    })
}

pub fn tracked_path(group: &str) -> String {
    format!("{F_BOT_STATE}.{F_OSM_TAGS}.{}", escape_key(group))
}

pub fn tracked_state(bot_state: Option<&Value>, group: &str) -> Result<SyncState, OprError> {
    let Some(raw) = bot_state
        .and_then(|state| state.get(F_OSM_TAGS))
        .and_then(|groups| groups.get(group))
    else {
        return Ok(SyncState::default());
    };
    serde_json::from_value(raw.clone())
        .map_err(|err| OprError::Ledger(format!("bot state of {group}: {err}")))
}

/// Ledger edit moving the tracked copy of `group` from `previous` to `next`.
pub fn tracked_state_edit(
    bot: &str,
    group: &str,
    previous: &SyncState,
    next: &SyncState,
) -> Result<EditObject, OprError> {
    let base = tracked_path(group);
    let mut edit = EditObject::new(vec![bot.to_string()]);
    let next_value =
        serde_json::to_value(next).map_err(|err| OprError::Ledger(err.to_string()))?;
    if previous.is_empty() && previous.key.is_empty() {
        edit.change.insert(base, ChangeOp::Set(next_value));
        return Ok(edit);
    }
    let previous_value =
        serde_json::to_value(previous).map_err(|err| OprError::Ledger(err.to_string()))?;
    for field in ["key", "values", "type", "date", "bbox"] {
        let old = previous_value.get(field);
        let new = next_value.get(field);
        if old == new {
            continue;
        }
        let path = format!("{base}.{field}");
        match new {
            Some(new) => {
                edit.change.insert(path.clone(), ChangeOp::Set(new.clone()));
            }
            None => {
                edit.change.insert(path.clone(), ChangeOp::Delete);
            }
        }
        if let Some(old) = old {
            edit.current.insert(path, old.clone());
        }
    }
    Ok(edit)
}

/// Durable copy of the sync state, kept outside the ledger.
pub trait SyncStateStore: Send + Sync {
    fn get(&self, source_key: &str) -> Result<Option<SyncState>, OprError>;
    fn put(&self, source_key: &str, state: &SyncState) -> Result<(), OprError>;
}
