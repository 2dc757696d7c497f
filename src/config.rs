use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::{BBox, EntityType};
use crate::error::OprError;
use crate::matching::{FingerprintSelector, default_fingerprint};
use crate::merge::{DEFAULT_MERGE_RADIUS_M, DEFAULT_MONTHS, MergeSettings};
use crate::orchestrator::RetryPolicy;
use crate::overpass::OverpassSettings;
use crate::planner::{DEFAULT_MAX_DEPTH, DEFAULT_SPLIT_THRESHOLD, SplitSettings};
use crate::reconcile::ReconcileSettings;
use crate::sync_state::{Alignment, TagGroup};

pub const DEFAULT_CONFIG_FILE: &str = "opr-sync.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub bot: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub places_per_operation: Option<usize>,
    #[serde(default)]
    pub operations_per_block: Option<usize>,
    #[serde(default)]
    pub fingerprint: Option<Vec<FingerprintSelector>>,
    #[serde(default)]
    pub tag_groups: Vec<TagGroupEntry>,
    #[serde(default)]
    pub split: Option<SplitSection>,
    #[serde(default)]
    pub merge: Option<MergeSection>,
    #[serde(default)]
    pub overpass: Option<OverpassSection>,
    #[serde(default)]
    pub alignment: Option<AlignmentSection>,
    #[serde(default)]
    pub stale_index: Option<RetrySection>,
}

/// `"amenity=cafe,restaurant"` or the detailed object form.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TagGroupEntry {
    Shorthand(String),
    Detailed(TagGroupObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TagGroupObject {
    #[serde(default)]
    pub name: Option<String>,
    pub key: String,
    pub values: Vec<String>,
    #[serde(default, rename = "type")]
    pub kinds: Option<Vec<EntityType>>,
    #[serde(default)]
    pub bbox: Option<BBox>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SplitSection {
    #[serde(default)]
    pub threshold: Option<u64>,
    #[serde(default)]
    pub max_depth: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MergeSection {
    #[serde(default)]
    pub radius_m: Option<f64>,
    #[serde(default)]
    pub months: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OverpassSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timestamp_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AlignmentSection {
    #[serde(default)]
    pub interval_minutes: Option<i64>,
    #[serde(default)]
    pub safety_delay_minutes: Option<i64>,
    #[serde(default)]
    pub max_diff_window_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetrySection {
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub bot: String,
    pub workers: usize,
    pub reconcile: ReconcileSettings,
    pub tag_groups: Vec<TagGroup>,
    pub split: SplitSettings,
    pub merge: MergeSettings,
    pub merge_months: u32,
    pub overpass: OverpassSettings,
    pub alignment: Alignment,
    pub retry: RetryPolicy,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, OprError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(OprError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| OprError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| OprError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, OprError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let places_per_operation = positive(config.places_per_operation, 250, "places_per_operation")?;
        let operations_per_block = positive(config.operations_per_block, 16, "operations_per_block")?;

        let tag_groups = config
            .tag_groups
            .into_iter()
            .map(|entry| match entry {
                TagGroupEntry::Shorthand(value) => parse_shorthand(&value),
                TagGroupEntry::Detailed(obj) => Ok(TagGroup {
                    name: obj.name.unwrap_or_else(|| obj.key.clone()),
                    key: obj.key,
                    values: obj.values.into_iter().collect(),
                    kinds: obj
                        .kinds
                        .map(|kinds| kinds.into_iter().collect())
                        .unwrap_or_else(default_kinds),
                    bbox: obj.bbox,
                }),
            })
            .collect::<Result<Vec<_>, OprError>>()?;
        validate_groups(&tag_groups)?;

        let split = config.split.unwrap_or_default();
        let merge = config.merge.unwrap_or_default();
        let overpass = config.overpass.unwrap_or_default();
        let alignment = config.alignment.unwrap_or_default();
        let retry = config.stale_index.unwrap_or_default();
        let default_overpass = OverpassSettings::default();
        let default_alignment = Alignment::default();
        let default_retry = RetryPolicy::default();

        let radius_m = merge.radius_m.unwrap_or(DEFAULT_MERGE_RADIUS_M);
        if radius_m.is_nan() || radius_m <= 0.0 {
            return Err(OprError::Config(format!(
                "merge radius must be positive, got {radius_m}"
            )));
        }

        Ok(ResolvedConfig {
            schema_version,
            bot: config.bot.unwrap_or_else(|| "osm-sync".to_string()),
            workers: positive(config.workers, 4, "workers")?,
            reconcile: ReconcileSettings {
                places_per_operation,
                operations_per_block,
                fingerprint: config.fingerprint.unwrap_or_else(default_fingerprint),
            },
            tag_groups,
            split: SplitSettings {
                threshold: split.threshold.unwrap_or(DEFAULT_SPLIT_THRESHOLD),
                max_depth: split.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            },
            merge: MergeSettings {
                radius_m,
                places_per_operation,
                operations_per_block,
            },
            merge_months: merge.months.unwrap_or(DEFAULT_MONTHS),
            overpass: OverpassSettings {
                url: overpass.url.unwrap_or(default_overpass.url),
                timestamp_url: overpass
                    .timestamp_url
                    .unwrap_or(default_overpass.timestamp_url),
                timeout_secs: overpass.timeout_secs.unwrap_or(default_overpass.timeout_secs),
            },
            alignment: Alignment {
                interval: minutes(
                    alignment.interval_minutes,
                    default_alignment.interval,
                    "interval_minutes",
                    1,
                )?,
                safety_delay: minutes(
                    alignment.safety_delay_minutes,
                    default_alignment.safety_delay,
                    "safety_delay_minutes",
                    0,
                )?,
                max_diff_window: minutes(
                    alignment.max_diff_window_minutes,
                    default_alignment.max_diff_window,
                    "max_diff_window_minutes",
                    1,
                )?,
            },
            retry: RetryPolicy {
                attempts: retry.attempts.unwrap_or(default_retry.attempts).max(1),
                backoff: retry
                    .backoff_ms
                    .map(StdDuration::from_millis)
                    .unwrap_or(default_retry.backoff),
            },
        })
    }
}

pub fn default_kinds() -> BTreeSet<EntityType> {
    [EntityType::Node, EntityType::Way].into_iter().collect()
}

fn positive(value: Option<usize>, default: usize, name: &str) -> Result<usize, OprError> {
    match value {
        Some(0) => Err(OprError::Config(format!("{name} must be at least 1"))),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

/// Alignment durations are capped at 31 days.
const MAX_ALIGNMENT_MINUTES: i64 = 31 * 24 * 60;

fn minutes(
    value: Option<i64>,
    default: Duration,
    name: &str,
    min: i64,
) -> Result<Duration, OprError> {
    match value {
        Some(value) if !(min..=MAX_ALIGNMENT_MINUTES).contains(&value) => {
            Err(OprError::Config(format!(
                "alignment.{name} must be between {min} and {MAX_ALIGNMENT_MINUTES}, got {value}"
            )))
        }
        Some(value) => Ok(Duration::minutes(value)),
        None => Ok(default),
    }
}

fn parse_shorthand(value: &str) -> Result<TagGroup, OprError> {
    let (key, values) = value
        .split_once('=')
        .ok_or_else(|| OprError::Config(format!("tag group must look like key=v1,v2: {value}")))?;
    let key = key.trim();
    let values = values
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    Ok(TagGroup {
        name: key.to_string(),
        key: key.to_string(),
        values,
        kinds: default_kinds(),
        bbox: None,
    })
}

fn validate_groups(groups: &[TagGroup]) -> Result<(), OprError> {
    let mut names = HashSet::new();
    for group in groups {
        if group.key.trim().is_empty() {
            return Err(OprError::Config(format!("group {} has an empty key", group.name)));
        }
        if group.values.is_empty() || group.kinds.is_empty() {
            return Err(OprError::Config(format!(
                "group {} needs at least one value and one type",
                group.name
            )));
        }
        if !names.insert(group.name.as_str()) {
            return Err(OprError::Config(format!("duplicate group name {}", group.name)));
        }
    }
    Ok(())
}
