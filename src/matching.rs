//! Name and identity matching shared by the reconciler and the merge pass.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::LatLon;
use crate::geo;

pub const NAME: &str = "name";
pub const WIKIDATA: &str = "wikidata";
pub const WEBSITE: &str = "website";

fn edge_punctuation() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\p{P}+|\p{P}+$").expect("static regex"))
}

fn fold_char(ch: char) -> char {
    match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' => 'i',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' => 'u',
        'ý' | 'ÿ' => 'y',
        'ś' | 'š' => 's',
        'ź' | 'ż' | 'ž' => 'z',
        'ł' => 'l',
        'ř' => 'r',
        other => other,
    }
}

/// Lower-cases and strips the common Latin diacritics so that comparisons
/// behave like a primary-strength collation.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().chars().map(fold_char).collect()
}

pub fn words(name: &str) -> Vec<String> {
    let pattern = edge_punctuation();
    name.split_whitespace()
        .map(|word| pattern.replace_all(word, "").into_owned())
        .filter(|word| !word.is_empty())
        .collect()
}

/// Edit distance allowed between two words, keyed on the shorter one.
pub fn word_tolerance(a: &str, b: &str) -> usize {
    let shortest = a.chars().count().min(b.chars().count());
    match shortest {
        0..=4 => 1,
        5..=6 => 2,
        7..=8 => 3,
        _ => 4,
    }
}

pub fn words_match(a: &str, b: &str) -> bool {
    a == b || strsim::levenshtein(a, b) <= word_tolerance(a, b)
}

/// Every word of `sub` pairs with a distinct, fuzzily equal word of `main`.
pub fn is_fuzzy_subset(main: &[String], sub: &[String]) -> bool {
    if sub.is_empty() || sub.len() > main.len() {
        return false;
    }
    let mut used = vec![false; main.len()];
    sub.iter().all(|wanted| {
        let found = main
            .iter()
            .enumerate()
            .find(|(index, word)| !used[*index] && words_match(word, wanted))
            .map(|(index, _)| index);
        match found {
            Some(index) => {
                used[index] = true;
                true
            }
            None => false,
        }
    })
}

pub fn names_match(left: &str, right: &str) -> bool {
    if left.trim().is_empty() || right.trim().is_empty() {
        return false;
    }
    let left = normalize_name(left);
    let right = normalize_name(right);
    if left == right {
        return true;
    }
    let compact = |value: &str| value.chars().filter(|ch| !ch.is_whitespace()).collect::<String>();
    if compact(&left) == compact(&right) {
        return true;
    }

    let mut left_words = words(&left);
    let mut right_words = words(&right);
    left_words.sort();
    right_words.sort();
    left_words == right_words
        || is_fuzzy_subset(&left_words, &right_words)
        || is_fuzzy_subset(&right_words, &left_words)
}

pub fn equals_non_empty(left: Option<&str>, right: Option<&str>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => {
            let left = left.trim();
            !left.is_empty() && left == right.trim()
        }
        _ => false,
    }
}

fn is_name_key(key: &str) -> bool {
    key.starts_with(NAME) || key.ends_with("_name")
}

/// Every name-like tag value: `name`, `name:*`, `old_name`, `alt_name`, ...
pub fn name_variants(tags: &BTreeMap<String, String>) -> Vec<&str> {
    tags.iter()
        .filter(|(key, value)| is_name_key(key) && !value.trim().is_empty())
        .map(|(_, value)| value.as_str())
        .collect()
}

/// Access to the fields a fingerprint can be computed from.
pub trait FingerprintSource {
    fn field(&self, name: &str) -> Option<String>;
    fn tag(&self, key: &str) -> Option<&str>;
    fn position(&self) -> LatLon;
}

/// One component of a match fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum FingerprintSelector {
    Field { field: String },
    Tag { key: String },
    /// Concatenates the listed tags, each cut at its first `;`.
    FirstNonEmpty { keys: Vec<String> },
    /// Tag value without spaces and dashes, lower-cased.
    SimpleName { key: String },
    /// Geohash prefix of the entity position.
    PlaceLocation { length: usize },
}

impl FingerprintSelector {
    fn evaluate<S: FingerprintSource + ?Sized>(&self, source: &S) -> Option<String> {
        match self {
            FingerprintSelector::Field { field } => source.field(field),
            FingerprintSelector::Tag { key } => source.tag(key).map(str::to_string),
            FingerprintSelector::FirstNonEmpty { keys } => {
                let joined = keys
                    .iter()
                    .filter_map(|key| source.tag(key))
                    .map(|value| value.split(';').next().unwrap_or(value))
                    .collect::<String>();
                (!joined.is_empty()).then_some(joined)
            }
            FingerprintSelector::SimpleName { key } => source.tag(key).map(|value| {
                value
                    .chars()
                    .filter(|ch| *ch != ' ' && *ch != '-')
                    .collect::<String>()
                    .to_lowercase()
            }),
            FingerprintSelector::PlaceLocation { length } => {
                Some(geo::geohash(source.position(), *length))
            }
        }
    }
}

pub fn default_fingerprint() -> Vec<FingerprintSelector> {
    vec![
        FingerprintSelector::Field {
            field: "osm_value".to_string(),
        },
        FingerprintSelector::SimpleName {
            key: NAME.to_string(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchFingerprint(Vec<Option<String>>);

impl MatchFingerprint {
    pub fn compute<S: FingerprintSource + ?Sized>(
        selectors: &[FingerprintSelector],
        source: &S,
    ) -> Self {
        Self(selectors.iter().map(|s| s.evaluate(source)).collect())
    }
}
