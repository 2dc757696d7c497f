//! Streaming decoder for Overpass XML responses.
//!
//! The decoder pulls one element at a time and hands back batches, so a
//! response is never held in memory as a whole.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::warn;

use crate::domain::{
    ChangeKind, DiffEntity, EntityType, ExternalEntity, LatLon, RelationMember, Shape,
    VersionMeta, WayNode,
};
use crate::error::OprError;
use crate::geo;

#[derive(Debug)]
enum Markup {
    Open {
        name: String,
        attrs: HashMap<String, String>,
        empty: bool,
    },
    Close(String),
    Text(String),
    Eof,
    Skip,
}

#[derive(Debug)]
struct EntityBuilder {
    entity_type: EntityType,
    id: Result<i64, String>,
    point: Option<LatLon>,
    center: Option<LatLon>,
    bounds: Option<LatLon>,
    nodes: Vec<WayNode>,
    members: Vec<RelationMember>,
    member_points: Vec<LatLon>,
    tags: BTreeMap<String, String>,
    meta: VersionMeta,
}

impl EntityBuilder {
    fn open(entity_type: EntityType, attrs: &HashMap<String, String>) -> Self {
        let id = attrs
            .get("id")
            .ok_or_else(|| format!("{entity_type} without id"))
            .and_then(|raw| {
                raw.parse::<i64>()
                    .map_err(|_| format!("{entity_type} with invalid id {raw}"))
            });
        let meta = VersionMeta {
            version: attrs.get("version").and_then(|v| v.parse().ok()),
            timestamp: attrs.get("timestamp").cloned(),
            changeset: attrs.get("changeset").and_then(|v| v.parse().ok()),
            uid: attrs.get("uid").and_then(|v| v.parse().ok()),
            user: attrs.get("user").cloned(),
            visible: attrs.get("visible").map(|v| v == "true"),
        };
        Self {
            entity_type,
            id,
            point: lat_lon(attrs, "lat", "lon"),
            center: None,
            bounds: None,
            nodes: Vec::new(),
            members: Vec::new(),
            member_points: Vec::new(),
            tags: BTreeMap::new(),
            meta,
        }
    }

    fn build(self) -> Result<ExternalEntity, String> {
        let id = self.id?;
        let (shape, position) = match self.entity_type {
            EntityType::Node => (Shape::Node, self.point),
            EntityType::Way => {
                let points = self
                    .nodes
                    .iter()
                    .filter_map(|node| node.position)
                    .collect::<Vec<_>>();
                let position = geo::centroid(&points)
                    .or(self.center)
                    .or(self.bounds);
                (Shape::Way { nodes: self.nodes }, position)
            }
            EntityType::Relation => {
                let position = self
                    .center
                    .or_else(|| geo::centroid(&self.member_points))
                    .or(self.bounds);
                (
                    Shape::Relation {
                        members: self.members,
                    },
                    position,
                )
            }
        };
        let position =
            position.ok_or_else(|| format!("{}/{id} has no coordinates", self.entity_type))?;
        Ok(ExternalEntity {
            id,
            shape,
            position,
            tags: self.tags,
            meta: self.meta,
        })
    }
}

#[derive(Debug)]
struct ActionBuilder {
    kind: Result<ChangeKind, String>,
    in_old: bool,
    old: Option<Result<ExternalEntity, String>>,
    new: Option<Result<ExternalEntity, String>>,
}

impl ActionBuilder {
    fn build(self) -> Result<DiffEntity, OprError> {
        let kind = self.kind.map_err(OprError::MalformedRecord)?;
        let half = |value: Option<Result<ExternalEntity, String>>, needed: bool| match value {
            Some(Ok(entity)) => Ok(Some(entity)),
            Some(Err(reason)) if needed => Err(OprError::MalformedRecord(reason)),
            _ => Ok(None),
        };
        let old = half(self.old, kind != ChangeKind::Create)?;
        let new = half(self.new, kind != ChangeKind::Delete)?;
        if let (Some(old), Some(new)) = (&old, &new) {
            if old.key() != new.key() {
                return Err(OprError::MalformedRecord(format!(
                    "diff halves disagree: {} != {}",
                    old.key(),
                    new.key()
                )));
            }
        }
        DiffEntity::from_parts(kind, old, new)
    }
}

#[derive(Debug)]
enum Decoded {
    Entity(ExternalEntity),
    Diff(DiffEntity),
}

pub struct FeedDecoder<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    current: Option<EntityBuilder>,
    action: Option<ActionBuilder>,
    in_member: bool,
    remark: Option<String>,
    finished: bool,
    malformed: usize,
}

impl<R: BufRead> FeedDecoder<R> {
    pub fn new(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            current: None,
            action: None,
            in_member: false,
            remark: None,
            finished: false,
            malformed: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Records skipped so far because they could not be decoded.
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    /// Returns up to `limit` entities; fewer only once the stream is exhausted.
    pub fn next_entities(&mut self, limit: usize) -> Result<Vec<ExternalEntity>, OprError> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            match self.next_decoded()? {
                Some(Decoded::Entity(entity)) => batch.push(entity),
                Some(Decoded::Diff(diff)) => {
                    warn!(key = %diff.lookup_key(), "diff action in snapshot response ignored");
                }
                None => break,
            }
        }
        Ok(batch)
    }

    /// Returns up to `limit` diff actions; fewer only once the stream is exhausted.
    pub fn next_diffs(&mut self, limit: usize) -> Result<Vec<DiffEntity>, OprError> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            match self.next_decoded()? {
                Some(Decoded::Diff(diff)) => batch.push(diff),
                Some(Decoded::Entity(entity)) => {
                    warn!(key = %entity.key(), "bare entity in diff response ignored");
                }
                None => break,
            }
        }
        Ok(batch)
    }

    fn next_decoded(&mut self) -> Result<Option<Decoded>, OprError> {
        while !self.finished {
            let markup = self.next_markup()?;
            let decoded = match markup {
                Markup::Open { name, attrs, empty } => {
                    let opened = self.open(&name, &attrs, empty)?;
                    if empty {
                        opened.or(self.close(&name)?)
                    } else {
                        opened
                    }
                }
                Markup::Close(name) => self.close(&name)?,
                Markup::Text(text) => {
                    if let Some(remark) = self.remark.as_mut() {
                        remark.push_str(&text);
                    }
                    None
                }
                Markup::Eof => {
                    self.finished = true;
                    None
                }
                Markup::Skip => None,
            };
            if decoded.is_some() {
                return Ok(decoded);
            }
        }
        Ok(None)
    }

    fn next_markup(&mut self) -> Result<Markup, OprError> {
        self.buf.clear();
        let event = self
            .reader
            .read_event_into(&mut self.buf)
            .map_err(map_xml_error)?;
        let markup = match event {
            Event::Start(element) => Markup::Open {
                name: element_name(&element),
                attrs: attributes(&element)?,
                empty: false,
            },
            Event::Empty(element) => Markup::Open {
                name: element_name(&element),
                attrs: attributes(&element)?,
                empty: true,
            },
            Event::End(element) => {
                Markup::Close(String::from_utf8_lossy(element.name().as_ref()).into_owned())
            }
            Event::Text(text) => Markup::Text(
                text.unescape()
                    .map_err(|err| OprError::Decode(err.to_string()))?
                    .into_owned(),
            ),
            Event::Eof => Markup::Eof,
            _ => Markup::Skip,
        };
        Ok(markup)
    }

    fn open(
        &mut self,
        name: &str,
        attrs: &HashMap<String, String>,
        empty: bool,
    ) -> Result<Option<Decoded>, OprError> {
        match name {
            "remark" => self.remark = Some(String::new()),
            "action" => {
                self.action = Some(ActionBuilder {
                    kind: attrs
                        .get("type")
                        .map(String::as_str)
                        .unwrap_or_default()
                        .parse::<ChangeKind>()
                        .map_err(|err| err.to_string()),
                    in_old: false,
                    old: None,
                    new: None,
                });
            }
            "old" => {
                if let Some(action) = self.action.as_mut() {
                    action.in_old = true;
                }
            }
            "new" => {
                if let Some(action) = self.action.as_mut() {
                    action.in_old = false;
                }
            }
            "node" => self.current = Some(EntityBuilder::open(EntityType::Node, attrs)),
            "way" => self.current = Some(EntityBuilder::open(EntityType::Way, attrs)),
            "relation" => self.current = Some(EntityBuilder::open(EntityType::Relation, attrs)),
            "nd" => {
                if let Some(current) = self.current.as_mut() {
                    let position = lat_lon(attrs, "lat", "lon");
                    if self.in_member {
                        current.member_points.extend(position);
                    } else {
                        let id = attrs.get("ref").and_then(|v| v.parse().ok()).unwrap_or(-1);
                        current.nodes.push(WayNode { id, position });
                    }
                }
            }
            "member" => {
                if let Some(current) = self.current.as_mut() {
                    let member_type = attrs
                        .get("type")
                        .and_then(|v| v.parse::<EntityType>().ok());
                    let reference = attrs.get("ref").and_then(|v| v.parse::<i64>().ok());
                    if let (Some(member_type), Some(reference)) = (member_type, reference) {
                        current.members.push(RelationMember {
                            member_type,
                            reference,
                            role: attrs.get("role").cloned().unwrap_or_default(),
                        });
                    }
                    current.member_points.extend(lat_lon(attrs, "lat", "lon"));
                    self.in_member = !empty;
                }
            }
            "tag" => {
                if let Some(current) = self.current.as_mut() {
                    let key = attrs.get("k").map(|k| k.trim().to_lowercase());
                    if let Some(key) = key.filter(|k| !k.is_empty()) {
                        let value = attrs.get("v").cloned().unwrap_or_default();
                        current.tags.insert(key, value);
                    }
                }
            }
            "center" => {
                if let Some(current) = self.current.as_mut() {
                    current.center = lat_lon(attrs, "lat", "lon");
                }
            }
            "bounds" => {
                if let Some(current) = self.current.as_mut() {
                    let min = lat_lon(attrs, "minlat", "minlon");
                    let max = lat_lon(attrs, "maxlat", "maxlon");
                    if let (Some(min), Some(max)) = (min, max) {
                        current.bounds = geo::centroid(&[min, max]);
                    }
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn close(&mut self, name: &str) -> Result<Option<Decoded>, OprError> {
        match name {
            "remark" => {
                let text = self.remark.take().unwrap_or_default();
                Err(classify_remark(text.trim()))
            }
            "member" => {
                self.in_member = false;
                Ok(None)
            }
            "node" | "way" | "relation" => {
                let Some(builder) = self.current.take() else {
                    return Ok(None);
                };
                let built = builder.build();
                match self.action.as_mut() {
                    Some(action) => {
                        if action.in_old {
                            action.old = Some(built);
                        } else {
                            action.new = Some(built);
                        }
                        Ok(None)
                    }
                    None => match built {
                        Ok(entity) => Ok(Some(Decoded::Entity(entity))),
                        Err(reason) => {
                            self.skip_malformed(&reason);
                            Ok(None)
                        }
                    },
                }
            }
            "action" => {
                let Some(action) = self.action.take() else {
                    return Ok(None);
                };
                match action.build() {
                    Ok(diff) => Ok(Some(Decoded::Diff(diff))),
                    Err(err) => {
                        self.skip_malformed(&err.to_string());
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    fn skip_malformed(&mut self, reason: &str) {
        self.malformed += 1;
        warn!(reason, position = self.reader.buffer_position(), "skipping malformed record");
    }
}

fn element_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.name().as_ref()).into_owned()
}

fn attributes(element: &BytesStart<'_>) -> Result<HashMap<String, String>, OprError> {
    let mut attrs = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|err| OprError::Decode(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| OprError::Decode(err.to_string()))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn lat_lon(attrs: &HashMap<String, String>, lat: &str, lon: &str) -> Option<LatLon> {
    let lat = attrs.get(lat)?.parse::<f64>().ok()?;
    let lon = attrs.get(lon)?.parse::<f64>().ok()?;
    (lat.is_finite() && lon.is_finite()).then(|| LatLon::new(lat, lon))
}

fn map_xml_error(err: quick_xml::Error) -> OprError {
    match err {
        quick_xml::Error::Io(io) => OprError::TransientNetwork(io.to_string()),
        other => OprError::Decode(other.to_string()),
    }
}

/// Maps an Overpass `<remark>` to the error the planner acts upon.
pub fn classify_remark(remark: &str) -> OprError {
    let lowered = remark.to_lowercase();
    let too_large = ["memory", "maxsize", "size", "timeout", "timed out"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if too_large {
        OprError::UpstreamTooLarge(remark.to_string())
    } else {
        OprError::TransientNetwork(format!("overpass remark: {remark}"))
    }
}

/// Reads a `[out:csv(::count;false)]` response: the first integer line.
pub fn parse_count<R: BufRead>(input: R) -> Result<u64, OprError> {
    let mut seen = String::new();
    for line in input.lines() {
        let line = line.map_err(|err| OprError::TransientNetwork(err.to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(count) = trimmed.parse::<u64>() {
            return Ok(count);
        }
        seen.push_str(trimmed);
        seen.push(' ');
    }
    if seen.contains("remark") {
        return Err(classify_remark(seen.trim()));
    }
    Err(OprError::Decode(format!(
        "count response has no number: {}",
        seen.trim()
    )))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SNAPSHOT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="Overpass API">
  <meta osm_base="2024-03-01T10:00:00Z"/>
  <node id="1" lat="48.1" lon="11.5" version="2" timestamp="2024-01-01T00:00:00Z" changeset="7">
    <tag k="amenity" v="cafe"/>
    <tag k="Name" v="Caf&#233; Am Markt"/>
    <tag k="" v="dropped"/>
  </node>
  <node id="2" lat="48.2" lon="11.6"/>
  <way id="3" version="1">
    <bounds minlat="0" minlon="0" maxlat="2" maxlon="2"/>
    <nd ref="10" lat="0.0" lon="0.0"/>
    <nd ref="11" lat="1.0" lon="1.0"/>
    <tag k="amenity" v="school"/>
  </way>
  <node id="oops" lat="1" lon="1"/>
  <relation id="4">
    <bounds minlat="10" minlon="10" maxlat="12" maxlon="14"/>
    <member type="way" ref="5" role="outer">
      <nd lat="10" lon="10"/>
      <nd lat="12" lon="12"/>
    </member>
    <tag k="amenity" v="hospital"/>
  </relation>
</osm>"#;

    const DIFF: &str = r#"<osm>
  <action type="modify">
    <old><node id="1" lat="1" lon="1" version="1"><tag k="name" v="A"/></node></old>
    <new><node id="1" lat="1" lon="1" version="2"><tag k="name" v="B"/></node></new>
  </action>
  <action type="create">
    <node id="2" lat="2" lon="2" version="1"/>
  </action>
  <action type="delete">
    <old><node id="3" lat="3" lon="3" version="4"/></old>
    <new><node id="3" visible="false" version="5"/></new>
  </action>
  <action type="modify">
    <old><node id="4" lat="4" lon="4"/></old>
    <new><node id="5" lat="4" lon="4"/></new>
  </action>
</osm>"#;

    #[test]
    fn decodes_snapshot_in_batches() {
        let mut decoder = FeedDecoder::new(SNAPSHOT.as_bytes());
        let first = decoder.next_entities(2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].tag("name"), Some("Café Am Markt"));
        assert!(!first[0].tags.contains_key(""));
        assert_eq!(first[0].meta.version, Some(2));
        assert_eq!(first[1].id, 2);

        let rest = decoder.next_entities(10).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].entity_type(), EntityType::Way);
        assert_eq!(rest[0].position, LatLon::new(0.5, 0.5));
        assert_eq!(rest[1].entity_type(), EntityType::Relation);
        assert_eq!(rest[1].position, LatLon::new(11.0, 11.0));
        assert_eq!(decoder.malformed(), 1);
        assert!(decoder.next_entities(10).unwrap().is_empty());
        assert!(decoder.is_finished());
    }

    #[test]
    fn decodes_diff_actions() {
        let mut decoder = FeedDecoder::new(DIFF.as_bytes());
        let diffs = decoder.next_diffs(10).unwrap();
        assert_eq!(diffs.len(), 3);
        assert_matches!(&diffs[0], DiffEntity::Modify { old, new } => {
            assert_eq!(old.tag("name"), Some("A"));
            assert_eq!(new.tag("name"), Some("B"));
        });
        assert_matches!(&diffs[1], DiffEntity::Create { new } => assert_eq!(new.id, 2));
        assert_matches!(&diffs[2], DiffEntity::Delete { old } => assert_eq!(old.id, 3));
        assert_eq!(decoder.malformed(), 1);
    }

    #[test]
    fn remark_is_an_upstream_error() {
        let body = r#"<osm><remark> runtime error: Query run out of memory using about 2048 MB of RAM. </remark></osm>"#;
        let err = FeedDecoder::new(body.as_bytes()).next_entities(5).unwrap_err();
        assert_matches!(err, OprError::UpstreamTooLarge(_));

        let body = r#"<osm><remark>runtime error: open64: 0 Success /osm3s_v0.7.61_osm_base Dispatcher_Client::request_read_and_idx::rate_limited</remark></osm>"#;
        let err = FeedDecoder::new(body.as_bytes()).next_entities(5).unwrap_err();
        assert_matches!(err, OprError::TransientNetwork(_));
    }

    #[test]
    fn count_response() {
        assert_eq!(parse_count("\n 1234\n".as_bytes()).unwrap(), 1234);
        assert_matches!(parse_count("".as_bytes()), Err(OprError::Decode(_)));
    }
}
