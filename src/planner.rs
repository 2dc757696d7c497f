//! Adaptive splitting of snapshot queries that are too large for one request.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::BBox;
use crate::error::OprError;
use crate::geo;
use crate::overpass::{OverpassClient, OverpassQuery};

pub const DEFAULT_SPLIT_THRESHOLD: u64 = 20_000;
pub const DEFAULT_MAX_DEPTH: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSettings {
    pub threshold: u64,
    pub max_depth: u32,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// A box at some recursion level. `path` names the cell, e.g. `3.1.4`.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub bbox: BBox,
    pub depth: u32,
    pub path: String,
}

impl Region {
    pub fn root(bbox: BBox) -> Self {
        Self {
            bbox,
            depth: 0,
            path: String::new(),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}]", self.bbox)
        } else {
            write!(f, "{} [{}]", self.path, self.bbox)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// Nothing matches inside the region.
    Empty,
    /// Small enough for one request.
    Fetch(u64),
    Split(Vec<Region>),
}

#[derive(Debug, Clone, Copy)]
pub struct QueryPlanner {
    settings: SplitSettings,
}

impl QueryPlanner {
    pub fn new(settings: SplitSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> SplitSettings {
        self.settings
    }

    /// Grid cells of `region` one level down.
    pub fn split(&self, region: &Region) -> Result<Vec<Region>, OprError> {
        if region.depth >= self.settings.max_depth {
            return Err(OprError::SplitTooDeep {
                bbox: region.bbox.to_string(),
                max_depth: self.settings.max_depth,
            });
        }
        let (columns, rows) = geo::split_factors(&region.bbox);
        let cells = geo::split_grid(&region.bbox, columns, rows);
        debug!(region = %region, cells = cells.len(), "splitting region");
        Ok(cells
            .into_iter()
            .enumerate()
            .map(|(index, bbox)| Region {
                bbox,
                depth: region.depth + 1,
                path: if region.path.is_empty() {
                    (index + 1).to_string()
                } else {
                    format!("{}.{}", region.path, index + 1)
                },
            })
            .collect())
    }

    /// Asks for the size of `query` restricted to `region` and decides what
    /// to do with it. A probe the service cannot answer counts as oversized.
    pub fn probe<C>(
        &self,
        client: &C,
        query: &OverpassQuery,
        region: &Region,
    ) -> Result<Probe, OprError>
    where
        C: OverpassClient + ?Sized,
    {
        let count = match client.count(&query.with_bbox(region.bbox)) {
            Ok(count) => Some(count),
            Err(err) if err.is_split_trigger() => {
                debug!(region = %region, error = %err, "count probe failed");
                None
            }
            Err(err) => return Err(err),
        };
        match count {
            Some(0) => Ok(Probe::Empty),
            Some(count) if count < self.settings.threshold => {
                info!(region = %region, count, "region fits in one request");
                Ok(Probe::Fetch(count))
            }
            _ => Ok(Probe::Split(self.split(region)?)),
        }
    }

    /// Resolves the whole tree at once and returns the regions to fetch.
    pub fn leaves<C>(
        &self,
        client: &C,
        query: &OverpassQuery,
        root: Region,
    ) -> Result<Vec<Region>, OprError>
    where
        C: OverpassClient + ?Sized,
    {
        let mut pending = vec![root];
        let mut leaves = Vec::new();
        while let Some(region) = pending.pop() {
            match self.probe(client, query, &region)? {
                Probe::Empty => {}
                Probe::Fetch(_) => leaves.push(region),
                Probe::Split(children) => pending.extend(children.into_iter().rev()),
            }
        }
        Ok(leaves)
    }
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new(SplitSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn world_splits_into_eight_by_four() {
        let planner = QueryPlanner::default();
        let cells = planner.split(&Region::root(BBox::WORLD)).unwrap();
        assert_eq!(cells.len(), 32);
        assert!(cells.iter().all(|cell| cell.depth == 1));
        assert_eq!(cells[0].path, "1");

        let grandchildren = planner.split(&cells[4]).unwrap();
        assert_eq!(grandchildren.len(), 4);
        assert_eq!(grandchildren[3].path, "5.4");
    }

    #[test]
    fn split_union_rebuilds_parent() {
        let planner = QueryPlanner::default();
        let parent = Region::root("10,20,12.5,23.3".parse().unwrap());
        let cells = planner.split(&parent).unwrap();
        let min_lat = cells.iter().map(|c| c.bbox.min_lat).fold(f64::MAX, f64::min);
        let max_lat = cells.iter().map(|c| c.bbox.max_lat).fold(f64::MIN, f64::max);
        let min_lon = cells.iter().map(|c| c.bbox.min_lon).fold(f64::MAX, f64::min);
        let max_lon = cells.iter().map(|c| c.bbox.max_lon).fold(f64::MIN, f64::max);
        assert_eq!((min_lat, min_lon, max_lat, max_lon), (10.0, 20.0, 12.5, 23.3));
        let area: f64 = cells.iter().map(|c| c.bbox.width() * c.bbox.height()).sum();
        assert!((area - parent.bbox.width() * parent.bbox.height()).abs() < 1e-9);
    }

    #[test]
    fn split_beyond_max_depth_fails() {
        let planner = QueryPlanner::new(SplitSettings {
            threshold: 10,
            max_depth: 2,
        });
        let region = Region {
            bbox: "0,0,1,1".parse().unwrap(),
            depth: 2,
            path: "1.1".to_string(),
        };
        assert_matches!(
            planner.split(&region),
            Err(OprError::SplitTooDeep { max_depth: 2, .. })
        );
    }
}
