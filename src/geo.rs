use crate::domain::{BBox, LatLon};

/// Haversine radius used by the place tooling, in kilometres.
const EARTH_RADIUS_KM: f64 = 6372.8;

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub const TILE_CODE_LENGTH: usize = 6;

/// Great-circle distance in metres.
pub fn distance_m(a: LatLon, b: LatLon) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * 1000.0 * h.sqrt().asin()
}

pub fn geohash(point: LatLon, length: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut code = String::with_capacity(length);
    let mut even = true;
    let mut bit = 0u8;
    let mut index = 0usize;
    while code.len() < length {
        let (range, value) = if even {
            (&mut lon_range, point.lon)
        } else {
            (&mut lat_range, point.lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        if value >= mid {
            index = (index << 1) | 1;
            range.0 = mid;
        } else {
            index <<= 1;
            range.1 = mid;
        }
        even = !even;
        bit += 1;
        if bit == 5 {
            code.push(GEOHASH_ALPHABET[index] as char);
            bit = 0;
            index = 0;
        }
    }
    code
}

/// Tile code forming the first half of a place id.
pub fn tile_code(point: LatLon) -> String {
    geohash(point, TILE_CODE_LENGTH)
}

pub fn centroid(points: &[LatLon]) -> Option<LatLon> {
    if points.is_empty() {
        return None;
    }
    let count = points.len() as f64;
    let lat = points.iter().map(|p| p.lat).sum::<f64>() / count;
    let lon = points.iter().map(|p| p.lon).sum::<f64>() / count;
    Some(LatLon::new(lat, lon))
}

/// Grid shape used when a box is too large for one request: full-width boxes
/// get 8 columns, full-height boxes 4 rows, anything else halves.
pub fn split_factors(bbox: &BBox) -> (usize, usize) {
    let columns = if bbox.spans_full_width() { 8 } else { 2 };
    let rows = if bbox.spans_full_height() { 4 } else { 2 };
    (columns, rows)
}

/// Splits `bbox` into `columns x rows` cells. Neighbouring cells share their
/// edge exactly and the outer edges are the parent's.
pub fn split_grid(bbox: &BBox, columns: usize, rows: usize) -> Vec<BBox> {
    let columns = columns.max(1);
    let rows = rows.max(1);
    let lon_edge = |i: usize| {
        if i == columns {
            bbox.max_lon
        } else {
            bbox.min_lon + bbox.width() * i as f64 / columns as f64
        }
    };
    let lat_edge = |j: usize| {
        if j == rows {
            bbox.max_lat
        } else {
            bbox.min_lat + bbox.height() * j as f64 / rows as f64
        }
    };
    let mut cells = Vec::with_capacity(columns * rows);
    for i in 0..columns {
        for j in 0..rows {
            cells.push(BBox {
                min_lat: lat_edge(j),
                min_lon: lon_edge(i),
                max_lat: lat_edge(j + 1),
                max_lon: lon_edge(i + 1),
            });
        }
    }
    cells
}
