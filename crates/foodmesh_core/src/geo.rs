//! Fixed-level grid cells over an equirectangular subdivision of the globe.
//!
//! A cell id packs (level, row, col) into 64 bits. At level L the grid is
//! 2^L rows by 2^L columns, so one column spans roughly 40075 km / 2^L at
//! the equator. Two levels are used throughout:
//!
//! - level 15 (~1.2 km cells) for dispatch clustering, where a cell must
//!   approximate the area a courier can cover without a meaningful detour;
//! - level 18 (~150 m cells) for the recipient index, where radius queries
//!   need fine covering sets.

use serde::{Deserialize, Serialize};

/// Cluster level for the dispatch engine (~1 km² cells).
pub const DISPATCH_CELL_LEVEL: u8 = 15;

/// Index level for recipient locations (~150 m cells).
pub const RECIPIENT_CELL_LEVEL: u8 = 18;

const EARTH_RADIUS_KM: f64 = 6371.0;
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// A geographic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// 64-bit grid cell identifier: 6 bits of level, 29 bits each of row and
/// column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub u64);

impl CellId {
    const COORD_BITS: u64 = 29;
    const COORD_MASK: u64 = (1 << Self::COORD_BITS) - 1;

    pub fn from_point(point: GeoPoint, level: u8) -> Self {
        let dim = 1u64 << level;
        let row = grid_index(point.lat, -90.0, 180.0, dim);
        let col = grid_index(point.lon, -180.0, 360.0, dim);
        Self::pack(level, row, col)
    }

    fn pack(level: u8, row: u64, col: u64) -> Self {
        CellId(((level as u64) << (2 * Self::COORD_BITS)) | (row << Self::COORD_BITS) | col)
    }

    pub fn level(&self) -> u8 {
        (self.0 >> (2 * Self::COORD_BITS)) as u8
    }

    fn row(&self) -> u64 {
        (self.0 >> Self::COORD_BITS) & Self::COORD_MASK
    }

    fn col(&self) -> u64 {
        self.0 & Self::COORD_MASK
    }

    /// The up-to-eight adjacent cells at the same level. Rows clamp at the
    /// poles; columns wrap across the antimeridian.
    pub fn neighbors(&self) -> Vec<CellId> {
        let level = self.level();
        let dim = 1u64 << level;
        let (row, col) = (self.row() as i64, self.col() as i64);
        let mut out = Vec::with_capacity(8);
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let r = row + dr;
                if r < 0 || r >= dim as i64 {
                    continue;
                }
                let c = (col + dc).rem_euclid(dim as i64);
                out.push(Self::pack(level, r as u64, c as u64));
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

fn grid_index(value: f64, origin: f64, span: f64, dim: u64) -> u64 {
    let frac = ((value - origin) / span).clamp(0.0, 1.0);
    ((frac * dim as f64) as u64).min(dim - 1)
}

/// All cells at `level` intersecting the circle of `radius_m` around
/// `center`. A zero radius returns exactly the containing cell.
pub fn cells_covering(center: GeoPoint, radius_m: f64, level: u8) -> Vec<CellId> {
    if radius_m <= 0.0 {
        return vec![CellId::from_point(center, level)];
    }
    let dlat = radius_m / METERS_PER_DEGREE_LAT;
    let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
    let dlon = radius_m / (METERS_PER_DEGREE_LAT * cos_lat);

    let dim = 1u64 << level;
    let lat_lo = (center.lat - dlat).max(-90.0);
    let lat_hi = (center.lat + dlat).min(90.0);
    let row_lo = grid_index(lat_lo, -90.0, 180.0, dim);
    let row_hi = grid_index(lat_hi, -90.0, 180.0, dim);

    let col_lo = grid_index(center.lon - dlon, -180.0, 360.0, dim) as i64;
    let col_hi = grid_index(center.lon + dlon, -180.0, 360.0, dim) as i64;

    let mut cells = Vec::new();
    for row in row_lo..=row_hi {
        for col in col_lo..=col_hi {
            let c = col.rem_euclid(dim as i64) as u64;
            cells.push(CellId::pack(level, row, c));
        }
    }
    cells.sort();
    cells.dedup();
    cells
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    haversine_km(a, b) * 1000.0
}

/// Arithmetic centroid of a point set. Callers guarantee non-empty input.
pub fn centroid(points: &[GeoPoint]) -> GeoPoint {
    let n = points.len() as f64;
    GeoPoint {
        lat: points.iter().map(|p| p.lat).sum::<f64>() / n,
        lon: points.iter().map(|p| p.lon).sum::<f64>() / n,
    }
}
