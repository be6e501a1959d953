//! Tile index and spherical-Mercator math, plus the polynomial fits used to
//! score control points.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::WarpError;

pub const EARTH_RADIUS_M: f64 = 6_378_137.0;
pub const TILE_SIZE: u32 = 256;
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;
pub const MAX_TILE_ZOOM: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.max_x > self.min_x
            && self.max_y > self.min_y
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    /// `minx,miny,maxx,maxy`, the layout of the WMS `BBOX` parameter.
    pub fn to_param(&self) -> String {
        format!("{},{},{},{}", self.min_x, self.min_y, self.max_x, self.max_y)
    }

    pub fn parse_param(raw: &str) -> Result<Self, WarpError> {
        let values: Vec<f64> = raw
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| WarpError::invalid(format!("invalid BBOX: {raw}")))?;
        let [min_x, min_y, max_x, max_y] = values[..] else {
            return Err(WarpError::invalid(format!("BBOX needs 4 values: {raw}")));
        };
        let bbox = Self::new(min_x, min_y, max_x, max_y);
        if !bbox.is_valid() {
            return Err(WarpError::invalid(format!("degenerate BBOX: {raw}")));
        }
        Ok(bbox)
    }
}

/// Tile address in the Google/OSM scheme (origin top-left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Result<Self, WarpError> {
        if z > MAX_TILE_ZOOM {
            return Err(WarpError::invalid(format!("zoom {z} out of range")));
        }
        let n = 1_u64 << z;
        if u64::from(x) >= n || u64::from(y) >= n {
            return Err(WarpError::invalid(format!(
                "tile {x}/{y} out of range at zoom {z}"
            )));
        }
        Ok(Self { z, x, y })
    }

    /// Row index counted from the bottom, as stored in MBTiles.
    pub fn tms_row(&self) -> u32 {
        let n = 1_u64 << self.z;
        (n - 1 - u64::from(self.y)) as u32
    }

    pub fn mercator_bounds(&self) -> BoundingBox {
        let res = mercator_resolution(self.z);
        let row = u64::from(self.tms_row());
        let col = u64::from(self.x);
        let size = u64::from(TILE_SIZE);
        BoundingBox::new(
            pixels_to_meters((col * size) as f64, res),
            pixels_to_meters((row * size) as f64, res),
            pixels_to_meters(((col + 1) * size) as f64, res),
            pixels_to_meters(((row + 1) * size) as f64, res),
        )
    }
}

pub fn mercator_resolution(z: u32) -> f64 {
    2.0 * PI * EARTH_RADIUS_M / (f64::from(TILE_SIZE) * 2_f64.powi(z as i32))
}

pub fn pixels_to_meters(px: f64, resolution: f64) -> f64 {
    px * resolution - PI * EARTH_RADIUS_M
}

/// Inclusive XYZ column/row range covering a WGS84 box at zoom `z`.
pub fn tile_range(bounds: &BoundingBox, z: u32) -> (u32, u32, u32, u32) {
    let n = 2_f64.powi(z as i32);
    let x_min = lng_to_x(bounds.min_x, n);
    let x_max = lng_to_x(bounds.max_x, n);
    let y_min = lat_to_y(bounds.max_y, n);
    let y_max = lat_to_y(bounds.min_y, n);
    (
        x_min.min(x_max),
        x_min.max(x_max),
        y_min.min(y_max),
        y_min.max(y_max),
    )
}

pub fn tile_count(bounds: &BoundingBox, z: u32) -> u64 {
    let (x0, x1, y0, y1) = tile_range(bounds, z);
    u64::from(x1 - x0 + 1) * u64::from(y1 - y0 + 1)
}

fn lng_to_x(lng: f64, n: f64) -> u32 {
    let x = ((lng.clamp(-180.0, 180.0) + 180.0) / 360.0) * n;
    x.floor().clamp(0.0, n - 1.0) as u32
}

fn lat_to_y(lat: f64, n: f64) -> u32 {
    let lat_rad = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0 * n;
    y.floor().clamp(0.0, n - 1.0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitKind {
    Polynomial(u8),
    ThinPlateSpline,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPair {
    pub pixel: [f64; 2],
    pub geo: [f64; 2],
}

/// Least-squares polynomial mapping pixel space onto geo space.
#[derive(Debug, Clone)]
pub struct PolynomialFit {
    order: u8,
    center: [f64; 2],
    scale: f64,
    coeffs_x: Vec<f64>,
    coeffs_y: Vec<f64>,
}

pub fn term_count(order: u8) -> usize {
    let n = usize::from(order);
    (n + 1) * (n + 2) / 2
}

fn monomials(order: u8, u: f64, v: f64) -> Vec<f64> {
    let mut terms = Vec::with_capacity(term_count(order));
    for degree in 0..=i32::from(order) {
        for j in 0..=degree {
            terms.push(u.powi(degree - j) * v.powi(j));
        }
    }
    terms
}

impl PolynomialFit {
    /// Returns `None` when the points cannot determine every coefficient.
    pub fn fit(order: u8, pairs: &[ControlPair]) -> Option<Self> {
        let order = order.clamp(1, 3);
        let terms = term_count(order);
        if pairs.len() < terms {
            return None;
        }

        let count = pairs.len() as f64;
        let cx = pairs.iter().map(|p| p.pixel[0]).sum::<f64>() / count;
        let cy = pairs.iter().map(|p| p.pixel[1]).sum::<f64>() / count;
        let spread = pairs
            .iter()
            .map(|p| (p.pixel[0] - cx).abs().max((p.pixel[1] - cy).abs()))
            .fold(0.0_f64, f64::max);
        let scale = if spread > 0.0 { spread } else { 1.0 };

        let mut design = Vec::with_capacity(pairs.len() * terms);
        let mut targets = Vec::with_capacity(pairs.len() * 2);
        for pair in pairs {
            let u = (pair.pixel[0] - cx) / scale;
            let v = (pair.pixel[1] - cy) / scale;
            design.extend(monomials(order, u, v));
            targets.push(pair.geo[0]);
            targets.push(pair.geo[1]);
        }
        let a = DMatrix::from_row_slice(pairs.len(), terms, &design);
        let b = DMatrix::from_row_slice(pairs.len(), 2, &targets);

        let svd = a.svd(true, true);
        let max_sv = svd.singular_values.max();
        if !max_sv.is_finite() || max_sv <= 0.0 {
            return None;
        }
        let eps = max_sv * 1e-10;
        if svd.rank(eps) < terms {
            return None;
        }
        let solution = svd.solve(&b, eps).ok()?;

        Some(Self {
            order,
            center: [cx, cy],
            scale,
            coeffs_x: solution.column(0).iter().copied().collect(),
            coeffs_y: solution.column(1).iter().copied().collect(),
        })
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn evaluate(&self, pixel: [f64; 2]) -> [f64; 2] {
        let u = (pixel[0] - self.center[0]) / self.scale;
        let v = (pixel[1] - self.center[1]) / self.scale;
        let terms = monomials(self.order, u, v);
        let x = terms.iter().zip(&self.coeffs_x).map(|(t, c)| t * c).sum();
        let y = terms.iter().zip(&self.coeffs_y).map(|(t, c)| t * c).sum();
        [x, y]
    }
}
