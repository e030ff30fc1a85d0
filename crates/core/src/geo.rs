//! Geographic primitives (WGS84 decimal degrees).

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Approximate kilometres per degree of latitude.
pub const KM_PER_DEG_LAT: f64 = 111.0;

/// Approximate kilometres per degree of longitude at mid latitudes.
pub const KM_PER_DEG_LON: f64 = 85.0;

/// A point on the map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({:.5}, {:.5})", self.lat, self.lon)
    }
}

/// Axis-aligned region a target scans.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Build a validated box.
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> DomainResult<Self> {
        let bbox = Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Square-ish box of `radius_km` around a centre point.
    pub fn from_center(center: Position, radius_km: f64) -> DomainResult<Self> {
        if !(radius_km.is_finite() && radius_km > 0.0) {
            return Err(DomainError::validation("radius_km must be a positive number"));
        }
        let lat_delta = radius_km / KM_PER_DEG_LAT;
        let lon_delta = radius_km / KM_PER_DEG_LON;
        Self::new(
            (center.lat - lat_delta).max(-90.0),
            (center.lat + lat_delta).min(90.0),
            (center.lon - lon_delta).max(-180.0),
            (center.lon + lon_delta).min(180.0),
        )
    }

    pub fn validate(&self) -> DomainResult<()> {
        let corners = [
            Position::new(self.min_lat, self.min_lon),
            Position::new(self.max_lat, self.max_lon),
        ];
        if corners.iter().any(|p| !p.is_valid()) {
            return Err(DomainError::validation(format!(
                "bounding box out of range: {self:?}"
            )));
        }
        if self.min_lat > self.max_lat || self.min_lon > self.max_lon {
            return Err(DomainError::validation(format!(
                "bounding box min exceeds max: {self:?}"
            )));
        }
        Ok(())
    }

    pub fn center(&self) -> Position {
        Position::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    pub fn contains(&self, p: Position) -> bool {
        (self.min_lat..=self.max_lat).contains(&p.lat) && (self.min_lon..=self.max_lon).contains(&p.lon)
    }

    pub fn area_sq_km(&self) -> f64 {
        (self.max_lat - self.min_lat) * KM_PER_DEG_LAT * (self.max_lon - self.min_lon) * KM_PER_DEG_LON
    }
}
