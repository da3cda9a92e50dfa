//! Geographic coordinates, bounding boxes and the projection seam.
//!
//! Projection math belongs to an external collaborator; this module only
//! defines the [`Projection`] trait that hit-testing consumes, plus a
//! trivial equirectangular implementation.

use serde::{Deserialize, Serialize};

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    /// Per-axis tolerance for content comparison (float round-trip noise).
    pub const EPSILON: f64 = 1e-7;

    pub fn new(lat: f64, lon: f64) -> Self {
        LatLon { lat, lon }
    }

    /// Compares both axes within [`LatLon::EPSILON`].
    pub fn equals_epsilon(&self, other: &LatLon) -> bool {
        (self.lat - other.lat).abs() <= Self::EPSILON
            && (self.lon - other.lon).abs() <= Self::EPSILON
    }

    /// Returns this coordinate shifted by the given offsets.
    pub fn offset(&self, dlat: f64, dlon: f64) -> LatLon {
        LatLon::new(self.lat + dlat, self.lon + dlon)
    }
}

/// Axis-aligned bounding box in degrees. Edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BBox {
    /// Builds a box from two arbitrary corners.
    pub fn new(a: LatLon, b: LatLon) -> Self {
        BBox {
            min_lat: a.lat.min(b.lat),
            min_lon: a.lon.min(b.lon),
            max_lat: a.lat.max(b.lat),
            max_lon: a.lon.max(b.lon),
        }
    }

    /// Degenerate box around a single coordinate.
    pub fn from_point(p: LatLon) -> Self {
        BBox::new(p, p)
    }

    pub fn extend(&mut self, p: LatLon) {
        self.min_lat = self.min_lat.min(p.lat);
        self.min_lon = self.min_lon.min(p.lon);
        self.max_lat = self.max_lat.max(p.lat);
        self.max_lon = self.max_lon.max(p.lon);
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            min_lat: self.min_lat.min(other.min_lat),
            min_lon: self.min_lon.min(other.min_lon),
            max_lat: self.max_lat.max(other.max_lat),
            max_lon: self.max_lon.max(other.max_lon),
        }
    }

    pub fn contains(&self, p: LatLon) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lon >= self.min_lon && p.lon <= self.max_lon
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
            && self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
    }
}

/// A planar working coordinate produced by a [`Projection`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EastNorth {
    pub east: f64,
    pub north: f64,
}

impl EastNorth {
    pub fn distance(&self, other: &EastNorth) -> f64 {
        (self.east - other.east).hypot(self.north - other.north)
    }
}

/// Converts geographic coordinates to the planar working system.
pub trait Projection: Send + Sync {
    fn project(&self, p: LatLon) -> EastNorth;
}

/// Plate carree: east = lon, north = lat. Good enough for tests and tools
/// that only need a monotone planar mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct Equirectangular;

impl Projection for Equirectangular {
    fn project(&self, p: LatLon) -> EastNorth {
        EastNorth {
            east: p.lon,
            north: p.lat,
        }
    }
}
