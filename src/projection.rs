//! # Projection module
//!
//! Maps caller coordinates onto the unit square `[0, 1]²` in which all
//! clustering distances are measured, and back again for presenting
//! centroids to callers.
//!
//! Geographic input uses a spherical-mercator projection; non-geographic
//! input is normalized linearly through a [`DataRange`].

use std::f64::consts::PI;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Coordinate system for clustering.
/// The coordinate system determines how raw point coordinates are projected
/// onto the unit square.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum CoordinateSystem {
    /// Longitude and latitude coordinates. Used for geo-spatial data.
    LatLng,

    /// Cartesian coordinates. Used for non-geospatial (i.e. microscopy, etc.) data.
    Cartesian {
        /// The range of the incoming data if choosing the cartesian coordinate system.
        range: DataRange,
    },
}

impl CoordinateSystem {
    /// Project raw coordinates onto the unit square.
    pub(crate) fn project(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            CoordinateSystem::LatLng => (longitude_to_unit_x(x), latitude_to_unit_y(y)),
            CoordinateSystem::Cartesian { range } => (range.normalize(x), range.normalize(y)),
        }
    }

    /// Map unit-square coordinates back to the caller's coordinate space.
    pub(crate) fn unproject(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            CoordinateSystem::LatLng => (unit_x_to_longitude(x), unit_y_to_latitude(y)),
            CoordinateSystem::Cartesian { range } => (range.denormalize(x), range.denormalize(y)),
        }
    }
}

/// Convert longitude to a unit-square X in the [0..1] range.
pub(crate) fn longitude_to_unit_x(lng: f64) -> f64 {
    lng / 360.0 + 0.5
}

/// Convert latitude to a unit-square Y in the [0..1] range.
/// Latitudes beyond the mercator singularity clamp to the square's edge.
pub(crate) fn latitude_to_unit_y(lat: f64) -> f64 {
    let sin = lat.to_radians().sin();
    let y = 0.5 - (0.25 * ((1.0 + sin) / (1.0 - sin)).ln()) / PI;

    y.clamp(0.0, 1.0)
}

/// Convert a unit-square X back to longitude.
pub(crate) fn unit_x_to_longitude(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

/// Convert a unit-square Y back to latitude.
pub(crate) fn unit_y_to_latitude(y: f64) -> f64 {
    let y2 = ((180.0 - y * 360.0) * PI) / 180.0;
    (360.0 * y2.exp().atan()) / PI - 90.0
}

/// A `[west, south, east, north]` viewport resolved against the
/// antimeridian.
pub(crate) enum BboxQuery {
    /// One projected unit-square box: `[min_x, min_y, max_x, max_y]`.
    Unit([f64; 4]),

    /// The viewport crosses the antimeridian; re-query these two
    /// geographic boxes and union the results.
    Split([f64; 4], [f64; 4]),
}

/// Resolve a geographic viewport into unit-square query boxes.
///
/// Longitudes are wrapped into [-180, 180], latitudes clamped to ±90. A box
/// spanning 360° or more covers the whole world; a box whose wrapped west
/// edge passes its east edge is split at the antimeridian.
pub(crate) fn resolve_latlng_bbox(bbox: [f64; 4]) -> BboxQuery {
    let mut min_lng = ((((bbox[0] + 180.0) % 360.0) + 360.0) % 360.0) - 180.0;
    let min_lat = bbox[1].clamp(-90.0, 90.0);
    let mut max_lng = if bbox[2] == 180.0 {
        180.0
    } else {
        ((((bbox[2] + 180.0) % 360.0) + 360.0) % 360.0) - 180.0
    };
    let max_lat = bbox[3].clamp(-90.0, 90.0);

    if bbox[2] - bbox[0] >= 360.0 {
        min_lng = -180.0;
        max_lng = 180.0;
    } else if min_lng > max_lng {
        return BboxQuery::Split(
            [min_lng, min_lat, 180.0, max_lat],
            [-180.0, min_lat, max_lng, max_lat],
        );
    }

    BboxQuery::Unit([
        longitude_to_unit_x(min_lng),
        latitude_to_unit_y(max_lat),
        longitude_to_unit_x(max_lng),
        latitude_to_unit_y(min_lat),
    ])
}

/// The range of the incoming data if choosing the cartesian coordinate system.
/// Applicable for non-geospatial data (i.e. microscopy, etc.).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct DataRange {
    /// The minimum x-coordinate value.
    pub min_x: f64,

    /// The minimum y-coordinate value.
    pub min_y: f64,

    /// The maximum x-coordinate value.
    pub max_x: f64,

    /// The maximum y-coordinate value.
    pub max_y: f64,

    /// The cached value for offset.
    pub offset: Option<f64>,

    /// The cached value for scale.
    pub scale: Option<f64>,
}

impl DataRange {
    /// Normalize the coordinate value to the range [0, 1].
    /// The formula is `(v - offset) / scale`.
    pub fn normalize(&self, v: f64) -> f64 {
        (v - self.offset()) / self.scale()
    }

    /// Denormalize the coordinate value from the range [0, 1] to the original range.
    /// The formula is `v_scaled * scale + offset`.
    pub fn denormalize(&self, v_scaled: f64) -> f64 {
        v_scaled * self.scale() + self.offset()
    }

    /// The offset applied before scaling.
    /// Falls back to the smaller of the two axis minima when not cached.
    fn offset(&self) -> f64 {
        self.offset
            .unwrap_or_else(|| f64::min(self.min_x, self.min_y))
    }

    /// The scale dividing the offset coordinates.
    /// Falls back to the span of the wider axis when not cached.
    fn scale(&self) -> f64 {
        self.scale
            .unwrap_or_else(|| f64::max(self.max_x, self.max_y) - self.offset())
    }
}

impl Default for DataRange {
    fn default() -> Self {
        Self {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 1.0,
            max_y: 1.0,
            offset: None,
            scale: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longitude_to_unit_x() {
        assert_eq!(longitude_to_unit_x(0.0), 0.5);
        assert_eq!(longitude_to_unit_x(180.0), 1.0);
        assert_eq!(longitude_to_unit_x(-180.0), 0.0);
        assert_eq!(longitude_to_unit_x(90.0), 0.75);
        assert_eq!(longitude_to_unit_x(-90.0), 0.25);
    }

    #[test]
    fn test_latitude_to_unit_y() {
        assert_eq!(latitude_to_unit_y(0.0), 0.5);
        assert_eq!(latitude_to_unit_y(90.0), 0.0);
        assert_eq!(latitude_to_unit_y(-90.0), 1.0);
        assert_eq!(latitude_to_unit_y(45.0), 0.35972503691520497);
        assert_eq!(latitude_to_unit_y(-45.0), 0.640274963084795);
    }

    #[test]
    fn test_unit_x_to_longitude() {
        assert_eq!(unit_x_to_longitude(0.5), 0.0);
        assert_eq!(unit_x_to_longitude(1.0), 180.0);
        assert_eq!(unit_x_to_longitude(0.0), -180.0);
        assert_eq!(unit_x_to_longitude(0.75), 90.0);
        assert_eq!(unit_x_to_longitude(0.25), -90.0);
    }

    #[test]
    fn test_unit_y_to_latitude() {
        assert_eq!(unit_y_to_latitude(0.5), 0.0);
        assert_eq!(unit_y_to_latitude(0.875), -79.17133464081944);
        assert_eq!(unit_y_to_latitude(0.125), 79.17133464081945);
    }

    #[test]
    fn test_round_trip_through_projection() {
        let system = CoordinateSystem::LatLng;
        let (x, y) = system.project(13.4, 52.5);
        let (lng, lat) = system.unproject(x, y);

        assert!((lng - 13.4).abs() < 1e-10);
        assert!((lat - 52.5).abs() < 1e-10);
    }

    #[test]
    fn test_data_range_default() {
        let data_range = DataRange::default();

        assert_eq!(data_range.min_x, 0.0);
        assert_eq!(data_range.min_y, 0.0);
        assert_eq!(data_range.max_x, 1.0);
        assert_eq!(data_range.max_y, 1.0);
    }

    #[test]
    fn test_data_range() {
        let data_range = DataRange {
            min_x: -10.0,
            max_x: 100.0,
            min_y: -20.0,
            max_y: 50.0,
            ..Default::default()
        };

        assert_eq!(data_range.normalize(-20.0), 0.0);
        assert_eq!(data_range.normalize(40.0), 0.5);
        assert_eq!(data_range.normalize(100.0), 1.0);

        assert_eq!(data_range.denormalize(0.0), -20.0);
        assert_eq!(data_range.denormalize(0.5), 40.0);
        assert_eq!(data_range.denormalize(1.0), 100.0);
    }

    #[test]
    fn test_cartesian_projection_uses_range() {
        let system = CoordinateSystem::Cartesian {
            range: DataRange {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 200.0,
                max_y: 100.0,
                ..Default::default()
            },
        };

        assert_eq!(system.project(100.0, 50.0), (0.5, 0.25));
        assert_eq!(system.unproject(0.5, 0.25), (100.0, 50.0));
    }
}
