//! # Builder module
//!
//! This module contains the builder pattern for the geocluster configuration settings.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{CoordinateSystem, GeoclusterError};

/// Zooms above this cannot be represented: the packed cluster identifier
/// reserves five bits for `zoom + 1`, and `2^zoom` must stay exact in f64.
pub(crate) const MAX_SUPPORTED_ZOOM: u8 = 30;

/// Geocluster configuration options.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct GeoclusterOptions {
    /// Minimal zoom level to generate clusters on.
    /// The default value is 0.
    pub min_zoom: u8,

    /// Maximal zoom level to cluster the points on.
    /// The default value is 16.
    pub max_zoom: u8,

    /// Minimum combined point count required to form a cluster.
    /// The default value is 2.
    pub min_points: u32,

    /// Cluster radius, in pixels.
    /// The default value is 40.0.
    pub radius: f64,

    /// Tile extent (radius is calculated relative to it).
    /// The default value is 512.0.
    pub extent: f64,

    /// Size of the KD-tree leaf node, affects performance.
    /// The default value is 64.
    pub node_size: usize,

    /// Type of coordinate system for clustering.
    /// The default value is `CoordinateSystem::LatLng`.
    pub coordinate_system: CoordinateSystem,
}

impl GeoclusterOptions {
    /// Check the options for values the engines cannot work with.
    ///
    /// # Errors
    ///
    /// Returns the matching `GeoclusterError` for a non-positive or
    /// non-finite radius or extent, a zero `min_points`, or an inverted or
    /// oversized zoom range.
    pub fn validate(&self) -> Result<(), GeoclusterError> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(GeoclusterError::InvalidRadius);
        }

        if !(self.extent.is_finite() && self.extent > 0.0) {
            return Err(GeoclusterError::InvalidExtent);
        }

        if self.min_points < 1 {
            return Err(GeoclusterError::InvalidMinPoints);
        }

        if self.min_zoom > self.max_zoom || self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(GeoclusterError::InvalidZoomRange);
        }

        Ok(())
    }

    /// The inclusion radius at the given zoom, in unit-square units.
    pub(crate) fn radius_at(&self, zoom: u8) -> f64 {
        self.radius / (self.extent * (2.0_f64).powi(zoom as i32))
    }
}

impl Default for GeoclusterOptions {
    fn default() -> Self {
        GeoclusterBuilder::new().build()
    }
}

/// Geocluster configuration options builder.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct GeoclusterBuilder {
    /// Minimal zoom level to generate clusters on.
    min_zoom: Option<u8>,

    /// Maximal zoom level to cluster the points on.
    max_zoom: Option<u8>,

    /// Minimum combined point count required to form a cluster.
    min_points: Option<u32>,

    /// Cluster radius, in pixels.
    radius: Option<f64>,

    /// Tile extent (radius is calculated relative to it).
    extent: Option<f64>,

    /// Size of the KD-tree leaf node, affects performance.
    node_size: Option<usize>,

    /// Type of coordinate system for clustering.
    coordinate_system: Option<CoordinateSystem>,
}

impl GeoclusterBuilder {
    /// Create a new geocluster options builder to set the options.
    pub fn new() -> Self {
        GeoclusterBuilder::default()
    }

    /// Set the minimal zoom level to generate clusters on.
    pub fn min_zoom(mut self, min_zoom: u8) -> Self {
        self.min_zoom = Some(min_zoom);
        self
    }

    /// Set the maximal zoom level to cluster the points on.
    pub fn max_zoom(mut self, max_zoom: u8) -> Self {
        self.max_zoom = Some(max_zoom);
        self
    }

    /// Set the minimum combined point count required to form a cluster.
    pub fn min_points(mut self, min_points: u32) -> Self {
        self.min_points = Some(min_points);
        self
    }

    /// Set the cluster radius in pixels.
    pub fn radius(mut self, radius: f64) -> Self {
        self.radius = Some(radius);
        self
    }

    /// Set the tile extent (radius is calculated relative to it).
    pub fn extent(mut self, extent: f64) -> Self {
        self.extent = Some(extent);
        self
    }

    /// Set the size of the KD-tree leaf node, affects performance.
    pub fn node_size(mut self, node_size: usize) -> Self {
        self.node_size = Some(node_size);
        self
    }

    /// Set the type of coordinate system for clustering.
    pub fn coordinate_system(mut self, coordinate_system: CoordinateSystem) -> Self {
        self.coordinate_system = Some(coordinate_system);
        self
    }

    /// Build the geocluster options, applying defaults for unset fields.
    pub fn build(self) -> GeoclusterOptions {
        GeoclusterOptions {
            min_zoom: self.min_zoom.unwrap_or(0),
            max_zoom: self.max_zoom.unwrap_or(16),
            min_points: self.min_points.unwrap_or(2),
            radius: self.radius.unwrap_or(40.0),
            extent: self.extent.unwrap_or(512.0),
            node_size: self.node_size.unwrap_or(64),
            coordinate_system: self.coordinate_system.unwrap_or(CoordinateSystem::LatLng),
        }
    }
}
