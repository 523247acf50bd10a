//! # Error module
//!
//! Contains the error type for the geocluster crate.

use thiserror::Error;

/// Geocluster error.
/// Represents the different errors that can occur in the geocluster crate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeoclusterError {
    /// The cluster radius must be a positive, finite number of pixels.
    #[error("Cluster radius must be a positive, finite number of pixels.")]
    InvalidRadius,

    /// The tile extent must be a positive, finite number of pixels.
    #[error("Tile extent must be a positive, finite number of pixels.")]
    InvalidExtent,

    /// At least one point is required to form a cluster.
    #[error("Minimum cluster size must be at least one point.")]
    InvalidMinPoints,

    /// The zoom range is inverted or exceeds the supported maximum.
    #[error("Zoom range must satisfy min_zoom <= max_zoom <= 30.")]
    InvalidZoomRange,

    /// A coordinate extractor produced a NaN or infinite value.
    #[error("Point coordinates must be finite.")]
    NonFiniteCoordinate,

    /// A query or mutation was issued before `load`.
    #[error("No points have been loaded into the index.")]
    NotLoaded,

    /// Cluster not found with the specified ID.
    #[error("Cluster not found with the specified ID.")]
    ClusterNotFound,

    /// Point not found in the index.
    #[error("Point not found in the index.")]
    PointNotFound,

    /// A point update changed the point's position.
    #[error("Point updates must keep the point's position; remove and re-add instead.")]
    PointMoved,

    /// Layer not found at the specified zoom level.
    #[error("Layer not found at the specified zoom level.")]
    LayerNotFound,
}
