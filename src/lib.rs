#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Geocluster
//!
//! Hierarchical point clustering for interactive map rendering.
//!
//! Given a set of points, geocluster produces, for every integer zoom level
//! in a configured range, the clusters and standalone points visible at that
//! zoom. Viewport queries return the markers to draw; drill-down queries
//! expand a cluster into its children or its original points.
//!
//! Two engines share the algorithmic core:
//!
//! - [`Geocluster`] is immutable and optimized for throughput: points are
//!   supplied once and the full hierarchy is precomputed into per-zoom
//!   KD-tree indices.
//! - [`MutableGeocluster`] supports adding and removing points after load,
//!   maintaining per-zoom R-tree indices incrementally.
//!
//! Both accept optional [aggregation callbacks](crate::Aggregation) that
//! fold per-point properties into per-cluster aggregates as clusters form
//! and merge.
//!
//! ## Usage
//!
//! ```rust
//! use geocluster::{Geocluster, GeoclusterError};
//!
//! fn main() -> Result<(), GeoclusterError> {
//!     let options = Geocluster::<(f64, f64)>::builder()
//!         .radius(40.0)
//!         .extent(512.0)
//!         .min_points(2)
//!         .max_zoom(16)
//!         .build();
//!
//!     let mut index: Geocluster<(f64, f64)> = Geocluster::new(options)?;
//!
//!     index.load(vec![(13.4, 52.5), (13.5, 52.5), (2.35, 48.86)])?;
//!
//!     for entry in index.search([-10.0, 40.0, 20.0, 60.0], 3)? {
//!         match entry {
//!             geocluster::Entry::Cluster(cluster) => {
//!                 println!("{} points near ({}, {})", cluster.num_points, cluster.x, cluster.y)
//!             }
//!             geocluster::Entry::Leaf(leaf) => println!("point at ({}, {})", leaf.x, leaf.y),
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Safety
//!
//! This crate uses `#![forbid(unsafe_code)]` to ensure everything is
//! implemented in 100% safe Rust.

/// Aggregation module.
/// This module contains the map/reduce aggregation protocol.
pub mod aggregate;

/// Builder module.
/// This module contains the builder pattern for the configuration settings.
pub mod builder;

/// Element module.
/// This module contains cluster identifiers, the point trait and query views.
pub mod element;

/// Error module.
/// This module contains the error types for the geocluster crate.
pub mod error;

/// Immutable engine module.
/// This module contains the precomputed clustering engine.
pub mod immutable;

/// KD-tree module.
/// This module contains the static spatial index.
pub mod kdtree;

/// Mutable engine module.
/// This module contains the incrementally maintained clustering engine.
pub mod mutable;

/// Projection module.
/// This module contains the coordinate projection onto the unit square.
pub mod projection;

/// R-tree module.
/// This module contains the dynamic spatial index.
pub(crate) mod rtree;

pub use aggregate::*;
pub use builder::*;
pub use element::*;
pub use error::*;
pub use immutable::*;
pub use kdtree::*;
pub use mutable::*;
pub use projection::{CoordinateSystem, DataRange};
