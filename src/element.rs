//! # Element module
//!
//! The public face of layer elements: stable cluster identifiers, the
//! coordinate-extractor trait for caller points, and the tagged views
//! returned by queries.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Width of the zoom field inside a packed cluster identifier.
const ID_ZOOM_BITS: u32 = 5;

/// Mask extracting the zoom field from a packed cluster identifier.
const ID_ZOOM_MASK: u128 = (1 << ID_ZOOM_BITS) - 1;

/// Stable identifier of a cluster.
///
/// Identifiers are opaque: the only guarantees are that an identifier stays
/// fixed while its cluster exists and that distinct clusters within one
/// engine carry distinct identifiers. The immutable engine derives them from
/// the cluster's position in the layer stack; the mutable engine generates
/// them, so they survive arbitrary restructuring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct ClusterId(u128);

impl ClusterId {
    /// Pack an element index and the zoom of the layer holding the
    /// cluster's children into a dense identifier.
    pub(crate) fn pack(index: usize, origin_zoom: u8) -> Self {
        ClusterId(((index as u128) << ID_ZOOM_BITS) | (origin_zoom as u128 & ID_ZOOM_MASK))
    }

    /// The element index encoded in a packed identifier.
    pub(crate) fn origin_index(self) -> usize {
        (self.0 >> ID_ZOOM_BITS) as usize
    }

    /// The zoom of the layer holding the cluster's children, as encoded in
    /// a packed identifier.
    pub(crate) fn origin_zoom(self) -> u8 {
        (self.0 & ID_ZOOM_MASK) as u8
    }

    /// Wrap an opaque generated identifier.
    pub(crate) fn from_uuid(uuid: Uuid) -> Self {
        ClusterId(uuid.as_u128())
    }
}

/// Coordinate extractors for caller-owned points.
///
/// `x` and `y` return the raw coordinates the configured
/// [`CoordinateSystem`](crate::CoordinateSystem) projects onto the unit
/// square: longitude/latitude for `LatLng`, plain coordinates for
/// `Cartesian`.
pub trait ClusterPoint {
    /// The point's X coordinate (longitude for geographic data).
    fn x(&self) -> f64;

    /// The point's Y coordinate (latitude for geographic data).
    fn y(&self) -> f64;
}

impl ClusterPoint for (f64, f64) {
    fn x(&self) -> f64 {
        self.0
    }

    fn y(&self) -> f64 {
        self.1
    }
}

impl ClusterPoint for [f64; 2] {
    fn x(&self) -> f64 {
        self[0]
    }

    fn y(&self) -> f64 {
        self[1]
    }
}

/// One element of a queried layer: either an aggregated cluster or a point
/// that stands alone at the queried zoom.
#[derive(Debug)]
pub enum Entry<'a, P, A, D> {
    /// An aggregation of two or more nearby points.
    Cluster(ClusterEntry<'a, A, D>),

    /// An original input point, unabsorbed at the queried zoom.
    Leaf(LeafEntry<'a, P>),
}

impl<'a, P, A, D> Entry<'a, P, A, D> {
    /// The number of original points this entry represents.
    pub fn num_points(&self) -> u32 {
        match self {
            Entry::Cluster(cluster) => cluster.num_points,
            Entry::Leaf(_) => 1,
        }
    }

    /// The cluster view, if this entry is a cluster.
    pub fn as_cluster(&self) -> Option<&ClusterEntry<'a, A, D>> {
        match self {
            Entry::Cluster(cluster) => Some(cluster),
            Entry::Leaf(_) => None,
        }
    }

    /// The leaf view, if this entry is a standalone point.
    pub fn as_leaf(&self) -> Option<&LeafEntry<'a, P>> {
        match self {
            Entry::Cluster(_) => None,
            Entry::Leaf(leaf) => Some(leaf),
        }
    }
}

/// A cluster as returned by queries.
#[derive(Debug)]
pub struct ClusterEntry<'a, A, D> {
    /// Stable identifier of the cluster.
    pub id: ClusterId,

    /// Centroid X in the caller's coordinate space.
    pub x: f64,

    /// Centroid Y in the caller's coordinate space.
    pub y: f64,

    /// The number of original points aggregated under this cluster.
    pub num_points: u32,

    /// The map/reduce aggregate, when that channel is configured.
    pub aggregate: Option<&'a A>,

    /// The monoid-style payload, when that channel is configured.
    pub data: Option<&'a D>,
}

/// A standalone point as returned by queries.
#[derive(Debug)]
pub struct LeafEntry<'a, P> {
    /// The original caller-owned point.
    pub point: &'a P,

    /// The point's X coordinate, as the caller supplied it.
    pub x: f64,

    /// The point's Y coordinate, as the caller supplied it.
    pub y: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_id_round_trip() {
        let id = ClusterId::pack(3, 4);

        assert_eq!(id.origin_index(), 3);
        assert_eq!(id.origin_zoom(), 4);
    }

    #[test]
    fn test_packed_ids_are_distinct() {
        assert_ne!(ClusterId::pack(0, 1), ClusterId::pack(1, 1));
        assert_ne!(ClusterId::pack(0, 1), ClusterId::pack(0, 2));
    }

    #[test]
    fn test_generated_id_round_trip() {
        let uuid = Uuid::new_v4();

        assert_eq!(ClusterId::from_uuid(uuid), ClusterId::from_uuid(uuid));
    }

    #[test]
    fn test_cluster_point_impls() {
        let tuple = (13.4, 52.5);
        assert_eq!(tuple.x(), 13.4);
        assert_eq!(tuple.y(), 52.5);

        let array = [13.4, 52.5];
        assert_eq!(array.x(), 13.4);
        assert_eq!(array.y(), 52.5);
    }
}
