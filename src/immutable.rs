//! # Immutable engine module
//!
//! The throughput-oriented clustering engine: points are supplied once at
//! `load`, and the full zoom hierarchy is precomputed into one KD-tree layer
//! per zoom.
//!
//! Layers are built finest to coarsest. Each pass walks the previous layer's
//! elements in insertion order, greedily absorbing unvisited neighbours
//! within the zoom's inclusion radius; surviving elements are promoted
//! unchanged. The iteration order derives from the caller's input order, so
//! two engines built from the same input produce identical layer stacks.

use std::{collections::HashMap, hash::BuildHasherDefault};

use twox_hash::XxHash64;

use crate::{
    projection::{resolve_latlng_bbox, BboxQuery},
    Aggregation, ClusterData, ClusterEntry, ClusterId, ClusterPoint, CoordinateSystem, Entry,
    GeoclusterBuilder, GeoclusterError, GeoclusterOptions, KdTree, LeafEntry,
};

/// Sentinel for an element that has not yet been visited by a clustering
/// pass; real values are at most `max_zoom + 1`.
const UNSET_ZOOM: u8 = u8::MAX;

/// One element of a precomputed layer.
#[derive(Clone, Debug)]
struct StaticElement<A, D> {
    /// Projected X of the element (centroid, for clusters).
    x: f64,

    /// Projected Y of the element (centroid, for clusters).
    y: f64,

    /// The number of original points this element represents.
    num_points: u32,

    /// The coarsest zoom at which this element still exists in its own
    /// right; `UNSET_ZOOM` until the element is consumed by a pass.
    lowest_zoom: u8,

    /// Identifier of the cluster that absorbed this element, if any.
    parent: Option<ClusterId>,

    /// Leaf or cluster payload.
    kind: StaticKind<A, D>,
}

/// Leaf-vs-cluster payload of a layer element.
#[derive(Clone, Debug)]
enum StaticKind<A, D> {
    /// An original input point, referenced by its stable input index.
    Leaf {
        /// Index into the loaded input sequence.
        point: usize,
    },

    /// An aggregation of two or more elements from the next finer layer.
    /// The packed identifier encodes the seeding element's position in the
    /// next finer layer, which doubles as the cluster's origin.
    Cluster {
        /// Stable identifier, packed from the seed position and zoom.
        id: ClusterId,

        /// Map/reduce aggregate, when configured.
        aggregate: Option<A>,

        /// Monoid-style payload, when configured.
        data: Option<D>,
    },
}

/// A precomputed per-zoom layer: elements plus a KD-tree over their
/// positions and the memoized inclusion radius for the zoom.
#[derive(Clone, Debug)]
struct StaticLayer<A, D> {
    /// Layer elements in iteration order.
    elements: Vec<StaticElement<A, D>>,

    /// Spatial index over the element positions; ids are element indices.
    tree: KdTree,

    /// Inclusion radius at this zoom, in unit-square units.
    r: f64,
}

/// The immutable hierarchical clustering engine.
///
/// Generic over the caller's point type `P` and the two optional aggregate
/// payload types: `A` for the map/reduce channel and `D` for the
/// monoid-style channel (both `()` when unused).
pub struct Geocluster<P, A = (), D = ()> {
    /// Configuration settings.
    options: GeoclusterOptions,

    /// Aggregation capability bundle.
    aggregation: Aggregation<P, A, D>,

    /// The loaded input points, borrowed into query results by index.
    points: Vec<P>,

    /// Map of layers keyed by zoom level.
    layers: HashMap<usize, StaticLayer<A, D>, BuildHasherDefault<XxHash64>>,

    /// Whether `load` has completed.
    loaded: bool,
}

impl<P, A, D> std::fmt::Debug for Geocluster<P, A, D>
where
    P: std::fmt::Debug,
    A: std::fmt::Debug,
    D: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geocluster")
            .field("options", &self.options)
            .field("points", &self.points)
            .field("layers", &self.layers)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl<P, A, D> Geocluster<P, A, D>
where
    P: ClusterPoint,
    A: Clone,
    D: ClusterData,
{
    /// Create a new geocluster options builder.
    pub fn builder() -> GeoclusterBuilder {
        GeoclusterBuilder::new()
    }

    /// Create an engine without aggregation.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidArgument`-family error when the options fail
    /// validation.
    pub fn new(options: GeoclusterOptions) -> Result<Self, GeoclusterError> {
        Self::with_aggregation(options, Aggregation::none())
    }

    /// Create an engine with the given aggregation capability bundle.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidArgument`-family error when the options fail
    /// validation.
    pub fn with_aggregation(
        options: GeoclusterOptions,
        aggregation: Aggregation<P, A, D>,
    ) -> Result<Self, GeoclusterError> {
        options.validate()?;

        #[cfg(feature = "log")]
        log::debug!("Creating a new immutable geocluster instance");

        Ok(Geocluster {
            options,
            aggregation,
            points: vec![],
            layers: HashMap::default(),
            loaded: false,
        })
    }

    /// Load the input points, performing clustering at every zoom level.
    ///
    /// Points are projected and indexed into a leaf layer at
    /// `max_zoom + 1`; each coarser layer is then clustered from the layer
    /// above it, producing the full hierarchy in one pass.
    ///
    /// # Errors
    ///
    /// Returns `NonFiniteCoordinate` when an extractor yields NaN or an
    /// infinity; the engine state is left untouched in that case.
    pub fn load(&mut self, points: Vec<P>) -> Result<&mut Self, GeoclusterError> {
        #[cfg(feature = "log")]
        log::debug!("Loading {} points into the immutable index", points.len());

        for point in &points {
            if !(point.x().is_finite() && point.y().is_finite()) {
                return Err(GeoclusterError::NonFiniteCoordinate);
            }
        }

        let min_zoom = self.options.min_zoom;
        let max_zoom = self.options.max_zoom;

        self.points = points;
        self.layers.clear();

        let leaves = self
            .points
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let (x, y) = self
                    .options
                    .coordinate_system
                    .project(point.x(), point.y());

                StaticElement {
                    x,
                    y,
                    num_points: 1,
                    lowest_zoom: UNSET_ZOOM,
                    parent: None,
                    kind: StaticKind::Leaf { point: i },
                }
            })
            .collect();

        let leaf_layer = self.create_layer(leaves, max_zoom + 1);
        self.layers.insert(max_zoom as usize + 1, leaf_layer);

        // Cluster points on max zoom, then cluster the results on the
        // previous zoom, etc., producing a cluster hierarchy across zooms.
        for zoom in (min_zoom..=max_zoom).rev() {
            let next_zoom = zoom as usize + 1;

            let (previous, current) = {
                let prev_layer = self
                    .layers
                    .get(&next_zoom)
                    .ok_or(GeoclusterError::LayerNotFound)?;

                self.cluster_pass(prev_layer, zoom)
            };

            self.layers
                .get_mut(&next_zoom)
                .ok_or(GeoclusterError::LayerNotFound)?
                .elements = previous;

            let layer = self.create_layer(current, zoom);
            self.layers.insert(zoom as usize, layer);
        }

        self.loaded = true;

        Ok(self)
    }

    /// Retrieve the elements visible in a bounding box at a zoom level.
    ///
    /// The box is `[west, south, east, north]` in the caller's coordinate
    /// space. For geographic data, longitudes are wrapped and a box crossing
    /// the antimeridian is split into two queries whose results are unioned.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load`.
    pub fn search(
        &self,
        bbox: [f64; 4],
        zoom: u8,
    ) -> Result<Vec<Entry<'_, P, A, D>>, GeoclusterError> {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        #[cfg(feature = "log")]
        log::debug!("Searching zoom {} within {:?}", zoom, bbox);

        let layer = self
            .layers
            .get(&self.limit_zoom(zoom))
            .ok_or(GeoclusterError::LayerNotFound)?;

        let ids = match &self.options.coordinate_system {
            CoordinateSystem::Cartesian { range } => layer.tree.range(
                range.normalize(bbox[0]),
                range.normalize(bbox[1]),
                range.normalize(bbox[2]),
                range.normalize(bbox[3]),
            ),
            CoordinateSystem::LatLng => match resolve_latlng_bbox(bbox) {
                BboxQuery::Unit(unit) => layer.tree.range(unit[0], unit[1], unit[2], unit[3]),
                BboxQuery::Split(eastern, western) => {
                    let mut eastern_hem = self.search(eastern, zoom)?;
                    let western_hem = self.search(western, zoom)?;

                    eastern_hem.extend(western_hem);

                    return Ok(eastern_hem);
                }
            },
        };

        let entries = ids
            .into_iter()
            .map(|id| self.entry_for(&layer.elements[id]))
            .collect();

        Ok(entries)
    }

    /// Retrieve the direct children of a cluster.
    ///
    /// # Errors
    ///
    /// Returns `ClusterNotFound` when the identifier does not refer to a
    /// cluster in this engine.
    pub fn get_children(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Vec<Entry<'_, P, A, D>>, GeoclusterError> {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        let origin_index = cluster_id.origin_index();
        let origin_zoom = cluster_id.origin_zoom();

        if origin_zoom == 0 || origin_zoom > self.options.max_zoom + 1 {
            return Err(GeoclusterError::ClusterNotFound);
        }

        let layer = self
            .layers
            .get(&(origin_zoom as usize))
            .ok_or(GeoclusterError::ClusterNotFound)?;

        if origin_index >= layer.elements.len() {
            #[cfg(feature = "log")]
            log::error!("Cluster not found for ID {:?}", cluster_id);

            return Err(GeoclusterError::ClusterNotFound);
        }

        // The cluster absorbed its children with the formation zoom's
        // radius, one layer below the children's layer.
        let r = self
            .layers
            .get(&(origin_zoom as usize - 1))
            .ok_or(GeoclusterError::ClusterNotFound)?
            .r;
        let origin = &layer.elements[origin_index];

        let ids = layer.tree.within(origin.x, origin.y, r);
        let mut children = vec![];

        for id in ids {
            let element = &layer.elements[id];

            if element.parent == Some(cluster_id) {
                children.push(self.entry_for(element));
            }
        }

        if children.is_empty() {
            return Err(GeoclusterError::ClusterNotFound);
        }

        Ok(children)
    }

    /// Retrieve the original points under a cluster, depth first, skipping
    /// `offset` leaves and returning at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns `ClusterNotFound` for an unknown identifier.
    pub fn get_leaves(
        &self,
        cluster_id: ClusterId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<&P>, GeoclusterError> {
        let mut leaves = vec![];
        self.append_leaves(&mut leaves, cluster_id, limit, offset, 0)?;

        Ok(leaves)
    }

    /// Determine the smallest zoom at which a cluster's children stop being
    /// clustered together.
    ///
    /// # Errors
    ///
    /// Returns `ClusterNotFound` for an unknown identifier.
    pub fn get_cluster_expansion_zoom(
        &self,
        cluster_id: ClusterId,
    ) -> Result<u8, GeoclusterError> {
        let mut cluster_id = cluster_id;
        let mut expansion_zoom = cluster_id
            .origin_zoom()
            .checked_sub(1)
            .ok_or(GeoclusterError::ClusterNotFound)? as usize;

        while expansion_zoom <= self.options.max_zoom as usize {
            let children = self.get_children(cluster_id)?;

            expansion_zoom += 1;

            if children.len() != 1 {
                break;
            }

            cluster_id = match &children[0] {
                Entry::Cluster(cluster) => cluster.id,
                Entry::Leaf(_) => break,
            };
        }

        Ok(expansion_zoom as u8)
    }

    /// The number of elements (leaves plus clusters) on the layer at the
    /// given zoom.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load`.
    pub fn points_at_zoom(&self, zoom: u8) -> Result<usize, GeoclusterError> {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        self.layers
            .get(&self.limit_zoom(zoom))
            .map(|layer| layer.elements.len())
            .ok_or(GeoclusterError::LayerNotFound)
    }

    /// The total number of loaded points.
    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Clamp a requested zoom into the range of built layers.
    fn limit_zoom(&self, zoom: u8) -> usize {
        zoom.max(self.options.min_zoom)
            .min(self.options.max_zoom + 1) as usize
    }

    /// Build the public view of one layer element.
    fn entry_for<'a>(&'a self, element: &'a StaticElement<A, D>) -> Entry<'a, P, A, D> {
        match &element.kind {
            StaticKind::Cluster {
                id,
                aggregate,
                data,
                ..
            } => {
                let (x, y) = self
                    .options
                    .coordinate_system
                    .unproject(element.x, element.y);

                Entry::Cluster(ClusterEntry {
                    id: *id,
                    x,
                    y,
                    num_points: element.num_points,
                    aggregate: aggregate.as_ref(),
                    data: data.as_ref(),
                })
            }
            StaticKind::Leaf { point } => {
                let point = &self.points[*point];

                Entry::Leaf(LeafEntry {
                    point,
                    x: point.x(),
                    y: point.y(),
                })
            }
        }
    }

    /// Index a batch of elements into a layer for the given zoom.
    fn create_layer(&self, elements: Vec<StaticElement<A, D>>, zoom: u8) -> StaticLayer<A, D> {
        let mut tree = KdTree::new(elements.len(), self.options.node_size);

        for element in &elements {
            tree.add_point(element.x, element.y);
        }

        tree.build_index();

        StaticLayer {
            elements,
            tree,
            r: self.options.radius_at(zoom),
        }
    }

    /// Cluster one layer from the layer above it.
    ///
    /// Returns the previous layer's elements with visit marks and parent
    /// links applied, and the new layer's elements in iteration order.
    fn cluster_pass(
        &self,
        prev: &StaticLayer<A, D>,
        zoom: u8,
    ) -> (Vec<StaticElement<A, D>>, Vec<StaticElement<A, D>>) {
        let r = self.options.radius_at(zoom);

        #[cfg(feature = "log")]
        log::debug!("Clustering {} elements at zoom {}", prev.elements.len(), zoom);

        let mut data = prev.elements.clone();
        let mut next = vec![];

        for i in 0..data.len() {
            // Skip elements already consumed by an earlier seed this pass.
            if data[i].lowest_zoom != UNSET_ZOOM {
                continue;
            }

            data[i].lowest_zoom = zoom + 1;

            let x = data[i].x;
            let y = data[i].y;

            let neighbor_ids = prev.tree.within(x, y, r);

            let origin_points = data[i].num_points;
            let mut num_points = origin_points;

            for &n in &neighbor_ids {
                if data[n].lowest_zoom == UNSET_ZOOM {
                    num_points += data[n].num_points;
                }
            }

            if num_points > origin_points && num_points >= self.options.min_points {
                let id = ClusterId::pack(i, zoom + 1);

                let mut wx = x * f64::from(origin_points);
                let mut wy = y * f64::from(origin_points);
                let (mut aggregate, mut cluster_data) = self.child_payloads(&data[i]);

                data[i].parent = Some(id);

                for &n in &neighbor_ids {
                    if data[n].lowest_zoom != UNSET_ZOOM {
                        continue;
                    }

                    data[n].lowest_zoom = zoom + 1;
                    data[n].parent = Some(id);

                    wx += data[n].x * f64::from(data[n].num_points);
                    wy += data[n].y * f64::from(data[n].num_points);

                    let (child_aggregate, child_data) = self.child_payloads(&data[n]);
                    self.aggregation
                        .reduce_into(&mut aggregate, child_aggregate.as_ref());
                    self.aggregation
                        .combine_into(&mut cluster_data, child_data.as_ref());
                }

                let total = f64::from(num_points);

                next.push(StaticElement {
                    x: wx / total,
                    y: wy / total,
                    num_points,
                    lowest_zoom: UNSET_ZOOM,
                    parent: None,
                    kind: StaticKind::Cluster {
                        id,
                        aggregate,
                        data: cluster_data,
                    },
                });
            } else {
                let mut promoted = data[i].clone();
                promoted.lowest_zoom = UNSET_ZOOM;
                next.push(promoted);

                if num_points > origin_points {
                    // Too few combined points for a cluster: carry the
                    // neighbours forward adjacently so the iteration order
                    // stays stable across layers.
                    for &n in &neighbor_ids {
                        if data[n].lowest_zoom != UNSET_ZOOM {
                            continue;
                        }

                        data[n].lowest_zoom = zoom + 1;

                        let mut carried = data[n].clone();
                        carried.lowest_zoom = UNSET_ZOOM;
                        next.push(carried);
                    }
                }
            }
        }

        (data, next)
    }

    /// The aggregate payloads one element contributes to a forming cluster:
    /// leaves are mapped on demand, clusters hand over their stored values.
    fn child_payloads(&self, element: &StaticElement<A, D>) -> (Option<A>, Option<D>) {
        match &element.kind {
            StaticKind::Leaf { point } => {
                let point = &self.points[*point];

                (
                    self.aggregation.map_point(point),
                    self.aggregation.extract_point(point),
                )
            }
            StaticKind::Cluster {
                aggregate, data, ..
            } => (aggregate.clone(), data.clone()),
        }
    }

    /// Collect leaves under a cluster, depth first, honouring limit and
    /// offset. Returns the updated skip count.
    fn append_leaves<'a>(
        &'a self,
        result: &mut Vec<&'a P>,
        cluster_id: ClusterId,
        limit: usize,
        offset: usize,
        mut skipped: usize,
    ) -> Result<usize, GeoclusterError> {
        let children = self.get_children(cluster_id)?;

        for child in children {
            if result.len() >= limit {
                break;
            }

            match child {
                Entry::Cluster(cluster) => {
                    if skipped + cluster.num_points as usize <= offset {
                        // Skip the whole cluster
                        skipped += cluster.num_points as usize;
                    } else {
                        // Enter the cluster
                        skipped = self.append_leaves(result, cluster.id, limit, offset, skipped)?;
                    }
                }
                Entry::Leaf(leaf) => {
                    if skipped < offset {
                        // Skip a single point
                        skipped += 1;
                    } else {
                        // Add a single point
                        result.push(leaf.point);
                    }
                }
            }
        }

        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_places() -> Vec<(f64, f64)> {
        vec![(1.5, 46.0), (0.9, 46.4), (19.0, 45.0)]
    }

    fn loaded_engine(points: Vec<(f64, f64)>) -> Geocluster<(f64, f64)> {
        let options = GeoclusterBuilder::new().build();
        let mut engine = Geocluster::new(options).unwrap();
        engine.load(points).unwrap();

        engine
    }

    #[test]
    fn test_query_before_load_fails() {
        let engine: Geocluster<(f64, f64)> =
            Geocluster::new(GeoclusterBuilder::new().build()).unwrap();

        assert_eq!(
            engine.search([-180.0, -90.0, 180.0, 90.0], 0).unwrap_err(),
            GeoclusterError::NotLoaded
        );
        assert_eq!(
            engine.points_at_zoom(0).unwrap_err(),
            GeoclusterError::NotLoaded
        );
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let options = GeoclusterBuilder::new().radius(-1.0).build();

        assert!(matches!(
            Geocluster::<(f64, f64)>::new(options),
            Err(GeoclusterError::InvalidRadius)
        ));
    }

    #[test]
    fn test_non_finite_points_leave_state_untouched() {
        let options = GeoclusterBuilder::new().build();
        let mut engine: Geocluster<(f64, f64)> = Geocluster::new(options).unwrap();

        assert_eq!(
            engine.load(vec![(0.0, 0.0), (f64::NAN, 1.0)]).unwrap_err(),
            GeoclusterError::NonFiniteCoordinate
        );
        assert_eq!(
            engine.search([-1.0, -1.0, 1.0, 1.0], 0).unwrap_err(),
            GeoclusterError::NotLoaded
        );
    }

    #[test]
    fn test_two_nearby_points_cluster_and_one_stays_alone() {
        let engine = loaded_engine(three_places());

        let entries = engine.search([0.0, 40.0, 20.0, 50.0], 5).unwrap();

        let clusters: Vec<_> = entries.iter().filter_map(|e| e.as_cluster()).collect();
        let leaves: Vec<_> = entries.iter().filter_map(|e| e.as_leaf()).collect();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].num_points, 2);
        assert!((clusters[0].x - 1.2).abs() < 0.1);
        assert!((clusters[0].y - 46.2).abs() < 0.1);

        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].point, &(19.0, 45.0));
    }

    #[test]
    fn test_layer_point_totals_are_conserved() {
        let engine = loaded_engine(three_places());

        for zoom in 0..=17 {
            let entries = engine.search([-180.0, -90.0, 180.0, 90.0], zoom).unwrap();
            let total: u32 = entries.iter().map(|e| e.num_points()).sum();

            assert_eq!(total, 3, "zoom {zoom}");
        }
    }

    #[test]
    fn test_children_of_a_cluster() {
        let engine = loaded_engine(three_places());

        let entries = engine.search([0.0, 40.0, 20.0, 50.0], 5).unwrap();
        let cluster = entries
            .iter()
            .find_map(|e| e.as_cluster())
            .expect("expected one cluster");

        let children = engine.get_children(cluster.id).unwrap();

        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|child| child.as_leaf().is_some()));
    }

    #[test]
    fn test_unknown_cluster_id_is_not_found() {
        let engine = loaded_engine(three_places());

        assert_eq!(
            engine.get_children(ClusterId::pack(9999, 3)).unwrap_err(),
            GeoclusterError::ClusterNotFound
        );
        assert_eq!(
            engine.get_leaves(ClusterId::pack(9999, 3), 10, 0).unwrap_err(),
            GeoclusterError::ClusterNotFound
        );
        assert_eq!(
            engine
                .get_cluster_expansion_zoom(ClusterId::pack(9999, 3))
                .unwrap_err(),
            GeoclusterError::ClusterNotFound
        );
    }

    #[test]
    fn test_coincident_points_cluster_at_every_zoom() {
        let engine = loaded_engine(vec![(7.0, 7.0), (7.0, 7.0)]);

        for zoom in 0..=16 {
            let entries = engine.search([6.0, 6.0, 8.0, 8.0], zoom).unwrap();

            assert_eq!(entries.len(), 1, "zoom {zoom}");
            assert_eq!(entries[0].num_points(), 2, "zoom {zoom}");
        }

        let entries = engine.search([6.0, 6.0, 8.0, 8.0], 16).unwrap();
        let cluster = entries[0].as_cluster().unwrap();

        assert_eq!(
            engine.get_cluster_expansion_zoom(cluster.id).unwrap(),
            17
        );
    }

    #[test]
    fn test_single_point_never_clusters() {
        let engine = loaded_engine(vec![(3.0, 3.0)]);

        for zoom in 0..=17 {
            let entries = engine.search([-180.0, -90.0, 180.0, 90.0], zoom).unwrap();

            assert_eq!(entries.len(), 1);
            assert!(entries[0].as_leaf().is_some());
        }
    }

    #[test]
    fn test_empty_load() {
        let engine = loaded_engine(vec![]);

        assert_eq!(engine.num_points(), 0);
        assert!(engine.search([-180.0, -90.0, 180.0, 90.0], 3).unwrap().is_empty());
        assert_eq!(engine.points_at_zoom(3).unwrap(), 0);
    }
}
