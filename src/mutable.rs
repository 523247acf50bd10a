//! # Mutable engine module
//!
//! The incrementally maintained clustering engine: points may be added and
//! removed after load, and the zoom hierarchy is repaired in place.
//!
//! Elements live once in a slot arena and are indexed by one R-tree per
//! zoom. Each element records the contiguous zoom range it currently exists
//! in (`low ..= high`); clusters additionally carry an explicit child list
//! and an opaque generated identifier, so identity survives restructuring
//! that would shift any positional scheme.

use std::{collections::HashMap, hash::BuildHasherDefault};

use twox_hash::XxHash64;
use uuid::Uuid;

use crate::{
    kdtree::squared_distance,
    projection::{resolve_latlng_bbox, BboxQuery},
    rtree::{DynamicIndex, SlotEntry},
    Aggregation, ClusterData, ClusterEntry, ClusterId, ClusterPoint, CoordinateSystem, Entry,
    GeoclusterBuilder, GeoclusterError, GeoclusterOptions, LeafEntry,
};

/// One element of the mutable hierarchy.
#[derive(Debug)]
struct DynElement<A, D> {
    /// Projected X of the element (centroid, for clusters).
    x: f64,

    /// Projected Y of the element (centroid, for clusters).
    y: f64,

    /// The number of original points this element represents.
    num_points: u32,

    /// Coarsest zoom at which the element currently exists.
    low: u8,

    /// Finest zoom at which the element exists: `max_zoom + 1` for leaves,
    /// the formation zoom for clusters.
    high: u8,

    /// Arena slot of the cluster that absorbed this element, if any.
    parent: Option<usize>,

    /// Leaf or cluster payload.
    kind: DynKind<A, D>,
}

impl<A, D> DynElement<A, D> {
    /// Whether this element is a cluster.
    fn is_cluster(&self) -> bool {
        matches!(self.kind, DynKind::Cluster { .. })
    }
}

/// Leaf-vs-cluster payload of a mutable element.
#[derive(Debug)]
enum DynKind<A, D> {
    /// An original input point, referenced by its point-arena slot.
    Leaf {
        /// Slot of the point in the point arena.
        point: usize,
    },

    /// An aggregation of two or more elements.
    Cluster {
        /// Stable generated identifier.
        id: ClusterId,

        /// Arena slots of the direct children, seeding element first.
        children: Vec<usize>,

        /// Map/reduce aggregate, when configured.
        aggregate: Option<A>,

        /// Monoid-style payload, when configured.
        data: Option<D>,
    },
}

/// One per-zoom layer: a dynamic index plus the memoized inclusion radius.
struct DynLayer {
    /// Spatial index over the elements present at this zoom.
    index: DynamicIndex,

    /// Inclusion radius at this zoom, in unit-square units.
    r: f64,

    /// Squared inclusion radius at this zoom.
    r2: f64,
}

/// The mutable hierarchical clustering engine.
///
/// Shares the query surface of [`Geocluster`](crate::Geocluster) and adds
/// `add`, `remove`, `modify_point_data` and `contains`.
pub struct MutableGeocluster<P, A = (), D = ()> {
    /// Configuration settings.
    options: GeoclusterOptions,

    /// Aggregation capability bundle.
    aggregation: Aggregation<P, A, D>,

    /// Source of opaque cluster identifiers.
    id_source: Box<dyn FnMut() -> Uuid>,

    /// Point arena; freed slots are `None` until reused.
    points: Vec<Option<P>>,

    /// Reusable point-arena slots.
    free_points: Vec<usize>,

    /// Element arena; freed slots are `None` until reused.
    elements: Vec<Option<DynElement<A, D>>>,

    /// Reusable element-arena slots.
    free_elements: Vec<usize>,

    /// Layers for zooms `min_zoom ..= max_zoom + 1`, coarsest first.
    layers: Vec<DynLayer>,

    /// Live clusters by identifier.
    clusters_by_id: HashMap<ClusterId, usize, BuildHasherDefault<XxHash64>>,

    /// The number of live points.
    total_points: usize,

    /// Whether `load` has completed.
    loaded: bool,
}

impl<P, A, D> MutableGeocluster<P, A, D>
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
        log::debug!("Creating a new mutable geocluster instance");

        let layers = (options.min_zoom..=options.max_zoom + 1)
            .map(|zoom| {
                let r = options.radius_at(zoom);

                DynLayer {
                    index: DynamicIndex::new(),
                    r,
                    r2: r * r,
                }
            })
            .collect();

        Ok(MutableGeocluster {
            options,
            aggregation,
            id_source: Box::new(Uuid::new_v4),
            points: vec![],
            free_points: vec![],
            elements: vec![],
            free_elements: vec![],
            layers,
            clusters_by_id: HashMap::default(),
            total_points: 0,
            loaded: false,
        })
    }

    /// Replace the source of cluster identifiers (the default generates
    /// random UUIDs). Useful for deterministic identifiers in tests.
    pub fn with_id_source(mut self, source: impl FnMut() -> Uuid + 'static) -> Self {
        self.id_source = Box::new(source);
        self
    }

    /// Load the input points, replacing any previous content. Loading the
    /// same batch twice produces the same layer stack as loading it once.
    ///
    /// # Errors
    ///
    /// Returns `NonFiniteCoordinate` when an extractor yields NaN or an
    /// infinity; the engine state is left untouched in that case.
    pub fn load(&mut self, points: Vec<P>) -> Result<&mut Self, GeoclusterError> {
        #[cfg(feature = "log")]
        log::debug!("Loading {} points into the mutable index", points.len());

        for point in &points {
            if !(point.x().is_finite() && point.y().is_finite()) {
                return Err(GeoclusterError::NonFiniteCoordinate);
            }
        }

        let min_zoom = self.options.min_zoom;
        let max_zoom = self.options.max_zoom;
        let leaf_zoom = max_zoom + 1;

        self.free_points.clear();
        self.elements.clear();
        self.free_elements.clear();
        self.clusters_by_id.clear();
        self.total_points = points.len();
        self.points = points.into_iter().map(Some).collect();

        let mut order = Vec::with_capacity(self.points.len());
        let mut entries = Vec::with_capacity(self.points.len());

        for i in 0..self.points.len() {
            let (raw_x, raw_y) = match &self.points[i] {
                Some(point) => (point.x(), point.y()),
                None => continue,
            };

            let (x, y) = self.options.coordinate_system.project(raw_x, raw_y);

            let slot = self.alloc_element(DynElement {
                x,
                y,
                num_points: 1,
                low: leaf_zoom,
                high: leaf_zoom,
                parent: None,
                kind: DynKind::Leaf { point: i },
            });

            order.push(slot);
            entries.push(SlotEntry { x, y, slot });
        }

        let leaf_index = self.layer_index(leaf_zoom);
        self.layers[leaf_index].index = DynamicIndex::load(entries);

        // Same finest-to-coarsest pass as the immutable engine, bulk-loading
        // one R-tree per produced layer.
        for zoom in (min_zoom..=max_zoom).rev() {
            let working_zoom = zoom + 1;
            let working_index = self.layer_index(working_zoom);
            let (r, r2) = {
                let target = &self.layers[self.layer_index(zoom)];
                (target.r, target.r2)
            };

            let mut next_order = vec![];
            let mut next_entries = vec![];

            for position in 0..order.len() {
                let slot = order[position];

                let (x, y, own_points, live) = {
                    let element = self.element(slot);
                    (
                        element.x,
                        element.y,
                        element.num_points,
                        element.parent.is_none() && element.low == working_zoom,
                    )
                };

                if !live {
                    continue;
                }

                let probe = self.layers[working_index]
                    .index
                    .search_padded(x, y, x, y, r);

                let mut neighbors = vec![];
                let mut num_points = own_points;

                for n in probe {
                    if n == slot {
                        continue;
                    }

                    let element = self.element(n);

                    if element.parent.is_some() || element.low != working_zoom {
                        continue;
                    }

                    if squared_distance(element.x, element.y, x, y) <= r2 {
                        num_points += element.num_points;
                        neighbors.push(n);
                    }
                }

                if !neighbors.is_empty() && num_points >= self.options.min_points {
                    let cluster =
                        self.form_cluster_of(slot, &neighbors, zoom, num_points, false);

                    let element = self.element(cluster);
                    next_entries.push(SlotEntry {
                        x: element.x,
                        y: element.y,
                        slot: cluster,
                    });
                    next_order.push(cluster);
                } else {
                    // Too few combined points for a cluster: carry the seed
                    // and its neighbours down a layer, preserving adjacency.
                    self.set_low(slot, zoom);
                    next_order.push(slot);
                    next_entries.push(SlotEntry { x, y, slot });

                    for &n in &neighbors {
                        let (nx, ny) = {
                            let element = self.element(n);
                            (element.x, element.y)
                        };

                        self.set_low(n, zoom);
                        next_order.push(n);
                        next_entries.push(SlotEntry {
                            x: nx,
                            y: ny,
                            slot: n,
                        });
                    }
                }
            }

            let target_index = self.layer_index(zoom);
            self.layers[target_index].index = DynamicIndex::load(next_entries);
            order = next_order;
        }

        self.loaded = true;

        Ok(self)
    }

    /// Insert one point, repairing the hierarchy along its lineage.
    ///
    /// Descending from `max_zoom`, the point (or the cluster now carrying
    /// it) either joins the first cluster probed within the zoom's radius,
    /// forms a new cluster when enough unabsorbed neighbours are near, or
    /// stays standalone at the layer and continues coarser.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load`, or `NonFiniteCoordinate` for a
    /// bad point; the engine state is left untouched in both cases.
    pub fn add(&mut self, point: P) -> Result<(), GeoclusterError> {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        if !(point.x().is_finite() && point.y().is_finite()) {
            return Err(GeoclusterError::NonFiniteCoordinate);
        }

        #[cfg(feature = "log")]
        log::debug!("Adding a point at ({}, {})", point.x(), point.y());

        let (x, y) = self
            .options
            .coordinate_system
            .project(point.x(), point.y());

        let leaf_zoom = self.options.max_zoom + 1;
        let point_slot = self.alloc_point(point);
        let leaf = self.alloc_element(DynElement {
            x,
            y,
            num_points: 1,
            low: leaf_zoom,
            high: leaf_zoom,
            parent: None,
            kind: DynKind::Leaf { point: point_slot },
        });

        let leaf_index = self.layer_index(leaf_zoom);
        self.layers[leaf_index].index.insert(SlotEntry { x, y, slot: leaf });
        self.total_points += 1;

        let mut current = leaf;

        for zoom in (self.options.min_zoom..=self.options.max_zoom).rev() {
            let layer_index = self.layer_index(zoom);
            let (r, r2) = {
                let layer = &self.layers[layer_index];
                (layer.r, layer.r2)
            };

            let (cx, cy, current_points) = {
                let element = self.element(current);
                (element.x, element.y, element.num_points)
            };

            let probe = self.layers[layer_index]
                .index
                .search_padded(cx, cy, cx, cy, r);

            let mut mergeable = vec![];

            for n in probe {
                let element = self.element(n);

                if squared_distance(element.x, element.y, cx, cy) <= r2 {
                    mergeable.push(n);
                }
            }

            // An existing cluster absorbs the lineage; the probe's
            // iteration order breaks ties.
            if let Some(cluster) = mergeable
                .iter()
                .copied()
                .find(|&n| self.element(n).is_cluster())
            {
                if self.element(cluster).high == zoom {
                    // The cluster's finest layer: a true extension, keeping
                    // its identifier.
                    self.attach_to_cluster(current, cluster);
                } else {
                    // The cluster also lives at finer zooms where the
                    // lineage stays standalone, so it cannot simply grow; a
                    // new cluster takes its place from this zoom up.
                    self.form_replacing(current, cluster, zoom);
                }

                return Ok(());
            }

            let free: Vec<usize> = mergeable
                .iter()
                .copied()
                .filter(|&n| self.element(n).parent.is_none())
                .collect();

            let free_points: u32 = free
                .iter()
                .map(|&n| self.element(n).num_points)
                .sum();

            if !free.is_empty() && current_points + free_points >= self.options.min_points {
                current = self.form_cluster_of(
                    current,
                    &free,
                    zoom,
                    current_points + free_points,
                    true,
                );

                let element = self.element(current);
                let entry = SlotEntry {
                    x: element.x,
                    y: element.y,
                    slot: current,
                };
                self.layers[layer_index].index.insert(entry);

                continue;
            }

            // A neighbour that stands alone here but belongs to a cluster
            // at a coarser zoom: a new cluster takes its place there.
            if let Some(taken) = mergeable
                .iter()
                .copied()
                .find(|&n| self.element(n).parent.is_some())
            {
                if current_points + self.element(taken).num_points >= self.options.min_points {
                    self.form_replacing(current, taken, zoom);
                    return Ok(());
                }
            }

            self.set_low(current, zoom);
            self.layers[layer_index].index.insert(SlotEntry {
                x: cx,
                y: cy,
                slot: current,
            });
        }

        Ok(())
    }

    /// Remove one point, dissolving or shrinking the clusters along its
    /// lineage.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load` and `PointNotFound` when no loaded
    /// point equals the given one; the engine state is left untouched in
    /// both cases.
    pub fn remove(&mut self, point: &P) -> Result<(), GeoclusterError>
    where
        P: PartialEq,
    {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        let leaf = self
            .find_leaf(point)
            .ok_or(GeoclusterError::PointNotFound)?;

        #[cfg(feature = "log")]
        log::debug!("Removing the point at ({}, {})", point.x(), point.y());

        let (x, y, low, parent, point_slot) = {
            let element = self.element(leaf);
            let point_slot = match element.kind {
                DynKind::Leaf { point } => point,
                DynKind::Cluster { .. } => return Err(GeoclusterError::PointNotFound),
            };

            (element.x, element.y, element.low, element.parent, point_slot)
        };

        let leaf_zoom = self.options.max_zoom + 1;

        for zoom in low..=leaf_zoom {
            let layer_index = self.layer_index(zoom);
            self.layers[layer_index]
                .index
                .remove(&SlotEntry { x, y, slot: leaf });
        }

        self.free_point(point_slot);
        self.free_element(leaf);
        self.total_points -= 1;

        let mut detach = Some(leaf);
        let mut current = parent;

        while let Some(slot) = current {
            let next = self.element(slot).parent;

            if let Some(gone) = detach {
                if let Some(element) = self.elements[slot].as_mut() {
                    if let DynKind::Cluster { children, .. } = &mut element.kind {
                        children.retain(|&child| child != gone);
                    }
                }
            }

            let (num_points, child_count) = {
                let element = self.elements[slot].as_mut();
                match element {
                    Some(element) => {
                        element.num_points -= 1;

                        let child_count = match &element.kind {
                            DynKind::Cluster { children, .. } => children.len(),
                            DynKind::Leaf { .. } => 0,
                        };

                        (element.num_points, child_count)
                    }
                    None => break,
                }
            };

            if num_points < self.options.min_points || child_count < 2 {
                self.dissolve(slot);
            } else {
                self.refresh_cluster(slot);
            }

            detach = None;
            current = next;
        }

        Ok(())
    }

    /// Replace a stored point with an equal-position successor, refolding
    /// aggregates along its lineage.
    ///
    /// # Errors
    ///
    /// Returns `PointNotFound` for an unknown point and `PointMoved` when
    /// the replacement projects to a different position (remove and re-add
    /// instead).
    pub fn modify_point_data(&mut self, old: &P, new: P) -> Result<(), GeoclusterError>
    where
        P: PartialEq,
    {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        if !(new.x().is_finite() && new.y().is_finite()) {
            return Err(GeoclusterError::NonFiniteCoordinate);
        }

        let leaf = self
            .find_leaf(old)
            .ok_or(GeoclusterError::PointNotFound)?;

        let (x, y, parent, point_slot) = {
            let element = self.element(leaf);
            let point_slot = match element.kind {
                DynKind::Leaf { point } => point,
                DynKind::Cluster { .. } => return Err(GeoclusterError::PointNotFound),
            };

            (element.x, element.y, element.parent, point_slot)
        };

        let (new_x, new_y) = self.options.coordinate_system.project(new.x(), new.y());

        if new_x != x || new_y != y {
            return Err(GeoclusterError::PointMoved);
        }

        self.points[point_slot] = Some(new);

        let mut current = parent;

        while let Some(slot) = current {
            let next = self.element(slot).parent;
            self.refresh_cluster(slot);
            current = next;
        }

        Ok(())
    }

    /// Whether an equal point is currently loaded.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load`.
    pub fn contains(&self, point: &P) -> Result<bool, GeoclusterError>
    where
        P: PartialEq,
    {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        Ok(self.find_leaf(point).is_some())
    }

    /// Retrieve the elements visible in a bounding box at a zoom level.
    ///
    /// The box is `[west, south, east, north]` in the caller's coordinate
    /// space; antimeridian-crossing boxes are split and unioned.
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

        let layer = &self.layers[self.layer_index(self.limit_zoom(zoom))];

        let slots = match &self.options.coordinate_system {
            CoordinateSystem::Cartesian { range } => layer.index.range(
                range.normalize(bbox[0]),
                range.normalize(bbox[1]),
                range.normalize(bbox[2]),
                range.normalize(bbox[3]),
            ),
            CoordinateSystem::LatLng => match resolve_latlng_bbox(bbox) {
                BboxQuery::Unit(unit) => layer.index.range(unit[0], unit[1], unit[2], unit[3]),
                BboxQuery::Split(eastern, western) => {
                    let mut eastern_hem = self.search(eastern, zoom)?;
                    let western_hem = self.search(western, zoom)?;

                    eastern_hem.extend(western_hem);

                    return Ok(eastern_hem);
                }
            },
        };

        Ok(slots.into_iter().map(|slot| self.entry_for(slot)).collect())
    }

    /// Retrieve the direct children of a cluster.
    ///
    /// # Errors
    ///
    /// Returns `ClusterNotFound` when the identifier does not refer to a
    /// live cluster.
    pub fn get_children(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Vec<Entry<'_, P, A, D>>, GeoclusterError> {
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        let slot = *self
            .clusters_by_id
            .get(&cluster_id)
            .ok_or(GeoclusterError::ClusterNotFound)?;

        match &self.element(slot).kind {
            DynKind::Cluster { children, .. } => Ok(children
                .iter()
                .map(|&child| self.entry_for(child))
                .collect()),
            DynKind::Leaf { .. } => Err(GeoclusterError::ClusterNotFound),
        }
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
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        let slot = *self
            .clusters_by_id
            .get(&cluster_id)
            .ok_or(GeoclusterError::ClusterNotFound)?;

        let mut leaves = vec![];
        self.append_leaves(&mut leaves, slot, limit, offset, 0);

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
        if !self.loaded {
            return Err(GeoclusterError::NotLoaded);
        }

        let mut slot = *self
            .clusters_by_id
            .get(&cluster_id)
            .ok_or(GeoclusterError::ClusterNotFound)?;

        loop {
            let element = self.element(slot);

            let children = match &element.kind {
                DynKind::Cluster { children, .. } => children,
                DynKind::Leaf { .. } => return Err(GeoclusterError::ClusterNotFound),
            };

            if children.len() == 1 && self.element(children[0]).is_cluster() {
                slot = children[0];
                continue;
            }

            return Ok(element.high + 1);
        }
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

        Ok(self.layers[self.layer_index(self.limit_zoom(zoom))].index.size())
    }

    /// The total number of live points.
    pub fn num_points(&self) -> usize {
        self.total_points
    }

    /// Clamp a requested zoom into the range of maintained layers.
    fn limit_zoom(&self, zoom: u8) -> u8 {
        zoom.max(self.options.min_zoom)
            .min(self.options.max_zoom + 1)
    }

    /// Position of a zoom's layer in the layer vector.
    fn layer_index(&self, zoom: u8) -> usize {
        (zoom - self.options.min_zoom) as usize
    }

    /// The live element in a slot.
    fn element(&self, slot: usize) -> &DynElement<A, D> {
        self.elements[slot]
            .as_ref()
            .expect("arena slot referenced after free")
    }

    /// Store an element, reusing a freed slot when one exists.
    fn alloc_element(&mut self, element: DynElement<A, D>) -> usize {
        match self.free_elements.pop() {
            Some(slot) => {
                self.elements[slot] = Some(element);
                slot
            }
            None => {
                self.elements.push(Some(element));
                self.elements.len() - 1
            }
        }
    }

    /// Release an element slot for reuse.
    fn free_element(&mut self, slot: usize) {
        self.elements[slot] = None;
        self.free_elements.push(slot);
    }

    /// Store a point, reusing a freed slot when one exists.
    fn alloc_point(&mut self, point: P) -> usize {
        match self.free_points.pop() {
            Some(slot) => {
                self.points[slot] = Some(point);
                slot
            }
            None => {
                self.points.push(Some(point));
                self.points.len() - 1
            }
        }
    }

    /// Release a point slot for reuse.
    fn free_point(&mut self, slot: usize) {
        self.points[slot] = None;
        self.free_points.push(slot);
    }

    /// Extend an element's presence down to the given zoom.
    fn set_low(&mut self, slot: usize, zoom: u8) {
        if let Some(element) = self.elements[slot].as_mut() {
            element.low = zoom;
        }
    }

    /// Locate the leaf element holding a point equal to the given one.
    fn find_leaf(&self, point: &P) -> Option<usize>
    where
        P: PartialEq,
    {
        let (x, y) = self
            .options
            .coordinate_system
            .project(point.x(), point.y());

        let leaf_layer = &self.layers[self.layer_index(self.options.max_zoom + 1)];

        for slot in leaf_layer.index.within(x, y, 0.0) {
            if let DynKind::Leaf { point: point_slot } = self.element(slot).kind {
                if self.points[point_slot].as_ref() == Some(point) {
                    return Some(slot);
                }
            }
        }

        None
    }

    /// Build the public view of one element.
    fn entry_for(&self, slot: usize) -> Entry<'_, P, A, D> {
        let element = self.element(slot);

        match &element.kind {
            DynKind::Cluster {
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
            DynKind::Leaf { point } => {
                let point = self.points[*point]
                    .as_ref()
                    .expect("point slot referenced after free");

                Entry::Leaf(LeafEntry {
                    point,
                    x: point.x(),
                    y: point.y(),
                })
            }
        }
    }

    /// The aggregate payloads one element contributes to a forming cluster.
    fn child_payloads(&self, slot: usize) -> (Option<A>, Option<D>) {
        match &self.element(slot).kind {
            DynKind::Leaf { point } => match &self.points[*point] {
                Some(point) => (
                    self.aggregation.map_point(point),
                    self.aggregation.extract_point(point),
                ),
                None => (None, None),
            },
            DynKind::Cluster {
                aggregate, data, ..
            } => (aggregate.clone(), data.clone()),
        }
    }

    /// Move an element's index entries to a new position across its zoom
    /// range.
    fn reposition(
        &mut self,
        slot: usize,
        old_x: f64,
        old_y: f64,
        new_x: f64,
        new_y: f64,
        low: u8,
        high: u8,
    ) {
        if old_x == new_x && old_y == new_y {
            return;
        }

        for zoom in low..=high {
            let layer_index = self.layer_index(zoom);
            self.layers[layer_index].index.remove(&SlotEntry {
                x: old_x,
                y: old_y,
                slot,
            });
            self.layers[layer_index].index.insert(SlotEntry {
                x: new_x,
                y: new_y,
                slot,
            });
        }
    }

    /// Form a new cluster from a seed element plus absorbed neighbours at
    /// the given zoom, and return its slot.
    ///
    /// The seed contributes its position as the cluster origin and its
    /// aggregate as the fold seed. With `strip_entries`, the absorbed
    /// neighbours' standalone index entries at this zoom and coarser are
    /// removed (the incremental path; the bulk path has not built those
    /// layers yet).
    fn form_cluster_of(
        &mut self,
        seed: usize,
        absorbed: &[usize],
        zoom: u8,
        num_points: u32,
        strip_entries: bool,
    ) -> usize {
        let id = ClusterId::from_uuid((self.id_source)());

        let (seed_x, seed_y, seed_points) = {
            let element = self.element(seed);
            (element.x, element.y, element.num_points)
        };

        let (mut aggregate, mut data) = self.child_payloads(seed);
        let mut wx = seed_x * f64::from(seed_points);
        let mut wy = seed_y * f64::from(seed_points);

        for &n in absorbed {
            let (nx, ny, nn) = {
                let element = self.element(n);
                (element.x, element.y, element.num_points)
            };

            wx += nx * f64::from(nn);
            wy += ny * f64::from(nn);

            let (child_aggregate, child_data) = self.child_payloads(n);
            self.aggregation
                .reduce_into(&mut aggregate, child_aggregate.as_ref());
            self.aggregation
                .combine_into(&mut data, child_data.as_ref());

            if strip_entries {
                let (low, x, y) = {
                    let element = self.element(n);
                    (element.low, element.x, element.y)
                };

                for z in low..=zoom {
                    let layer_index = self.layer_index(z);
                    self.layers[layer_index]
                        .index
                        .remove(&SlotEntry { x, y, slot: n });
                }
            }
        }

        let mut children = Vec::with_capacity(absorbed.len() + 1);
        children.push(seed);
        children.extend_from_slice(absorbed);

        let total = f64::from(num_points);
        let cluster = self.alloc_element(DynElement {
            x: wx / total,
            y: wy / total,
            num_points,
            low: zoom,
            high: zoom,
            parent: None,
            kind: DynKind::Cluster {
                id,
                children,
                aggregate,
                data,
            },
        });

        self.clusters_by_id.insert(id, cluster);

        for &n in absorbed {
            if let Some(element) = self.elements[n].as_mut() {
                element.parent = Some(cluster);
                element.low = zoom + 1;
            }
        }

        if let Some(element) = self.elements[seed].as_mut() {
            element.parent = Some(cluster);
        }

        cluster
    }

    /// Form a new cluster that replaces `taken` inside its coarser parent,
    /// absorbing the inserted lineage alongside it.
    fn form_replacing(&mut self, seed: usize, taken: usize, zoom: u8) {
        let id = ClusterId::from_uuid((self.id_source)());

        let (seed_x, seed_y, seed_points) = {
            let element = self.element(seed);
            (element.x, element.y, element.num_points)
        };

        let (taken_x, taken_y, taken_points, taken_low, taken_parent) = {
            let element = self.element(taken);
            (
                element.x,
                element.y,
                element.num_points,
                element.low,
                element.parent,
            )
        };

        let (mut aggregate, mut data) = self.child_payloads(seed);
        let (taken_aggregate, taken_data) = self.child_payloads(taken);
        self.aggregation
            .reduce_into(&mut aggregate, taken_aggregate.as_ref());
        self.aggregation
            .combine_into(&mut data, taken_data.as_ref());

        let num_points = seed_points + taken_points;
        let total = f64::from(num_points);
        let x = (seed_x * f64::from(seed_points) + taken_x * f64::from(taken_points)) / total;
        let y = (seed_y * f64::from(seed_points) + taken_y * f64::from(taken_points)) / total;

        for z in taken_low..=zoom {
            let layer_index = self.layer_index(z);
            self.layers[layer_index].index.remove(&SlotEntry {
                x: taken_x,
                y: taken_y,
                slot: taken,
            });
        }

        let cluster = self.alloc_element(DynElement {
            x,
            y,
            num_points,
            low: taken_low,
            high: zoom,
            parent: taken_parent,
            kind: DynKind::Cluster {
                id,
                children: vec![seed, taken],
                aggregate,
                data,
            },
        });

        self.clusters_by_id.insert(id, cluster);

        if let Some(element) = self.elements[taken].as_mut() {
            element.parent = Some(cluster);
            element.low = zoom + 1;
        }

        if let Some(element) = self.elements[seed].as_mut() {
            element.parent = Some(cluster);
        }

        for z in taken_low..=zoom {
            let layer_index = self.layer_index(z);
            self.layers[layer_index]
                .index
                .insert(SlotEntry { x, y, slot: cluster });
        }

        if let Some(grand) = taken_parent {
            if let Some(element) = self.elements[grand].as_mut() {
                if let DynKind::Cluster { children, .. } = &mut element.kind {
                    for child in children.iter_mut() {
                        if *child == taken {
                            *child = cluster;
                        }
                    }
                }
            }

            let (seed_aggregate, seed_data) = self.child_payloads(seed);
            self.propagate_gain(grand, seed_points, seed_x, seed_y, seed_aggregate, seed_data);
        }
    }

    /// Attach an element to an existing cluster, then fold the gained
    /// points, centroid weight and aggregates up the ancestor chain.
    fn attach_to_cluster(&mut self, child: usize, cluster: usize) {
        let (child_x, child_y, child_points) = {
            let element = self.element(child);
            (element.x, element.y, element.num_points)
        };

        let (child_aggregate, child_data) = self.child_payloads(child);

        if let Some(element) = self.elements[child].as_mut() {
            element.parent = Some(cluster);
        }

        if let Some(element) = self.elements[cluster].as_mut() {
            if let DynKind::Cluster { children, .. } = &mut element.kind {
                children.push(child);
            }
        }

        self.propagate_gain(
            cluster,
            child_points,
            child_x,
            child_y,
            child_aggregate,
            child_data,
        );
    }

    /// Apply a point-count, centroid-weight and aggregate gain to a cluster
    /// and every ancestor above it.
    ///
    /// A child's weighted position change equals the added weight, so the
    /// same delta applies at every level of the chain.
    fn propagate_gain(
        &mut self,
        start: usize,
        added_points: u32,
        added_x: f64,
        added_y: f64,
        aggregate: Option<A>,
        data: Option<D>,
    ) {
        let mut current = Some(start);

        while let Some(slot) = current {
            let (old_x, old_y, old_points, low, high, parent) = {
                let element = self.element(slot);
                (
                    element.x,
                    element.y,
                    element.num_points,
                    element.low,
                    element.high,
                    element.parent,
                )
            };

            let new_points = old_points + added_points;
            let new_x = (old_x * f64::from(old_points) + added_x * f64::from(added_points))
                / f64::from(new_points);
            let new_y = (old_y * f64::from(old_points) + added_y * f64::from(added_points))
                / f64::from(new_points);

            if let Some(element) = self.elements[slot].as_mut() {
                element.num_points = new_points;
                element.x = new_x;
                element.y = new_y;

                if let DynKind::Cluster {
                    aggregate: cluster_aggregate,
                    data: cluster_data,
                    ..
                } = &mut element.kind
                {
                    self.aggregation
                        .reduce_into(cluster_aggregate, aggregate.as_ref());
                    self.aggregation.combine_into(cluster_data, data.as_ref());
                }
            }

            self.reposition(slot, old_x, old_y, new_x, new_y, low, high);

            current = parent;
        }
    }

    /// Dissolve a cluster: promote its remaining children into its zoom
    /// range, splice them into the grandparent's child list, and retire the
    /// cluster.
    ///
    /// No re-clustering among the children is possible at this point: their
    /// combined count is below `min_points`, or a single child remains.
    fn dissolve(&mut self, slot: usize) {
        let (x, y, low, high, parent, children, id) = {
            let element = self.element(slot);

            match &element.kind {
                DynKind::Cluster { id, children, .. } => (
                    element.x,
                    element.y,
                    element.low,
                    element.high,
                    element.parent,
                    children.clone(),
                    *id,
                ),
                DynKind::Leaf { .. } => return,
            }
        };

        for &child in &children {
            let (child_x, child_y, child_low) = {
                let element = self.element(child);
                (element.x, element.y, element.low)
            };

            if let Some(element) = self.elements[child].as_mut() {
                element.low = low;
                element.parent = parent;
            }

            // The child already holds entries from its own range down to
            // `child_low`; only the layers below that are new to it.
            if child_low > low {
                for zoom in low..=child_low - 1 {
                    let layer_index = self.layer_index(zoom);
                    self.layers[layer_index].index.insert(SlotEntry {
                        x: child_x,
                        y: child_y,
                        slot: child,
                    });
                }
            }
        }

        for zoom in low..=high {
            let layer_index = self.layer_index(zoom);
            self.layers[layer_index].index.remove(&SlotEntry { x, y, slot });
        }

        if let Some(grand) = parent {
            if let Some(element) = self.elements[grand].as_mut() {
                if let DynKind::Cluster {
                    children: grand_children,
                    ..
                } = &mut element.kind
                {
                    grand_children.retain(|&child| child != slot);
                    grand_children.extend(children.iter().copied());
                }
            }
        }

        self.clusters_by_id.remove(&id);
        self.free_element(slot);
    }

    /// Recompute a cluster's centroid, point count and aggregates from its
    /// children, repositioning its index entries when the centroid moved.
    fn refresh_cluster(&mut self, slot: usize) {
        let children = match &self.element(slot).kind {
            DynKind::Cluster { children, .. } => children.clone(),
            DynKind::Leaf { .. } => return,
        };

        let mut wx = 0.0;
        let mut wy = 0.0;
        let mut total: u32 = 0;
        let mut aggregate: Option<A> = None;
        let mut data: Option<D> = None;
        let mut first = true;

        for &child in &children {
            let (child_x, child_y, child_points) = {
                let element = self.element(child);
                (element.x, element.y, element.num_points)
            };

            wx += child_x * f64::from(child_points);
            wy += child_y * f64::from(child_points);
            total += child_points;

            let (child_aggregate, child_data) = self.child_payloads(child);

            if first {
                aggregate = child_aggregate;
                data = child_data;
                first = false;
            } else {
                self.aggregation
                    .reduce_into(&mut aggregate, child_aggregate.as_ref());
                self.aggregation
                    .combine_into(&mut data, child_data.as_ref());
            }
        }

        if total == 0 {
            return;
        }

        let (old_x, old_y, low, high) = {
            let element = self.element(slot);
            (element.x, element.y, element.low, element.high)
        };

        let new_x = wx / f64::from(total);
        let new_y = wy / f64::from(total);

        if let Some(element) = self.elements[slot].as_mut() {
            element.num_points = total;
            element.x = new_x;
            element.y = new_y;

            if let DynKind::Cluster {
                aggregate: cluster_aggregate,
                data: cluster_data,
                ..
            } = &mut element.kind
            {
                *cluster_aggregate = aggregate;
                *cluster_data = data;
            }
        }

        self.reposition(slot, old_x, old_y, new_x, new_y, low, high);
    }

    /// Collect leaves under a cluster slot, depth first, honouring limit
    /// and offset. Returns the updated skip count.
    fn append_leaves<'a>(
        &'a self,
        result: &mut Vec<&'a P>,
        slot: usize,
        limit: usize,
        offset: usize,
        mut skipped: usize,
    ) -> usize {
        let children = match &self.element(slot).kind {
            DynKind::Cluster { children, .. } => children,
            DynKind::Leaf { .. } => return skipped,
        };

        for &child in children {
            if result.len() >= limit {
                break;
            }

            let element = self.element(child);

            match &element.kind {
                DynKind::Cluster { .. } => {
                    if skipped + element.num_points as usize <= offset {
                        // Skip the whole cluster
                        skipped += element.num_points as usize;
                    } else {
                        // Enter the cluster
                        skipped = self.append_leaves(result, child, limit, offset, skipped);
                    }
                }
                DynKind::Leaf { point } => {
                    if skipped < offset {
                        // Skip a single point
                        skipped += 1;
                    } else if let Some(point) = self.points[*point].as_ref() {
                        // Add a single point
                        result.push(point);
                    }
                }
            }
        }

        skipped
    }
}
