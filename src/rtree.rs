//! # R-tree module
//!
//! This module contains the dynamic spatial index used by the mutable
//! engine: one bulk-loadable R\*-tree per zoom layer.
//!
//! The tree stores lightweight [`SlotEntry`] records (a projected position
//! plus a slot into the engine's element arena) so that element payloads can
//! be mutated without touching the index; a position change is a remove
//! followed by an insert. Neighbour probes use a query boundary inflated on
//! each side before the exact distance filter, so any element close enough
//! to merge is seen.

use rstar::{PointDistance, RStarInsertionStrategy, RTree, RTreeObject, RTreeParams, AABB};

use crate::kdtree::squared_distance;

/// One indexed record: a projected position plus an element-arena slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SlotEntry {
    /// Projected X coordinate.
    pub x: f64,

    /// Projected Y coordinate.
    pub y: f64,

    /// Slot of the element in the engine's arena.
    pub slot: usize,
}

impl RTreeObject for SlotEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

impl PointDistance for SlotEntry {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        squared_distance(self.x, self.y, point[0], point[1])
    }
}

/// Tree parameters: max fan-out 9 with min fan-out ~0.4·M, forced
/// reinsertion of two entries on the first overflow per level.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IndexParams;

impl RTreeParams for IndexParams {
    const MIN_SIZE: usize = 3;
    const MAX_SIZE: usize = 9;
    const REINSERTION_COUNT: usize = 2;
    type DefaultInsertionStrategy = RStarInsertionStrategy;
}

/// A dynamic 2-D index over arena slots.
pub(crate) struct DynamicIndex {
    /// The backing R\*-tree.
    tree: RTree<SlotEntry, IndexParams>,
}

impl DynamicIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        DynamicIndex {
            tree: RTree::new_with_params(),
        }
    }

    /// Bulk-load an index from a batch of entries.
    pub fn load(entries: Vec<SlotEntry>) -> Self {
        DynamicIndex {
            tree: RTree::bulk_load_with_params(entries),
        }
    }

    /// Insert one entry.
    pub fn insert(&mut self, entry: SlotEntry) {
        self.tree.insert(entry);
    }

    /// Remove one entry. Returns whether it was present.
    pub fn remove(&mut self, entry: &SlotEntry) -> bool {
        self.tree.remove(entry).is_some()
    }

    /// The number of indexed entries.
    pub fn size(&self) -> usize {
        self.tree.size()
    }

    /// Slots of all entries within Euclidean distance `r` of `(x, y)`, in
    /// tree iteration order.
    pub fn within(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        self.tree
            .locate_within_distance([x, y], r * r)
            .map(|entry| entry.slot)
            .collect()
    }

    /// Slots of all entries inside the box inflated by `pad` on each side,
    /// in tree iteration order.
    pub fn search_padded(
        &self,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        pad: f64,
    ) -> Vec<usize> {
        let envelope =
            AABB::from_corners([min_x - pad, min_y - pad], [max_x + pad, max_y + pad]);

        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.slot)
            .collect()
    }

    /// Slots of all entries inside the closed box, in tree iteration order.
    pub fn range(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<usize> {
        self.search_padded(min_x, min_y, max_x, max_y, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(x: f64, y: f64, slot: usize) -> SlotEntry {
        SlotEntry { x, y, slot }
    }

    #[test]
    fn test_insert_remove_round_trip() {
        let mut index = DynamicIndex::new();

        index.insert(entry(0.25, 0.25, 0));
        index.insert(entry(0.75, 0.75, 1));
        assert_eq!(index.size(), 2);

        assert!(index.remove(&entry(0.25, 0.25, 0)));
        assert!(!index.remove(&entry(0.25, 0.25, 0)));
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn test_bulk_load_matches_incremental() {
        let entries: Vec<SlotEntry> = (0..100)
            .map(|i| entry(f64::from(i) / 100.0, f64::from(i % 10) / 10.0, i as usize))
            .collect();

        let bulk = DynamicIndex::load(entries.clone());

        let mut incremental = DynamicIndex::new();
        for e in entries {
            incremental.insert(e);
        }

        let mut from_bulk = bulk.range(0.2, 0.0, 0.4, 0.5);
        let mut from_incremental = incremental.range(0.2, 0.0, 0.4, 0.5);
        from_bulk.sort_unstable();
        from_incremental.sort_unstable();

        assert_eq!(from_bulk, from_incremental);
    }

    #[test]
    fn test_within_filters_by_distance() {
        let mut index = DynamicIndex::new();
        index.insert(entry(0.5, 0.5, 0));
        index.insert(entry(0.5, 0.6, 1));
        index.insert(entry(0.9, 0.9, 2));

        let mut found = index.within(0.5, 0.5, 0.15);
        found.sort_unstable();

        assert_eq!(found, vec![0, 1]);
    }

    #[test]
    fn test_padded_search_reaches_outside_the_box() {
        let mut index = DynamicIndex::new();
        index.insert(entry(0.55, 0.5, 0));

        assert!(index.range(0.0, 0.0, 0.5, 1.0).is_empty());
        assert_eq!(index.search_padded(0.0, 0.0, 0.5, 1.0, 0.1), vec![0]);
    }

    #[test]
    fn test_coincident_entries_are_distinct() {
        let mut index = DynamicIndex::new();
        index.insert(entry(0.5, 0.5, 0));
        index.insert(entry(0.5, 0.5, 1));

        let mut found = index.within(0.5, 0.5, 0.0);
        found.sort_unstable();
        assert_eq!(found, vec![0, 1]);

        assert!(index.remove(&entry(0.5, 0.5, 1)));
        assert_eq!(index.within(0.5, 0.5, 0.0), vec![0]);
    }
}
