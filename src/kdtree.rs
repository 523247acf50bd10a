//! # KD-tree module
//!
//! This module contains the static spatial index used by the immutable
//! engine: a KD-tree over a flat record array.
//!
//! Points are appended once, `build_index` partitions the array in place by
//! alternating-axis introselect, and node boundaries stay implicit: recursion
//! stops when a sub-range fits in one leaf block of `node_size` records, and
//! queries scan leaf blocks linearly. Query results are the ids points were
//! added with (their insertion order).

/// One indexed record: a projected position plus the insertion-order id.
#[derive(Clone, Copy, Debug)]
struct KdEntry {
    /// Projected X coordinate.
    x: f64,

    /// Projected Y coordinate.
    y: f64,

    /// Insertion-order id of the point.
    id: usize,
}

/// A static KD-tree over a flat array of 2-D points.
#[derive(Clone, Debug, Default)]
pub struct KdTree {
    /// Leaf block size; sub-ranges at most this long are scanned linearly.
    node_size: usize,

    /// The flat record array, partitioned in place by `build_index`.
    entries: Vec<KdEntry>,
}

impl KdTree {
    /// Create an empty tree sized for `count` points with the given leaf
    /// block size.
    pub fn new(count: usize, node_size: usize) -> Self {
        KdTree {
            node_size: node_size.max(1),
            entries: Vec::with_capacity(count),
        }
    }

    /// Append one point. Its id is the number of points added before it.
    pub fn add_point(&mut self, x: f64, y: f64) {
        let id = self.entries.len();
        self.entries.push(KdEntry { x, y, id });
    }

    /// Partition the record array into KD order. Must be called once, after
    /// the last `add_point` and before the first query.
    pub fn build_index(&mut self) {
        let node_size = self.node_size;
        sort_entries(&mut self.entries, node_size, true);
    }

    /// The number of indexed points.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree holds no points.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all points contained in the closed box
    /// `[min_x, max_x] × [min_y, max_y]`.
    pub fn range(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<usize> {
        let mut result = vec![];

        if self.entries.is_empty() {
            return result;
        }

        // (lo, hi) is a half-open range of the record array; the splitting
        // record of a non-leaf range sits at lo + (hi - lo) / 2, mirroring
        // the build.
        let mut stack = vec![(0, self.entries.len(), true)];

        while let Some((lo, hi, horizontal)) = stack.pop() {
            if hi - lo <= self.node_size {
                for entry in &self.entries[lo..hi] {
                    if entry.x >= min_x && entry.x <= max_x && entry.y >= min_y && entry.y <= max_y
                    {
                        result.push(entry.id);
                    }
                }
                continue;
            }

            let mid = lo + (hi - lo) / 2;
            let entry = &self.entries[mid];

            if entry.x >= min_x && entry.x <= max_x && entry.y >= min_y && entry.y <= max_y {
                result.push(entry.id);
            }

            let (low_bound, high_bound) = if horizontal {
                (min_x, max_x)
            } else {
                (min_y, max_y)
            };
            let split = if horizontal { entry.x } else { entry.y };

            if low_bound <= split {
                stack.push((lo, mid, !horizontal));
            }

            if high_bound >= split {
                stack.push((mid + 1, hi, !horizontal));
            }
        }

        result
    }

    /// Ids of all points within Euclidean distance `r` of `(x, y)`.
    pub fn within(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let mut result = vec![];

        if self.entries.is_empty() {
            return result;
        }

        let r2 = r * r;
        let mut stack = vec![(0, self.entries.len(), true)];

        while let Some((lo, hi, horizontal)) = stack.pop() {
            if hi - lo <= self.node_size {
                for entry in &self.entries[lo..hi] {
                    if squared_distance(entry.x, entry.y, x, y) <= r2 {
                        result.push(entry.id);
                    }
                }
                continue;
            }

            let mid = lo + (hi - lo) / 2;
            let entry = &self.entries[mid];

            if squared_distance(entry.x, entry.y, x, y) <= r2 {
                result.push(entry.id);
            }

            let (center, split) = if horizontal {
                (x, entry.x)
            } else {
                (y, entry.y)
            };

            if center - r <= split {
                stack.push((lo, mid, !horizontal));
            }

            if center + r >= split {
                stack.push((mid + 1, hi, !horizontal));
            }
        }

        result
    }
}

/// Squared Euclidean distance between two points.
pub(crate) fn squared_distance(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let dx = ax - bx;
    let dy = ay - by;

    dx * dx + dy * dy
}

/// Recursively partition a record range around its median, alternating the
/// split axis with depth. `select_nth_unstable_by` is an introselect, so the
/// build stays linearithmic with small constants.
fn sort_entries(entries: &mut [KdEntry], node_size: usize, horizontal: bool) {
    if entries.len() <= node_size {
        return;
    }

    let mid = entries.len() / 2;

    let (left, _, right) = if horizontal {
        entries.select_nth_unstable_by(mid, |a, b| a.x.total_cmp(&b.x))
    } else {
        entries.select_nth_unstable_by(mid, |a, b| a.y.total_cmp(&b.y))
    };

    sort_entries(left, node_size, !horizontal);
    sort_entries(right, node_size, !horizontal);
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn build_tree(points: &[(f64, f64)], node_size: usize) -> KdTree {
        let mut tree = KdTree::new(points.len(), node_size);

        for &(x, y) in points {
            tree.add_point(x, y);
        }

        tree.build_index();
        tree
    }

    fn random_points(count: usize, seed: u64) -> Vec<(f64, f64)> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        (0..count)
            .map(|_| (rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)))
            .collect()
    }

    #[test]
    fn test_empty_tree_queries() {
        let tree = build_tree(&[], 64);

        assert!(tree.is_empty());
        assert!(tree.range(0.0, 0.0, 1.0, 1.0).is_empty());
        assert!(tree.within(0.5, 0.5, 10.0).is_empty());
    }

    #[test]
    fn test_range_matches_linear_scan() {
        let points = random_points(500, 42);
        let boxes = [
            (0.1, 0.1, 0.4, 0.4),
            (0.0, 0.0, 1.0, 1.0),
            (0.25, 0.6, 0.3, 0.9),
            (0.8, 0.8, 0.80001, 0.80001),
        ];

        for node_size in [1, 8, 64] {
            let tree = build_tree(&points, node_size);

            for &(min_x, min_y, max_x, max_y) in &boxes {
                let mut found = tree.range(min_x, min_y, max_x, max_y);
                found.sort_unstable();

                let expected: Vec<usize> = points
                    .iter()
                    .enumerate()
                    .filter(|(_, &(x, y))| {
                        x >= min_x && x <= max_x && y >= min_y && y <= max_y
                    })
                    .map(|(id, _)| id)
                    .collect();

                assert_eq!(found, expected);
            }
        }
    }

    #[test]
    fn test_within_matches_linear_scan() {
        let points = random_points(500, 7);
        let probes = [(0.5, 0.5, 0.2), (0.05, 0.95, 0.1), (0.3, 0.3, 0.0)];

        for node_size in [1, 8, 64] {
            let tree = build_tree(&points, node_size);

            for &(x, y, r) in &probes {
                let mut found = tree.within(x, y, r);
                found.sort_unstable();

                let expected: Vec<usize> = points
                    .iter()
                    .enumerate()
                    .filter(|(_, &(px, py))| squared_distance(px, py, x, y) <= r * r)
                    .map(|(id, _)| id)
                    .collect();

                assert_eq!(found, expected);
            }
        }
    }

    #[test]
    fn test_within_includes_the_probe_point() {
        let points = [(0.2, 0.2), (0.9, 0.9)];
        let tree = build_tree(&points, 64);

        assert_eq!(tree.within(0.2, 0.2, 0.0), vec![0]);
    }

    #[test]
    fn test_duplicate_coordinates_are_all_reported() {
        let points = vec![(0.5, 0.5); 10];
        let tree = build_tree(&points, 2);

        let mut found = tree.within(0.5, 0.5, 0.01);
        found.sort_unstable();

        assert_eq!(found, (0..10).collect::<Vec<_>>());
    }
}
