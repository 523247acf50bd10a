//! # Aggregation module
//!
//! The protocol by which caller-defined per-point properties are folded into
//! per-cluster aggregates as clusters form and merge.
//!
//! Two independent channels exist and may be combined freely:
//!
//! - a map/reduce pair ([`MapReduce`]): `map` derives a fresh aggregate from
//!   a point, `reduce` merges one aggregate into another in place;
//! - a monoid-style extractor ([`ClusterData`] plus an extraction closure):
//!   `combine` returns a new value, leaving both inputs untouched.

/// Cluster payload that merges by returning a new value.
///
/// `combine` must be associative and commutative: children are merged in
/// implementation-defined order, and sub-aggregates recombine during mutable
/// updates.
pub trait ClusterData: Clone {
    /// Merge `other` into `self`, producing the combined value.
    fn combine(&self, other: &Self) -> Self;
}

impl ClusterData for () {
    fn combine(&self, _other: &Self) -> Self {}
}

/// Derives a per-point aggregate from a point of type `P`.
pub type MapFn<P, A> = Box<dyn Fn(&P) -> A>;

/// Merges the second aggregate into the first, in place.
pub type ReduceFn<A> = Box<dyn Fn(&mut A, &A)>;

/// Extracts a [`ClusterData`] payload from a point of type `P`.
pub type ExtractFn<P, D> = Box<dyn Fn(&P) -> D>;

/// A map/reduce callback pair.
///
/// `map` is called once per leaf and must return a fresh, independently
/// owned value; the engine mutates the returned aggregates freely. `reduce`
/// merges its second argument into its first and must be associative and
/// commutative. Ownership enforces the rest of the contract: `reduce`
/// receives the right-hand aggregate by shared reference and cannot alter it.
pub struct MapReduce<P, A> {
    /// Produces the initial aggregate for one point.
    pub map: MapFn<P, A>,

    /// Folds another aggregate into the accumulator.
    pub reduce: ReduceFn<A>,
}

impl<P, A> MapReduce<P, A> {
    /// Create a map/reduce pair from the two callbacks.
    pub fn new(
        map: impl Fn(&P) -> A + 'static,
        reduce: impl Fn(&mut A, &A) + 'static,
    ) -> Self {
        MapReduce {
            map: Box::new(map),
            reduce: Box::new(reduce),
        }
    }
}

/// The aggregation capability bundle handed to an engine at construction.
///
/// Both channels default to disabled; a cluster carries a payload for each
/// configured channel and `None` for the rest.
pub struct Aggregation<P, A, D> {
    /// Optional map/reduce pair.
    pub map_reduce: Option<MapReduce<P, A>>,

    /// Optional monoid-style extractor.
    pub extractor: Option<ExtractFn<P, D>>,
}

impl<P, A, D> Aggregation<P, A, D> {
    /// An aggregation bundle with both channels disabled.
    pub fn none() -> Self {
        Aggregation {
            map_reduce: None,
            extractor: None,
        }
    }

    /// An aggregation bundle carrying only a map/reduce pair.
    pub fn map_reduce(
        map: impl Fn(&P) -> A + 'static,
        reduce: impl Fn(&mut A, &A) + 'static,
    ) -> Self {
        Aggregation {
            map_reduce: Some(MapReduce::new(map, reduce)),
            extractor: None,
        }
    }

    /// An aggregation bundle carrying only a monoid-style extractor.
    pub fn extractor(extract: impl Fn(&P) -> D + 'static) -> Self {
        Aggregation {
            map_reduce: None,
            extractor: Some(Box::new(extract)),
        }
    }

    /// Attach a monoid-style extractor to this bundle.
    pub fn with_extractor(mut self, extract: impl Fn(&P) -> D + 'static) -> Self {
        self.extractor = Some(Box::new(extract));
        self
    }

    /// The initial map/reduce aggregate for one point, if the channel is on.
    pub(crate) fn map_point(&self, point: &P) -> Option<A> {
        self.map_reduce.as_ref().map(|mr| (mr.map)(point))
    }

    /// Fold `other` into `acc` through the reduce callback.
    pub(crate) fn reduce_into(&self, acc: &mut Option<A>, other: Option<&A>) {
        if let (Some(mr), Some(acc), Some(other)) = (self.map_reduce.as_ref(), acc.as_mut(), other)
        {
            (mr.reduce)(acc, other);
        }
    }

    /// The initial monoid payload for one point, if the channel is on.
    pub(crate) fn extract_point(&self, point: &P) -> Option<D>
    where
        D: ClusterData,
    {
        self.extractor.as_ref().map(|extract| extract(point))
    }

    /// Combine `other` into `acc` through the monoid payload.
    pub(crate) fn combine_into(&self, acc: &mut Option<D>, other: Option<&D>)
    where
        D: ClusterData,
    {
        if let (Some(acc), Some(other)) = (acc.as_mut(), other) {
            *acc = acc.combine(other);
        }
    }
}

impl<P> Aggregation<P, (), ()> {
    /// Shorthand for an engine without aggregation, fixing both payload
    /// types to `()`.
    pub fn disabled() -> Self {
        Aggregation::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct SumCount {
        sum: i64,
        count: u32,
    }

    fn sum_count_aggregation() -> Aggregation<i64, SumCount, ()> {
        Aggregation::map_reduce(
            |value: &i64| SumCount {
                sum: *value,
                count: 1,
            },
            |acc, other| {
                acc.sum += other.sum;
                acc.count += other.count;
            },
        )
    }

    #[test]
    fn test_map_reduce_folding() {
        let aggregation = sum_count_aggregation();

        let mut acc = aggregation.map_point(&100);
        let b = aggregation.map_point(&150);
        let c = aggregation.map_point(&200);

        aggregation.reduce_into(&mut acc, b.as_ref());
        aggregation.reduce_into(&mut acc, c.as_ref());

        assert_eq!(acc, Some(SumCount { sum: 450, count: 3 }));
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Earliest(u64);

    impl ClusterData for Earliest {
        fn combine(&self, other: &Self) -> Self {
            Earliest(self.0.min(other.0))
        }
    }

    #[test]
    fn test_extractor_combining() {
        let aggregation: Aggregation<(f64, f64, u64), (), Earliest> =
            Aggregation::extractor(|point: &(f64, f64, u64)| Earliest(point.2));

        let mut acc = aggregation.extract_point(&(0.0, 0.0, 7));
        let other = aggregation.extract_point(&(1.0, 1.0, 3));
        aggregation.combine_into(&mut acc, other.as_ref());

        assert_eq!(acc, Some(Earliest(3)));
    }

    #[test]
    fn test_disabled_channels_stay_none() {
        let aggregation: Aggregation<i64, SumCount, ()> = Aggregation::none();

        assert!(aggregation.map_point(&1).is_none());

        let mut acc = None;
        aggregation.reduce_into(&mut acc, None);
        assert!(acc.is_none());
    }
}
