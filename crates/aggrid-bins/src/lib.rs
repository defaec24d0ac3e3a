//! aggrid-bins — group points by an arbitrary bin id and keep the membership.
//!
//! The grid reducers only keep reduced scalars per cell. This crate is for the
//! consumers that also need to know which points landed in a bin (hexagonal or
//! geographic bins, picking, highlighting).

use std::hash::Hash;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

/// One non-empty bin.
#[derive(Clone, Debug, PartialEq)]
pub struct Bin<K> {
    pub id: K,
    /// Indices into the sorted data slice, in input order.
    pub points: Vec<usize>,
    /// Reducer output for the members.
    pub value: f64,
    pub count: usize,
}

/// Bins in first-seen order, plus extrema of their values.
#[derive(Clone, Debug)]
pub struct BinSorter<K> {
    bins: Vec<Bin<K>>,
    lookup: HashMap<K, usize>,
    min_value: f64,
    max_value: f64,
    total_count: usize,
}

impl<K: Hash + Eq + Clone> BinSorter<K> {
    /// Sort `data` into bins.
    ///
    /// `bin_id` returning `None` skips a point. Bins whose `reducer` output is
    /// `None` or not finite are left out of the result.
    pub fn new<T, B, R>(data: &[T], bin_id: B, reducer: R) -> Self
    where
        B: Fn(&T) -> Option<K>,
        R: Fn(&[&T]) -> Option<f64>,
    {
        let mut order: Vec<(K, Vec<usize>)> = Vec::new();
        let mut slot: HashMap<K, usize> = HashMap::new();
        for (i, item) in data.iter().enumerate() {
            let Some(key) = bin_id(item) else { continue };
            match slot.entry(key) {
                Entry::Occupied(o) => order[*o.get()].1.push(i),
                Entry::Vacant(v) => {
                    order.push((v.key().clone(), vec![i]));
                    v.insert(order.len() - 1);
                }
            }
        }

        let mut bins = Vec::with_capacity(order.len());
        let mut lookup = HashMap::with_capacity(order.len());
        let (mut min_value, mut max_value, mut total_count) = (f64::INFINITY, f64::NEG_INFINITY, 0);
        let mut members: Vec<&T> = Vec::new();
        for (id, points) in order {
            members.clear();
            members.extend(points.iter().map(|&i| &data[i]));
            let Some(value) = reducer(&members).filter(|v| v.is_finite()) else { continue };
            min_value = min_value.min(value);
            max_value = max_value.max(value);
            total_count += points.len();
            lookup.insert(id.clone(), bins.len());
            bins.push(Bin { id, count: points.len(), points, value });
        }

        Self { bins, lookup, min_value, max_value, total_count }
    }

    pub fn bins(&self) -> &[Bin<K>] { &self.bins }
    pub fn len(&self) -> usize { self.bins.len() }
    pub fn is_empty(&self) -> bool { self.bins.is_empty() }

    pub fn bin(&self, id: &K) -> Option<&Bin<K>> {
        self.lookup.get(id).map(|&i| &self.bins[i])
    }

    /// Smallest bin value; `+inf` without bins.
    pub fn min_value(&self) -> f64 { self.min_value }
    /// Largest bin value; `-inf` without bins.
    pub fn max_value(&self) -> f64 { self.max_value }
    /// Points across all kept bins.
    pub fn total_count(&self) -> usize { self.total_count }

    /// `[low, high]` of the bin values after trimming by percentiles
    /// (`[0, 100]` when `None`). Percentiles are clamped to `0..=100`.
    pub fn value_range(&self, percentiles: Option<[f64; 2]>) -> Option<[f64; 2]> {
        if self.bins.is_empty() {
            return None;
        }
        let [lo, hi] = percentiles.unwrap_or([0.0, 100.0]);
        let (lo, hi) = (lo.clamp(0.0, 100.0), hi.clamp(0.0, 100.0));

        let mut values: Vec<f64> = self.bins.iter().map(|b| b.value).collect();
        values.sort_by(f64::total_cmp);
        let last = (values.len() - 1) as f64;
        let lower = (lo / 100.0 * last).ceil() as usize;
        let upper = (hi / 100.0 * last).floor() as usize;
        let (a, b) = (values[lower], values[upper]);
        Some([a.min(b), a.max(b)])
    }
}
