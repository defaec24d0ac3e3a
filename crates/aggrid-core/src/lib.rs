//! aggrid-core — core data model shared by the aggregation backends.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

mod channel;
mod error;
mod grid;
mod result;

pub use channel::{
    normalize_channels, ChannelSpec, ChannelWeights, Operation, WeightChannel, WeightSource,
    MAX_WEIGHT_SIZE,
};
pub use error::{AggError, AggResult};
pub use grid::{axis_index, Grid, MAX_CELLS};
pub use result::{decode, AggregationResult, ChannelResult, COUNT_SLOT, ELEMENT_COUNT};

/// Structure-of-Arrays point set.
/// Positions stay in two tight f64 columns; weight sources live in a name→column map.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct PointSet {
    pub x: Vec<f64>,
    pub y: Vec<f64>,

    /// Per-point scalar columns (same length as x/y).
    /// Weight channels reference these by name.
    pub attrs_f32: HashMap<String, Vec<f32>>,
}

impl PointSet {
    pub fn len(&self) -> usize { self.x.len() }
    pub fn is_empty(&self) -> bool { self.x.is_empty() }
    pub fn push(&mut self, px: f64, py: f64) {
        self.x.push(px); self.y.push(py);
    }
    pub fn reserve(&mut self, n: usize) {
        self.x.reserve(n); self.y.reserve(n);
        for v in self.attrs_f32.values_mut() { v.reserve(n); }
    }

    /// Push a point together with one value per named column.
    /// Columns are created on first use.
    pub fn push_with(&mut self, px: f64, py: f64, attrs: &[(&str, f32)]) {
        self.push(px, py);
        for (k, v) in attrs {
            self.attrs_f32.entry((*k).to_string()).or_default().push(*v);
        }
    }

    pub fn position(&self, i: usize) -> [f64; 2] { [self.x[i], self.y[i]] }

    pub fn positions(&self) -> impl Iterator<Item = [f64; 2]> + '_ {
        self.x.iter().zip(&self.y).map(|(&x, &y)| [x, y])
    }
}

/// Axis-aligned 2D bounding box.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb2 { pub min: [f64; 2], pub max: [f64; 2] }

impl Aabb2 {
    /// Bounding box of a position stream; `None` when the stream is empty.
    pub fn from_points<I: IntoIterator<Item = [f64; 2]>>(points: I) -> Option<Self> {
        let mut it = points.into_iter();
        let first = it.next()?;
        let mut bb = Aabb2 { min: first, max: first };
        for p in it {
            for i in 0..2 {
                bb.min[i] = bb.min[i].min(p[i]);
                bb.max[i] = bb.max[i].max(p[i]);
            }
        }
        Some(bb)
    }
    pub fn contains(&self, p: [f64; 2]) -> bool {
        (0..2).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
    pub fn width(&self) -> f64 { self.max[0] - self.min[0] }
    pub fn height(&self) -> f64 { self.max[1] - self.min[1] }
}
