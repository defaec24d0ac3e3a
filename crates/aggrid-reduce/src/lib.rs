//! aggrid-reduce — sequential and data-parallel grid reduction.
//!
//! Both backends produce the same [`AggregationResult`] layout: four slots per
//! cell (three weight components plus a point count) and per-channel global
//! vectors taken over non-empty cells. They share the blend operators and the
//! per-cell fragments defined here, so the only difference between them is
//! the order in which associative operators are applied.

use aggrid_core::{
    decode, AggResult, AggregationResult, ChannelResult, ChannelWeights, Grid, Operation,
    PointSet, WeightChannel, COUNT_SLOT, ELEMENT_COUNT,
};
use serde::{Deserialize, Serialize};

mod encode;
mod parallel;
mod sequential;

pub use encode::Precision;
pub use parallel::{ParallelAggregator, ParallelConfig};
pub use sequential::SequentialAggregator;

/// Which reduction backend produced a result.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend { Sequential, Parallel }

/// Inputs shared by both backends.
#[derive(Copy, Clone)]
pub struct AggregateInput<'a> {
    /// Grid-space positions, one per point of `points`.
    pub positions: &'a [[f64; 2]],
    /// Source of the weight columns.
    pub points: &'a PointSet,
    pub channels: &'a [WeightChannel],
    pub grid: &'a Grid,
}

/// A reduction backend.
pub trait Aggregator {
    fn backend(&self) -> Backend;

    /// Aggregate into `out`, reusing its buffers.
    ///
    /// Missing or misaligned weight columns are reported before any slot is
    /// touched.
    ///
    /// # Panics
    /// On a non-finite weight value.
    fn aggregate_into(&self, input: &AggregateInput<'_>, out: &mut AggregationResult) -> AggResult<()>;

    /// Convenience wrapper that allocates a fresh result.
    fn aggregate(&self, input: &AggregateInput<'_>) -> AggResult<AggregationResult> {
        let mut out = AggregationResult::default();
        self.aggregate_into(input, &mut out)?;
        Ok(out)
    }
}

/// Accumulation operators available to the reduction substrate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Min,
    Max,
    /// Max on the value slots, min on the last slot.
    MaxMin,
}

impl From<Operation> for BlendOp {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Sum | Operation::Mean => BlendOp::Add,
            Operation::Min => BlendOp::Min,
            Operation::Max => BlendOp::Max,
        }
    }
}

impl BlendOp {
    pub fn identity(self) -> [f32; ELEMENT_COUNT] {
        match self {
            BlendOp::Add => [0.0; ELEMENT_COUNT],
            BlendOp::Min => [f32::INFINITY; ELEMENT_COUNT],
            BlendOp::Max => [f32::NEG_INFINITY; ELEMENT_COUNT],
            BlendOp::MaxMin => [f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::INFINITY],
        }
    }

    #[inline]
    pub fn blend(self, dst: f32, src: f32) -> f32 {
        match self {
            BlendOp::Add => dst + src,
            BlendOp::Min => dst.min(src),
            BlendOp::Max | BlendOp::MaxMin => dst.max(src),
        }
    }

    #[inline]
    pub fn blend4(self, mut dst: [f32; ELEMENT_COUNT], src: [f32; ELEMENT_COUNT]) -> [f32; ELEMENT_COUNT] {
        for c in 0..COUNT_SLOT {
            dst[c] = self.blend(dst[c], src[c]);
        }
        dst[COUNT_SLOT] = match self {
            BlendOp::MaxMin => dst[COUNT_SLOT].min(src[COUNT_SLOT]),
            _ => self.blend(dst[COUNT_SLOT], src[COUNT_SLOT]),
        };
        dst
    }

    /// Merge one cell record into another: value slots by `self`, count additively.
    #[inline]
    pub fn merge_cell(self, dst: &mut [f32], src: &[f32]) {
        for c in 0..COUNT_SLOT {
            dst[c] = self.blend(dst[c], src[c]);
        }
        dst[COUNT_SLOT] += src[COUNT_SLOT];
    }
}

/// Fragments a non-empty cell contributes to each global reduction pass.
pub(crate) mod fragment {
    use super::*;

    fn values(op: Operation, size: usize, slot: &[f32], fill: f32) -> [f32; ELEMENT_COUNT] {
        let mut f = [fill; ELEMENT_COUNT];
        for (c, v) in f.iter_mut().enumerate().take(size) {
            *v = decode(op, slot, c);
        }
        f
    }

    pub fn count(size: usize, slot: &[f32]) -> [f32; ELEMENT_COUNT] {
        let mut f = [0.0; ELEMENT_COUNT];
        f[..size].fill(1.0);
        f[COUNT_SLOT] = slot[COUNT_SLOT];
        f
    }

    pub fn total(op: Operation, size: usize, slot: &[f32]) -> [f32; ELEMENT_COUNT] {
        let mut f = values(op, size, slot, 0.0);
        f[COUNT_SLOT] = slot[COUNT_SLOT];
        f
    }

    pub fn min(op: Operation, size: usize, slot: &[f32]) -> [f32; ELEMENT_COUNT] {
        values(op, size, slot, f32::INFINITY)
    }

    pub fn max(op: Operation, size: usize, slot: &[f32]) -> [f32; ELEMENT_COUNT] {
        values(op, size, slot, f32::NEG_INFINITY)
    }

    pub fn packed(op: Operation, size: usize, slot: &[f32]) -> [f32; ELEMENT_COUNT] {
        let mut f = values(op, size, slot, f32::NEG_INFINITY);
        f[COUNT_SLOT] = decode(op, slot, 0);
        f
    }
}

/// Which global passes a channel needs.
#[derive(Copy, Clone, Debug)]
pub(crate) struct GlobalPlan {
    pub min: bool,
    pub max: bool,
    pub packed: bool,
}

impl GlobalPlan {
    pub fn for_channel(ch: &ChannelResult) -> Self {
        let packed = ch.min_max.is_some();
        GlobalPlan { min: ch.need_min && !packed, max: ch.need_max && !packed, packed }
    }
}

/// Raw output of the global passes, before it is written into a result.
#[derive(Copy, Clone, Debug)]
pub(crate) struct GlobalVectors {
    pub count: [f32; ELEMENT_COUNT],
    pub total: [f32; ELEMENT_COUNT],
    pub min: Option<[f32; ELEMENT_COUNT]>,
    pub max: Option<[f32; ELEMENT_COUNT]>,
    pub packed: Option<[f32; ELEMENT_COUNT]>,
}

impl GlobalVectors {
    pub fn store(self, res: &mut ChannelResult) {
        let points = self.count[COUNT_SLOT];
        res.global_count = self.count;
        res.global_total = self.total;
        if let Some(min) = self.min { res.global_min = min; }
        if let Some(max) = self.max { res.global_max = max; }
        res.global_min[COUNT_SLOT] = points;
        res.global_max[COUNT_SLOT] = points;
        if self.packed.is_some() {
            res.min_max = self.packed;
            res.unpack_min_max();
        }
    }
}

/// Resolve every channel's weight columns. Fails before any buffer is touched.
pub(crate) fn bind_channels<'a>(input: &AggregateInput<'a>) -> AggResult<Vec<ChannelWeights<'a>>> {
    assert_eq!(
        input.positions.len(),
        input.points.len(),
        "projected positions out of sync with the point set"
    );
    input.channels.iter().map(|ch| ch.bind(input.points)).collect()
}

/// Shape `out` for `channels` over `num_cells`, reusing existing buffers.
pub fn prepare_result(out: &mut AggregationResult, channels: &[WeightChannel], num_cells: usize) {
    out.channels.truncate(channels.len());
    for (i, ch) in channels.iter().enumerate() {
        match out.channels.get_mut(i) {
            Some(res) => res.reset(ch, num_cells),
            None => out.channels.push(ChannelResult::new(ch, num_cells, Vec::new())),
        }
    }
}

#[inline]
pub(crate) fn check_weight(ch: &WeightChannel, point: usize, v: f32) {
    assert!(v.is_finite(), "channel '{}': non-finite weight {} at point {}", ch.id, v, point);
}
