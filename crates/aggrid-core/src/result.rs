//! Aggregation output: dense per-cell slots plus per-channel global vectors.

use serde::{Deserialize, Serialize};

use crate::channel::{Operation, WeightChannel};

/// Slots per cell: 0..=2 aggregated components, 3 = point count.
pub const ELEMENT_COUNT: usize = 4;
/// Index of the count slot inside a cell record.
pub const COUNT_SLOT: usize = ELEMENT_COUNT - 1;

/// Per-channel result.
///
/// `cells` holds `num_cells * ELEMENT_COUNT` floats. `Mean` cells store the sum;
/// use [`ChannelResult::value`] to read the derived mean.
///
/// For `Mean` channels the global min, max and total are taken over the per-cell
/// means, so `global_total[c] / global_count[c]` is the unweighted mean of cell
/// means. The point-weighted mean is the sum of the stored cell sums divided by
/// `total_count()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelResult {
    pub id: String,
    pub operation: Operation,
    pub size: usize,
    pub need_min: bool,
    pub need_max: bool,
    pub cells: Vec<f32>,
    /// Slots `0..size`: min over non-empty cells. Slot 3: total point count.
    pub global_min: [f32; ELEMENT_COUNT],
    /// Slots `0..size`: max over non-empty cells. Slot 3: total point count.
    pub global_max: [f32; ELEMENT_COUNT],
    /// Slots `0..size`: sum over non-empty cells. Slot 3: total point count.
    pub global_total: [f32; ELEMENT_COUNT],
    /// Slots `0..size`: number of non-empty cells. Slot 3: total point count.
    pub global_count: [f32; ELEMENT_COUNT],
    /// Packed extrema when the channel combines them: `0..size` max, slot 3 min of component 0.
    pub min_max: Option<[f32; ELEMENT_COUNT]>,
}

impl ChannelResult {
    /// Result shell for `channel` backed by `cells`, reset to identity values.
    pub fn new(channel: &WeightChannel, num_cells: usize, cells: Vec<f32>) -> Self {
        let mut r = ChannelResult {
            id: channel.id.clone(),
            operation: channel.operation,
            size: channel.size,
            need_min: channel.need_min,
            need_max: channel.need_max,
            cells,
            global_min: [0.0; ELEMENT_COUNT],
            global_max: [0.0; ELEMENT_COUNT],
            global_total: [0.0; ELEMENT_COUNT],
            global_count: [0.0; ELEMENT_COUNT],
            min_max: None,
        };
        r.reset(channel, num_cells);
        r
    }

    /// Re-target this result at `channel` and fill every slot with its identity.
    /// Reuses the cell buffer's allocation.
    pub fn reset(&mut self, channel: &WeightChannel, num_cells: usize) {
        self.id.clone_from(&channel.id);
        self.operation = channel.operation;
        self.size = channel.size;
        self.need_min = channel.need_min;
        self.need_max = channel.need_max;

        let fill = channel.operation.identity();
        self.cells.clear();
        self.cells.resize(num_cells * ELEMENT_COUNT, fill);
        for slot in self.cells.chunks_exact_mut(ELEMENT_COUNT) {
            slot[COUNT_SLOT] = 0.0;
        }

        self.global_min = [f32::INFINITY, f32::INFINITY, f32::INFINITY, 0.0];
        self.global_max = [f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0];
        self.global_total = [0.0; ELEMENT_COUNT];
        self.global_count = [0.0; ELEMENT_COUNT];
        self.min_max = channel
            .combine_min_max
            .then_some([f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::INFINITY]);
    }

    pub fn num_cells(&self) -> usize { self.cells.len() / ELEMENT_COUNT }

    #[inline]
    pub fn count(&self, cell: usize) -> f32 { self.cells[cell * ELEMENT_COUNT + COUNT_SLOT] }

    /// Decoded cell value (`sum / count` for `Mean`); `None` for empty cells.
    pub fn value(&self, cell: usize, component: usize) -> Option<f32> {
        let slot = &self.cells[cell * ELEMENT_COUNT..(cell + 1) * ELEMENT_COUNT];
        (slot[COUNT_SLOT] > 0.0).then(|| decode(self.operation, slot, component))
    }

    pub fn non_empty_cells(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .chunks_exact(ELEMENT_COUNT)
            .enumerate()
            .filter(|(_, s)| s[COUNT_SLOT] > 0.0)
            .map(|(i, _)| i)
    }

    pub fn total_count(&self) -> f32 { self.global_count[COUNT_SLOT] }

    /// Copy packed extrema into `global_max[0..size]` and `global_min[0]`.
    pub fn unpack_min_max(&mut self) {
        if let Some(packed) = self.min_max {
            self.global_max[..self.size].copy_from_slice(&packed[..self.size]);
            self.global_min[0] = packed[COUNT_SLOT];
        }
    }
}

/// Read component `c` of a cell record, deriving the mean for `Mean` channels.
#[inline]
pub fn decode(op: Operation, slot: &[f32], c: usize) -> f32 {
    match op {
        Operation::Mean => slot[c] / slot[COUNT_SLOT],
        Operation::Sum | Operation::Min | Operation::Max => slot[c],
    }
}

/// All channel results of one aggregation, in channel order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub channels: Vec<ChannelResult>,
}

impl AggregationResult {
    pub fn channel(&self, id: &str) -> Option<&ChannelResult> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// True when no channel received any point.
    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(|c| c.total_count() == 0.0)
    }
}
