//! Data-parallel scatter-accumulate followed by full-grid reduction passes.
//!
//! Stage 1 maps every point to a cell id. Stage 2 splits the points into at
//! most one contiguous task per pool thread, scatters each task's weights into
//! its own partial target and merges the partials with the channel's blend
//! operator. Stage 3 reduces the merged target to global vectors, one
//! pass per operator. Each stage is a rayon call that returns only after all of
//! its work has finished, so no later stage ever sees a partial target.

use aggrid_core::{
    AggError, AggResult, AggregationResult, ChannelResult, ChannelWeights, Operation,
    WeightChannel, COUNT_SLOT, ELEMENT_COUNT,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::encode::{cell_id, DROPPED};
use crate::{
    bind_channels, check_weight, fragment, prepare_result, AggregateInput, Aggregator, Backend,
    BlendOp, GlobalPlan, GlobalVectors, Precision,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Setting this to false makes the capability probe fail.
    pub enabled: bool,
    /// Worker threads; 0 lets rayon pick.
    pub num_threads: usize,
    /// Lower bound on points handled by one scatter task.
    pub min_points_per_task: usize,
    pub precision: Precision,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { enabled: true, num_threads: 0, min_points_per_task: 4096, precision: Precision::Double }
    }
}

/// Rayon-backed reduction on a dedicated thread pool.
pub struct ParallelAggregator {
    pool: rayon::ThreadPool,
    min_len: usize,
    precision: Precision,
}

impl ParallelAggregator {
    /// Capability probe: builds the worker pool or reports why it can't.
    pub fn new(cfg: &ParallelConfig) -> AggResult<Self> {
        if !cfg.enabled {
            return Err(AggError::backend("disabled by configuration"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.num_threads)
            .thread_name(|i| format!("aggrid-reduce-{i}"))
            .build()
            .map_err(AggError::backend)?;
        log::debug!("parallel backend ready: {} threads, {:?} positions", pool.current_num_threads(), cfg.precision);
        Ok(Self { pool, min_len: cfg.min_points_per_task.max(1), precision: cfg.precision })
    }

    pub fn num_threads(&self) -> usize { self.pool.current_num_threads() }

    pub fn precision(&self) -> Precision { self.precision }
}

impl Aggregator for ParallelAggregator {
    fn backend(&self) -> Backend { Backend::Parallel }

    fn aggregate_into(&self, input: &AggregateInput<'_>, out: &mut AggregationResult) -> AggResult<()> {
        let weights = bind_channels(input)?;
        let grid = input.grid;
        let num_cells = grid.checked_num_cells()?;
        prepare_result(out, input.channels, num_cells);

        let (precision, min_len) = (self.precision, self.min_len);
        let task = task_len(input.positions.len(), self.pool.current_num_threads(), min_len);
        self.pool.install(|| {
            let cells: Vec<u32> = input
                .positions
                .par_iter()
                .with_min_len(min_len)
                .map(|&p| cell_id(p, grid, precision))
                .collect();

            for (k, res) in out.channels.iter_mut().enumerate() {
                scatter(&input.channels[k], &weights[k], &cells, task, &mut res.cells);
                let globals = reduce_globals(res);
                globals.store(res);
            }
        });
        Ok(())
    }
}

fn empty_target(op: Operation, len: usize) -> Vec<f32> {
    let mut t = vec![op.identity(); len];
    for slot in t.chunks_exact_mut(ELEMENT_COUNT) {
        slot[COUNT_SLOT] = 0.0;
    }
    t
}

/// Points per scatter task: at most one task (and one partial target) per
/// thread. Only the last task may hold fewer than `min_len` points.
fn task_len(num_points: usize, threads: usize, min_len: usize) -> usize {
    num_points.div_ceil(threads.max(1)).max(min_len).max(1)
}

/// Scatter one channel into `target` (already reset to identity).
fn scatter(ch: &WeightChannel, w: &ChannelWeights<'_>, cells: &[u32], task: usize, target: &mut [f32]) {
    let op = BlendOp::from(ch.operation);
    let len = target.len();
    let merged = cells
        .par_chunks(task)
        .enumerate()
        .map(|(t, chunk)| {
            let mut acc = empty_target(ch.operation, len);
            for (j, &cell) in chunk.iter().enumerate() {
                if cell == DROPPED { continue; }
                let i = t * task + j;
                let base = cell as usize * ELEMENT_COUNT;
                for c in 0..ch.size {
                    let v = w.get(i, c);
                    check_weight(ch, i, v);
                    acc[base + c] = op.blend(acc[base + c], v);
                }
                acc[base + COUNT_SLOT] += 1.0;
            }
            acc
        })
        .reduce_with(|mut a, b| {
            for (dst, src) in a.chunks_exact_mut(ELEMENT_COUNT).zip(b.chunks_exact(ELEMENT_COUNT)) {
                op.merge_cell(dst, src);
            }
            a
        });
    // readback
    if let Some(t) = merged {
        target.copy_from_slice(&t);
    }
}

type Fragment = fn(Operation, usize, &[f32]) -> [f32; ELEMENT_COUNT];

fn reduce_pass(res: &ChannelResult, blend: BlendOp, frag: Fragment) -> [f32; ELEMENT_COUNT] {
    let (op, size) = (res.operation, res.size);
    res.cells
        .par_chunks_exact(ELEMENT_COUNT)
        .filter(|slot| slot[COUNT_SLOT] > 0.0)
        .map(|slot| frag(op, size, slot))
        .reduce(|| blend.identity(), |a, b| blend.blend4(a, b))
}

fn reduce_globals(res: &ChannelResult) -> GlobalVectors {
    let plan = GlobalPlan::for_channel(res);
    GlobalVectors {
        count: reduce_pass(res, BlendOp::Add, |_, size, slot| fragment::count(size, slot)),
        total: reduce_pass(res, BlendOp::Add, fragment::total),
        min: plan.min.then(|| reduce_pass(res, BlendOp::Min, fragment::min)),
        max: plan.max.then(|| reduce_pass(res, BlendOp::Max, fragment::max)),
        packed: plan.packed.then(|| reduce_pass(res, BlendOp::MaxMin, fragment::packed)),
    }
}
