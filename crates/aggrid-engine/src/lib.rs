//! aggrid-engine — cached grid aggregation with backend selection.
//!
//! One [`Engine`] owns the projected positions, the resolved grid and the
//! result buffers of a single aggregation target. Each call gets the caller's
//! [`ChangeFlags`] and redoes only the stages they invalidate.

use std::mem;
use std::time::Instant;

use aggrid_core::{
    normalize_channels, AggError, AggResult, AggregationResult, ChannelResult, ChannelSpec, Grid,
    PointSet, WeightChannel, ELEMENT_COUNT,
};
use aggrid_grid::{project_points, GridResolver, GridSpec, Identity, Projection};
use aggrid_reduce::{
    AggregateInput, Aggregator, Backend, ParallelAggregator, ParallelConfig, SequentialAggregator,
};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub parallel: ParallelConfig,
}

/// What changed since the previous call on the same engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlags {
    pub data_changed: bool,
    pub cell_size_changed: bool,
    /// Only relevant for screen-fitted grids.
    pub viewport_changed: bool,
    /// A channel's operation or weight columns changed.
    pub operation_changed: bool,
}

impl ChangeFlags {
    pub fn all() -> Self {
        Self { data_changed: true, cell_size_changed: true, viewport_changed: true, operation_changed: true }
    }
    pub fn none() -> Self { Self::default() }
    pub fn data() -> Self { Self { data_changed: true, ..Self::default() } }
    pub fn cell_size() -> Self { Self { cell_size_changed: true, ..Self::default() } }
    pub fn viewport() -> Self { Self { viewport_changed: true, ..Self::default() } }
    pub fn operation() -> Self { Self { operation_changed: true, ..Self::default() } }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendHint {
    /// Parallel when available, sequential otherwise.
    #[default]
    Auto,
    ForceSequential,
    /// Still falls back to sequential if the parallel backend can't run.
    ForceParallel,
}

/// One aggregation call.
#[derive(Copy, Clone)]
pub struct AggregationRequest<'a> {
    pub points: &'a PointSet,
    pub channels: &'a [ChannelSpec],
    pub grid: GridSpec,
    pub projection: &'a dyn Projection,
    pub backend: BackendHint,
    pub changes: ChangeFlags,
}

impl<'a> AggregationRequest<'a> {
    /// Identity projection, automatic backend, everything marked changed.
    pub fn new(points: &'a PointSet, channels: &'a [ChannelSpec], grid: GridSpec) -> Self {
        Self { points, channels, grid, projection: &Identity, backend: BackendHint::Auto, changes: ChangeFlags::all() }
    }
    pub fn projection(mut self, projection: &'a dyn Projection) -> Self { self.projection = projection; self }
    pub fn backend(mut self, backend: BackendHint) -> Self { self.backend = backend; self }
    pub fn changes(mut self, changes: ChangeFlags) -> Self { self.changes = changes; self }
}

/// View of the engine's current output. Valid until the next `aggregate` call.
#[derive(Copy, Clone, Debug)]
pub struct Aggregation<'e> {
    pub result: &'e AggregationResult,
    pub grid: &'e Grid,
    /// Grid dimensions differ from the previous call; grid-sized buffers need reallocating.
    pub grid_shape_changed: bool,
    /// False when the cached result was returned as is.
    pub recomputed: bool,
    pub backend: Backend,
}

/// Cell buffers keyed by length, so a grid shape that comes back reuses its allocation.
#[derive(Debug, Default)]
pub struct CellBufferPool {
    free: HashMap<usize, Vec<Vec<f32>>>,
}

impl CellBufferPool {
    const MAX_PER_LEN: usize = 8;

    pub fn new() -> Self { Self::default() }

    /// A buffer that last held `len` floats, or a fresh one with that capacity.
    pub fn take(&mut self, len: usize) -> Vec<f32> {
        self.free.get_mut(&len).and_then(Vec::pop).unwrap_or_else(|| Vec::with_capacity(len))
    }

    pub fn give(&mut self, buf: Vec<f32>) {
        if buf.capacity() == 0 { return; }
        let bucket = self.free.entry(buf.len()).or_default();
        if bucket.len() < Self::MAX_PER_LEN {
            bucket.push(buf);
        }
    }

    /// Pooled buffers across all lengths.
    pub fn len(&self) -> usize { self.free.values().map(Vec::len).sum() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

enum Probe {
    Untried,
    Ready(ParallelAggregator),
    Unavailable(AggError),
}

/// Inputs the cached result was computed from.
struct Cached {
    spec: GridSpec,
    channel_specs: Vec<ChannelSpec>,
    backend: Backend,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Plan {
    reproject: bool,
    regrid: bool,
    renormalize: bool,
    reaggregate: bool,
}

impl Plan {
    const FULL: Plan = Plan { reproject: true, regrid: true, renormalize: true, reaggregate: true };
}

pub struct Engine {
    config: EngineConfig,
    sequential: SequentialAggregator,
    probe: Probe,
    warned_fallback: bool,
    resolver: GridResolver,
    positions: Vec<[f64; 2]>,
    channels: Vec<WeightChannel>,
    grid: Grid,
    result: AggregationResult,
    pool: CellBufferPool,
    cached: Option<Cached>,
    recomputes: u64,
}

impl Default for Engine {
    fn default() -> Self { Self::new(EngineConfig::default()) }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sequential: SequentialAggregator,
            probe: Probe::Untried,
            warned_fallback: false,
            resolver: GridResolver::new(),
            positions: Vec::new(),
            channels: Vec::new(),
            grid: Grid::default(),
            result: AggregationResult::default(),
            pool: CellBufferPool::new(),
            cached: None,
            recomputes: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    /// Completed aggregations since construction.
    pub fn recompute_count(&self) -> u64 { self.recomputes }

    pub fn result(&self) -> &AggregationResult { &self.result }
    pub fn grid(&self) -> &Grid { &self.grid }
    pub fn pool(&self) -> &CellBufferPool { &self.pool }

    /// Drop the cached result; the next call recomputes everything.
    pub fn invalidate(&mut self) { self.cached = None; }

    /// Runs the parallel capability probe on first use.
    pub fn parallel_available(&mut self) -> bool {
        if let Probe::Untried = self.probe {
            self.probe = match ParallelAggregator::new(&self.config.parallel) {
                Ok(p) => Probe::Ready(p),
                Err(e) => Probe::Unavailable(e),
            };
        }
        matches!(self.probe, Probe::Ready(_))
    }

    fn select_backend(&mut self, hint: BackendHint) -> Backend {
        if hint == BackendHint::ForceSequential {
            return Backend::Sequential;
        }
        if self.parallel_available() {
            return Backend::Parallel;
        }
        if let (false, Probe::Unavailable(why)) = (self.warned_fallback, &self.probe) {
            log::warn!("{why}; falling back to sequential aggregation");
            self.warned_fallback = true;
        }
        Backend::Sequential
    }

    fn plan(&self, req: &AggregationRequest<'_>, backend: Backend) -> Plan {
        let Some(cached) = &self.cached else { return Plan::FULL };
        let mut c = req.changes;
        if cached.spec != req.grid {
            c.cell_size_changed = true;
        }
        if cached.channel_specs.as_slice() != req.channels {
            c.operation_changed = true;
        }
        if self.positions.len() != req.points.len() {
            c.data_changed = true;
        }
        let reproject = c.data_changed || (c.viewport_changed && req.grid.tracks_viewport());
        let regrid = reproject || c.cell_size_changed;
        let renormalize = c.operation_changed;
        Plan { reproject, regrid, renormalize, reaggregate: regrid || renormalize || backend != cached.backend }
    }

    /// Aggregate, reusing whatever the change flags leave valid.
    ///
    /// Invalid channels, missing weight columns, a degenerate cell size or a
    /// grid domain that is not finite or not addressable fail the call and
    /// drop the cache.
    ///
    /// # Panics
    /// On a non-finite weight value.
    pub fn aggregate(&mut self, req: AggregationRequest<'_>) -> AggResult<Aggregation<'_>> {
        let backend = self.select_backend(req.backend);
        let plan = self.plan(&req, backend);
        if !plan.reaggregate {
            return Ok(self.view(false, false, backend));
        }
        match self.run(&req, plan, backend) {
            Ok(shape_changed) => {
                self.recomputes += 1;
                self.cached = Some(Cached { spec: req.grid, channel_specs: req.channels.to_vec(), backend });
                Ok(self.view(shape_changed, true, backend))
            }
            Err(e) => {
                self.cached = None;
                Err(e)
            }
        }
    }

    fn run(&mut self, req: &AggregationRequest<'_>, plan: Plan, backend: Backend) -> AggResult<bool> {
        let t0 = Instant::now();
        if plan.renormalize {
            self.channels = normalize_channels(req.channels)?;
        }
        if plan.reproject {
            project_points(req.points, req.projection, &mut self.positions);
        }
        let mut shape_changed = false;
        if plan.regrid {
            let update = self.resolver.resolve(&req.grid, &self.positions)?;
            self.grid = update.grid;
            shape_changed = update.shape_changed;
        }

        self.shape_buffers(self.grid.checked_num_cells()?);
        let input = AggregateInput {
            positions: &self.positions,
            points: req.points,
            channels: &self.channels,
            grid: &self.grid,
        };
        let aggregator: &dyn Aggregator = match (&self.probe, backend) {
            (Probe::Ready(p), Backend::Parallel) => p,
            _ => &self.sequential,
        };
        aggregator.aggregate_into(&input, &mut self.result)?;

        log::debug!(
            "{:?} aggregation of {} points into {} cells x {} channels in {:.2?} ({:?})",
            backend,
            req.points.len(),
            self.grid.num_cells(),
            self.channels.len(),
            t0.elapsed(),
            plan
        );
        Ok(shape_changed)
    }

    /// Match the result's channel buffers to the channel list and grid size,
    /// swapping buffers of a superseded size through the pool.
    fn shape_buffers(&mut self, num_cells: usize) {
        let len = num_cells * ELEMENT_COUNT;
        let keep = self.channels.len().min(self.result.channels.len());
        for r in self.result.channels.drain(keep..) {
            self.pool.give(r.cells);
        }
        for r in self.result.channels.iter_mut() {
            if r.cells.len() != len {
                let old = mem::replace(&mut r.cells, self.pool.take(len));
                self.pool.give(old);
            }
        }
        for ch in &self.channels[keep..] {
            let cells = self.pool.take(len);
            self.result.channels.push(ChannelResult::new(ch, num_cells, cells));
        }
    }

    fn view(&self, grid_shape_changed: bool, recomputed: bool, backend: Backend) -> Aggregation<'_> {
        Aggregation { result: &self.result, grid: &self.grid, grid_shape_changed, recomputed, backend }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> PointSet {
        let mut p = PointSet::default();
        p.push_with(0.5, 0.5, &[("w", 2.0)]);
        p.push_with(1.5, 0.5, &[("w", 3.0)]);
        p
    }

    fn world() -> GridSpec {
        GridSpec::World { origin: [0.0, 0.0], width: 2.0, height: 1.0, cell_size: [1.0, 1.0] }
    }

    #[test]
    fn fallback_warns_once() {
        let cfg = EngineConfig { parallel: ParallelConfig { enabled: false, ..Default::default() } };
        let mut engine = Engine::new(cfg);
        let pts = points();
        let ch = [ChannelSpec::new("w", &["w"], "sum")];
        for flags in [ChangeFlags::all(), ChangeFlags::none(), ChangeFlags::none()] {
            let req = AggregationRequest::new(&pts, &ch, world()).backend(BackendHint::ForceParallel).changes(flags);
            let out = engine.aggregate(req).unwrap();
            assert_eq!(out.backend, Backend::Sequential);
        }
        assert!(engine.warned_fallback);
        assert!(!engine.parallel_available());
        assert_eq!(engine.recompute_count(), 1);
    }

    #[test]
    fn forced_sequential_skips_the_parallel_pool() {
        let mut engine = Engine::default();
        let pts = points();
        let ch = [ChannelSpec::count("n")];
        let req = AggregationRequest::new(&pts, &ch, world()).backend(BackendHint::ForceSequential);
        assert_eq!(engine.aggregate(req).unwrap().backend, Backend::Sequential);
        assert!(matches!(engine.probe, Probe::Untried));
        assert!(!engine.warned_fallback);
    }

    #[test]
    fn plan_follows_flags() {
        let mut engine = Engine::default();
        let pts = points();
        let ch = [ChannelSpec::count("n")];
        let screen = GridSpec::Screen { cell_size: [1.0, 1.0], world_origin: [0.0, 0.0] };
        engine.aggregate(AggregationRequest::new(&pts, &ch, screen)).unwrap();
        let be = engine.cached.as_ref().unwrap().backend;

        let plan = |e: &Engine, flags: ChangeFlags| e.plan(&AggregationRequest::new(&pts, &ch, screen).changes(flags), be);
        assert!(!plan(&engine, ChangeFlags::none()).reaggregate);
        assert_eq!(plan(&engine, ChangeFlags::viewport()), Plan { renormalize: false, ..Plan::FULL });
        assert_eq!(
            plan(&engine, ChangeFlags::cell_size()),
            Plan { reproject: false, regrid: true, renormalize: false, reaggregate: true }
        );
        assert_eq!(
            plan(&engine, ChangeFlags::operation()),
            Plan { reproject: false, regrid: false, renormalize: true, reaggregate: true }
        );
    }

    #[test]
    fn pool_recycles_by_length() {
        let mut pool = CellBufferPool::new();
        let mut a = pool.take(8);
        a.resize(8, 0.0);
        let ptr = a.as_ptr();
        pool.give(a);
        assert_eq!(pool.len(), 1);
        assert!(pool.take(4).capacity() >= 4);
        assert_eq!(pool.take(8).as_ptr(), ptr);
        assert!(pool.is_empty());
    }
}
