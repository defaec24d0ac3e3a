//! aggrid-grid — grid geometry: projection into grid space, cell alignment, grid shape.

use aggrid_core::{axis_index, Aabb2, AggError, AggResult, Grid, PointSet, MAX_CELLS};
use nalgebra::{Affine2, Point2};
use serde::{Deserialize, Serialize};

/// Maps a point position into the grid's coordinate space.
/// The projection itself is owned by the caller.
pub trait Projection {
    fn project(&self, p: [f64; 2]) -> [f64; 2];
}

/// Positions are already in grid space.
#[derive(Copy, Clone, Debug, Default)]
pub struct Identity;

impl Projection for Identity {
    fn project(&self, p: [f64; 2]) -> [f64; 2] { p }
}

/// Affine grid transform (scale/rotate/translate into grid space).
impl Projection for Affine2<f64> {
    fn project(&self, p: [f64; 2]) -> [f64; 2] {
        let q = self.transform_point(&Point2::new(p[0], p[1]));
        [q.x, q.y]
    }
}

impl<F: Fn([f64; 2]) -> [f64; 2] + Sync> Projection for F {
    fn project(&self, p: [f64; 2]) -> [f64; 2] { self(p) }
}

/// Project every position once into `out` (cleared first; allocation reused).
pub fn project_points(points: &PointSet, proj: &dyn Projection, out: &mut Vec<[f64; 2]>) {
    out.clear();
    out.reserve(points.len());
    out.extend(points.positions().map(|p| proj.project(p)));
}

/// How the grid's domain is chosen.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GridSpec {
    /// Fixed domain in projected space, independent of the data and of the view.
    World { origin: [f64; 2], width: f64, height: f64, cell_size: [f64; 2] },
    /// Fitted to the bounding box of the projected points; follows the viewport.
    Screen { cell_size: [f64; 2], world_origin: [f64; 2] },
}

impl GridSpec {
    pub fn cell_size(&self) -> [f64; 2] {
        match *self {
            GridSpec::World { cell_size, .. } | GridSpec::Screen { cell_size, .. } => cell_size,
        }
    }

    /// Whether a viewport change invalidates the grid.
    pub fn tracks_viewport(&self) -> bool { matches!(self, GridSpec::Screen { .. }) }

    fn validate(&self) -> AggResult<()> {
        let [w, h] = self.cell_size();
        if !(w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0) {
            return Err(AggError::InvalidCellSize(w, h));
        }
        match *self {
            GridSpec::World { origin, width, height, .. } => {
                if !(origin[0].is_finite() && origin[1].is_finite()) {
                    return Err(AggError::invalid_grid(format!("origin {origin:?} is not finite")));
                }
                if !(width.is_finite() && height.is_finite() && width >= 0.0 && height >= 0.0) {
                    return Err(AggError::invalid_grid(format!("extent {width} x {height}")));
                }
            }
            GridSpec::Screen { world_origin, .. } => {
                if !(world_origin[0].is_finite() && world_origin[1].is_finite()) {
                    return Err(AggError::invalid_grid(format!("world origin {world_origin:?} is not finite")));
                }
            }
        }
        Ok(())
    }
}

/// Round `v` down to the nearest multiple of `cell`.
pub fn align_to_cell(v: f64, cell: f64) -> f64 {
    (v / cell).floor() * cell
}

/// Compute the grid for `spec` over already-projected positions.
pub fn resolve_grid(spec: &GridSpec, positions: &[[f64; 2]]) -> AggResult<Grid> {
    spec.validate()?;
    let grid = match *spec {
        GridSpec::World { origin, width, height, cell_size } => Grid {
            num_col: span_cells(width, cell_size[0])?,
            num_row: span_cells(height, cell_size[1])?,
            cell_size,
            origin,
        },
        GridSpec::Screen { cell_size, world_origin } => {
            let finite = positions.iter().copied().filter(|p| p[0].is_finite() && p[1].is_finite());
            match Aabb2::from_points(finite) {
                None => Grid { num_col: 0, num_row: 0, cell_size, origin: world_origin },
                Some(bb) => {
                    let mut origin = [0.0; 2];
                    let mut counts = [0usize; 2];
                    for i in 0..2 {
                        let mut o = align_to_cell(bb.min[i] - world_origin[i], cell_size[i]) + world_origin[i];
                        // guard against the aligned corner rounding past the minimum
                        if o > bb.min[i] { o -= cell_size[i]; }
                        origin[i] = o;
                        counts[i] = axis_count(axis_index(bb.max[i], o, cell_size[i]) + 1.0)?;
                    }
                    Grid { num_col: counts[0], num_row: counts[1], cell_size, origin }
                }
            }
        }
    };
    grid.checked_num_cells()?;
    Ok(grid)
}

fn span_cells(extent: f64, cell: f64) -> AggResult<usize> {
    if extent > 0.0 { axis_count((extent / cell).ceil()) } else { Ok(0) }
}

/// Convert a per-axis cell count, refusing values no grid could address.
fn axis_count(n: f64) -> AggResult<usize> {
    if n >= 0.0 && n <= MAX_CELLS as f64 {
        Ok(n as usize)
    } else {
        Err(AggError::invalid_grid(format!("{n} cells along one axis")))
    }
}

/// Outcome of a resolve pass.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GridUpdate {
    pub grid: Grid,
    /// `(num_col, num_row)` differs from the previous grid (or there was none).
    pub shape_changed: bool,
}

/// Remembers the last resolved grid so callers know when grid-sized buffers go stale.
#[derive(Clone, Debug, Default)]
pub struct GridResolver {
    last: Option<Grid>,
}

impl GridResolver {
    pub fn new() -> Self { Self::default() }

    pub fn current(&self) -> Option<&Grid> { self.last.as_ref() }

    pub fn resolve(&mut self, spec: &GridSpec, positions: &[[f64; 2]]) -> AggResult<GridUpdate> {
        let grid = resolve_grid(spec, positions)?;
        let shape_changed = self.last.map_or(true, |g| g.shape() != grid.shape());
        if shape_changed {
            log::debug!(
                "grid shape {}x{} (cell {:?}, origin {:?})",
                grid.num_col, grid.num_row, grid.cell_size, grid.origin
            );
        }
        self.last = Some(grid);
        Ok(GridUpdate { grid, shape_changed })
    }
}
