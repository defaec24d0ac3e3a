//! Vertex-stage position handling for the parallel path: full f64 or single f32 words.

use aggrid_core::Grid;
use serde::{Deserialize, Serialize};

/// Numeric precision of positions in the vertex stage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    /// One f32 per coordinate; cell ids computed in f32 arithmetic.
    Single,
    /// Positions stay f64 and bin exactly like the sequential backend.
    #[default]
    Double,
}

/// Sentinel for points that fall outside the grid.
pub(crate) const DROPPED: u32 = u32::MAX;

/// Per-point vertex stage: map a position to a cell id.
#[inline]
pub(crate) fn cell_id(p: [f64; 2], grid: &Grid, precision: Precision) -> u32 {
    let cell = match precision {
        Precision::Double => grid.cell_of(p),
        Precision::Single => {
            let col = ((p[0] as f32 - grid.origin[0] as f32) / grid.cell_size[0] as f32).floor();
            let row = ((p[1] as f32 - grid.origin[1] as f32) / grid.cell_size[1] as f32).floor();
            grid.index_of(col as f64, row as f64)
        }
    };
    cell.map_or(DROPPED, |c| c as u32)
}
