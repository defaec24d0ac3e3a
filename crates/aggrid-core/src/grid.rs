//! Regular 2D grid shape.

use serde::{Deserialize, Serialize};

use crate::{AggError, AggResult, ELEMENT_COUNT};

/// Largest addressable grid. Cell ids travel as `u32` and `u32::MAX` marks a dropped point.
pub const MAX_CELLS: usize = (u32::MAX - 1) as usize;

/// Resolved grid: cell `i` spans `[origin + i*cell_size, origin + (i+1)*cell_size)` per axis.
/// Cells are laid out row-major: `index = col + row * num_col`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub num_col: usize,
    pub num_row: usize,
    pub cell_size: [f64; 2],
    pub origin: [f64; 2],
}

impl Grid {
    pub fn num_cells(&self) -> usize { self.num_col * self.num_row }

    /// Cell count, or `InvalidGrid` when the shape is not addressable or its
    /// `num_cells * ELEMENT_COUNT` buffer length overflows.
    pub fn checked_num_cells(&self) -> AggResult<usize> {
        self.num_col
            .checked_mul(self.num_row)
            .filter(|&n| n <= MAX_CELLS && n.checked_mul(ELEMENT_COUNT).is_some())
            .ok_or_else(|| {
                AggError::invalid_grid(format!("{}x{} cells exceed the addressable grid", self.num_col, self.num_row))
            })
    }

    pub fn shape(&self) -> (usize, usize) { (self.num_col, self.num_row) }

    /// Cell index of a grid-space position; `None` outside the grid.
    #[inline]
    pub fn cell_of(&self, p: [f64; 2]) -> Option<usize> {
        let col = axis_index(p[0], self.origin[0], self.cell_size[0]);
        let row = axis_index(p[1], self.origin[1], self.cell_size[1]);
        self.index_of(col, row)
    }

    /// Bounds-checked index of a fractional `(col, row)` pair already floored.
    #[inline]
    pub fn index_of(&self, col: f64, row: f64) -> Option<usize> {
        // NaN fails both comparisons and is dropped too.
        if col >= 0.0 && row >= 0.0 && col < self.num_col as f64 && row < self.num_row as f64 {
            Some(col as usize + row as usize * self.num_col)
        } else {
            None
        }
    }

    pub fn cell_coords(&self, index: usize) -> (usize, usize) {
        (index % self.num_col, index / self.num_col)
    }

    /// `(min, max)` corners of a cell.
    pub fn cell_bounds(&self, index: usize) -> ([f64; 2], [f64; 2]) {
        let (c, r) = self.cell_coords(index);
        let min = [
            self.origin[0] + c as f64 * self.cell_size[0],
            self.origin[1] + r as f64 * self.cell_size[1],
        ];
        (min, [min[0] + self.cell_size[0], min[1] + self.cell_size[1]])
    }
}

/// Floored cell index of `v` along one axis, measured against the same
/// `origin + i * cell` edges that `Grid::cell_bounds` reports. The division
/// alone can round across an edge when `cell` is not exactly representable.
#[inline]
pub fn axis_index(v: f64, origin: f64, cell: f64) -> f64 {
    let i = ((v - origin) / cell).floor();
    if v < origin + i * cell {
        i - 1.0
    } else if v >= origin + (i + 1.0) * cell {
        i + 1.0
    } else {
        i
    }
}
