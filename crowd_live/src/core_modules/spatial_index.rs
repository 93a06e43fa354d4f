// THEORY:
// The spatial index turns "the operator clicked here" into "the operator wants
// cell (row, col)", and answers with that cell's recent history. It is the
// read side of the per-cell memory the reconciler writes into.
//
// Key principles:
// 1.  **Current grid only**: a click resolves against the grid dimensions the
//     analyzer reported last. Without dimensions nothing resolves.
// 2.  **Local reads**: drill-down never talks to the analyzer. Everything it
//     returns was already accumulated from the live stream.
// 3.  **Bounded memory**: each cell keeps at most the last N observations, oldest
//     evicted first, created lazily the first time the cell is seen.

use crate::core_modules::analytics::{CellKey, GridDimensions};
use crate::core_modules::bounded_fifo::BoundedFifo;
use crate::core_modules::zones::{DensityLevel, zone_name};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_CELL_HISTORY_CAPACITY: usize = 50;

/// Screen rectangle of the element the live frame is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerBounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl ContainerBounds {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// A container with its origin at (0, 0).
    pub fn sized(width: f64, height: f64) -> Self {
        Self::new(0.0, 0.0, width, height)
    }
}

/// Maps a pointer position to the grid cell underneath it.
///
/// Returns `None` when no grid is known yet, when the container has no area,
/// or when the pointer lies outside the container.
pub fn resolve(
    pointer_x: f64,
    pointer_y: f64,
    bounds: ContainerBounds,
    dims: Option<GridDimensions>,
) -> Option<CellKey> {
    let dims = dims?;
    if !(bounds.width > 0.0 && bounds.height > 0.0) {
        return None;
    }

    let x = pointer_x - bounds.left;
    let y = pointer_y - bounds.top;
    if !(0.0..bounds.width).contains(&x) || !(0.0..bounds.height).contains(&y) {
        return None;
    }

    let row = (y / (bounds.height / dims.rows as f64)).floor() as u32;
    let col = (x / (bounds.width / dims.cols as f64)).floor() as u32;
    let cell = CellKey::new(row.min(dims.rows - 1), col.min(dims.cols - 1));
    Some(cell)
}

/// Per-cell rolling history of observed counts.
#[derive(Debug, Clone, PartialEq)]
pub struct CellHistory {
    cells: HashMap<CellKey, BoundedFifo<u32>>,
    capacity: usize,
}

impl CellHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: HashMap::new(),
            capacity,
        }
    }

    pub fn record(&mut self, cell: CellKey, count: u32) {
        let capacity = self.capacity;
        self.cells
            .entry(cell)
            .or_insert_with(|| BoundedFifo::new(capacity))
            .push(count);
    }

    /// Records a whole `grid[row][col]` observation. With known dimensions,
    /// cells outside them are skipped; returns how many were.
    pub fn record_grid(&mut self, grid: &[Vec<u32>], dims: Option<GridDimensions>) -> usize {
        let mut skipped = 0;
        for (row, counts) in grid.iter().enumerate() {
            for (col, &count) in counts.iter().enumerate() {
                let cell = CellKey::new(row as u32, col as u32);
                if dims.is_some_and(|dims| !dims.contains(cell)) {
                    skipped += 1;
                    continue;
                }
                self.record(cell, count);
            }
        }
        skipped
    }

    /// Observed counts for `cell`, oldest first. Empty if never observed.
    pub fn history_for(&self, cell: CellKey) -> Vec<u32> {
        self.cells.get(&cell).map(BoundedFifo::to_vec).unwrap_or_default()
    }

    pub fn observed_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

impl Default for CellHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_HISTORY_CAPACITY)
    }
}

/// Everything the drill-down view shows for one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellDrillDown {
    pub cell: CellKey,
    pub zone: String,
    pub history: Vec<u32>,
    pub latest: Option<u32>,
    pub peak: Option<u32>,
    pub mean: Option<f64>,
    pub level: Option<DensityLevel>,
}

impl CellDrillDown {
    pub fn new(cell: CellKey, dims: GridDimensions, history: Vec<u32>) -> Self {
        let latest = history.last().copied();
        let peak = history.iter().copied().max();
        let mean = (!history.is_empty())
            .then(|| history.iter().map(|&c| c as f64).sum::<f64>() / history.len() as f64);
        Self {
            cell,
            zone: zone_name(cell, dims),
            latest,
            peak,
            mean,
            level: latest.map(DensityLevel::classify),
            history,
        }
    }
}
