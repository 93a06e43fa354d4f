// THEORY:
// Operators do not think in (row, col). The analyzer names congested cells by
// which third of the frame they sit in ("Top-Left Zone", "Central Area"), and
// the grid overlay colours each cell by how crowded it is. Both rules live here
// so drill-down results speak the same language as the analyzer's alerts.

use crate::core_modules::analytics::{CellKey, GridDimensions};
use serde::Serialize;
use std::fmt;

/// Counts above this are shown as elevated.
pub const ELEVATED_DENSITY_THRESHOLD: u32 = 8;
/// Counts above this are shown as critical.
pub const CRITICAL_DENSITY_THRESHOLD: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityLevel {
    Normal,
    Elevated,
    Critical,
}

impl DensityLevel {
    pub fn classify(count: u32) -> Self {
        if count > CRITICAL_DENSITY_THRESHOLD {
            DensityLevel::Critical
        } else if count > ELEVATED_DENSITY_THRESHOLD {
            DensityLevel::Elevated
        } else {
            DensityLevel::Normal
        }
    }
}

impl fmt::Display for DensityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DensityLevel::Normal => "normal",
            DensityLevel::Elevated => "elevated",
            DensityLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Human name of the region a cell covers.
pub fn zone_name(cell: CellKey, dims: GridDimensions) -> String {
    let row_pos = third(cell.row, dims.rows, ["Top", "Middle", "Bottom"]);
    let col_pos = third(cell.col, dims.cols, ["Left", "Center", "Right"]);
    if row_pos == "Middle" && col_pos == "Center" {
        return "Central Area".to_string();
    }
    format!("{row_pos}-{col_pos} Zone")
}

fn third(index: u32, extent: u32, names: [&'static str; 3]) -> &'static str {
    let index = index as f64;
    let extent = extent as f64;
    if index < extent / 3.0 {
        names[0]
    } else if index >= extent * 2.0 / 3.0 {
        names[2]
    } else {
        names[1]
    }
}
