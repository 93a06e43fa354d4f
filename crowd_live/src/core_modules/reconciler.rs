// THEORY:
// The reconciler is the heart of the live client. The analyzer answers at its
// own pace, skips its heavy stages on most frames and never refers back to a
// particular frame, so the client cannot treat messages as replies. Instead it
// folds each message, in arrival order, into one consistent render state.
//
// Key architectural principles:
// 1.  **Absence means unchanged**: a field missing from a payload never resets
//     anything. Only fields that are present are merged.
// 2.  **Per-field merge rules**: scalar snapshots (count, heatmap, prediction,
//     grid) are last-write-wins; rolling series (count history, alert logs,
//     per-cell history) append and then evict their oldest entries.
// 3.  **Atomic merges**: the whole payload is applied inside a single
//     `watch::Sender::send_modify`, so a reader borrowing the state sees either
//     everything from a payload or nothing from it. There is exactly one writer.
// 4.  **History lives for the session**: per-cell history is only dropped by a
//     session reset. New grid dimensions replace the old ones and nothing else.

use crate::core_modules::analytics::{
    Alert, AnalyticsPayload, CellKey, CountPoint, GridDimensions, ImageRef, Prediction,
};
use crate::core_modules::bounded_fifo::BoundedFifo;
use crate::core_modules::spatial_index::{
    CellDrillDown, CellHistory, ContainerBounds, DEFAULT_CELL_HISTORY_CAPACITY, resolve,
};
use crate::core_modules::zones::DensityLevel;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Caps of every rolling buffer in the render state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCapacities {
    pub count_history: usize,
    /// The log shown next to the live feed.
    pub alert_log: usize,
    /// The cross-page alert feed.
    pub alert_feed: usize,
    pub cell_history: usize,
}

impl Default for BufferCapacities {
    fn default() -> Self {
        Self {
            count_history: 10,
            alert_log: 6,
            alert_feed: 10,
            cell_history: DEFAULT_CELL_HISTORY_CAPACITY,
        }
    }
}

/// Everything the dashboard renders for a live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveState {
    pub current_count: u32,
    pub count_history: BoundedFifo<CountPoint>,
    pub alerts: BoundedFifo<Alert>,
    pub alert_feed: BoundedFifo<Alert>,
    pub heatmap: Option<ImageRef>,
    pub prediction: Option<Prediction>,
    pub processed_frame: Option<ImageRef>,
    pub grid_dimensions: Option<GridDimensions>,
    /// The most recent `grid[row][col]` observation.
    pub latest_grid: Option<Vec<Vec<u32>>>,
    #[serde(skip)]
    pub cell_history: CellHistory,
    pub payloads_merged: u64,
    pub payloads_dropped: u64,
}

impl LiveState {
    pub fn new(capacities: BufferCapacities) -> Self {
        Self {
            current_count: 0,
            count_history: BoundedFifo::new(capacities.count_history),
            alerts: BoundedFifo::new(capacities.alert_log),
            alert_feed: BoundedFifo::new(capacities.alert_feed),
            heatmap: None,
            prediction: None,
            processed_frame: None,
            grid_dimensions: None,
            latest_grid: None,
            cell_history: CellHistory::new(capacities.cell_history),
            payloads_merged: 0,
            payloads_dropped: 0,
        }
    }

    /// Folds one payload into the state. `timestamp_label` is only called when
    /// the payload carries a chart point.
    pub fn merge(&mut self, payload: AnalyticsPayload, timestamp_label: impl FnOnce() -> String) {
        let AnalyticsPayload {
            processed_frame,
            total_count,
            alerts,
            heatmap,
            prediction,
            chart_point,
            grid_dimensions,
            grid_counts,
        } = payload;

        if let Some(count) = total_count {
            self.current_count = count;
        }
        if !alerts.is_empty() {
            self.alert_feed.extend(alerts.iter().cloned());
            self.alerts.extend(alerts);
        }
        if let Some(heatmap) = heatmap {
            self.heatmap = Some(heatmap);
        }
        if let Some(prediction) = prediction {
            self.prediction = Some(prediction);
        }
        if let Some(frame) = processed_frame {
            self.processed_frame = Some(frame);
        }
        if let Some(count) = chart_point {
            self.count_history.push(CountPoint {
                timestamp_label: timestamp_label(),
                count,
            });
        }
        if let Some(dims) = grid_dimensions {
            self.grid_dimensions = Some(dims);
        }
        if let Some(grid) = grid_counts {
            let skipped = self.cell_history.record_grid(&grid, self.grid_dimensions);
            if skipped > 0 {
                debug!(skipped, "grid counts outside the current grid were not recorded");
            }
            self.latest_grid = Some(grid);
        }

        self.payloads_merged += 1;
    }

    pub fn history_for(&self, cell: CellKey) -> Vec<u32> {
        self.cell_history.history_for(cell)
    }

    /// Resolves a pointer position against the current grid and returns that
    /// cell's drill-down, or `None` if nothing resolves.
    pub fn resolve_cell(&self, x: f64, y: f64, bounds: ContainerBounds) -> Option<CellDrillDown> {
        let dims = self.grid_dimensions?;
        let cell = resolve(x, y, bounds, Some(dims))?;
        Some(CellDrillDown::new(cell, dims, self.history_for(cell)))
    }

    /// Density level of every cell in the latest grid observation.
    pub fn density_levels(&self) -> Vec<Vec<DensityLevel>> {
        self.latest_grid
            .as_ref()
            .map(|grid| {
                grid.iter()
                    .map(|row| row.iter().map(|&count| DensityLevel::classify(count)).collect())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for LiveState {
    fn default() -> Self {
        Self::new(BufferCapacities::default())
    }
}

/// Single writer of the live render state.
#[derive(Clone)]
pub struct Reconciler {
    state: Arc<watch::Sender<LiveState>>,
    capacities: BufferCapacities,
}

impl Reconciler {
    pub fn new(capacities: BufferCapacities) -> Self {
        let (state, _) = watch::channel(LiveState::new(capacities));
        Self {
            state: Arc::new(state),
            capacities,
        }
    }

    /// A receiver that observes every merge.
    pub fn subscribe(&self) -> watch::Receiver<LiveState> {
        self.state.subscribe()
    }

    /// An owned copy of the current state.
    pub fn snapshot(&self) -> LiveState {
        self.state.borrow().clone()
    }

    /// Reads the current state without copying it.
    pub fn read<R>(&self, f: impl FnOnce(&LiveState) -> R) -> R {
        f(&self.state.borrow())
    }

    /// Clears every buffer and snapshot, including the cell history.
    pub fn reset(&self) {
        self.state.send_replace(LiveState::new(self.capacities));
    }

    pub fn apply(&self, payload: AnalyticsPayload) {
        self.state.send_modify(|state| {
            state.merge(payload, || chrono::Local::now().format("%H:%M:%S").to_string())
        });
    }

    /// Counts a message that was dropped as malformed.
    pub fn record_dropped(&self) {
        self.state.send_modify(|state| state.payloads_dropped += 1);
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(BufferCapacities::default())
    }
}
