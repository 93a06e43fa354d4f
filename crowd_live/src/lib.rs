// THEORY:
// This file is the entry point for the `crowd_live` library crate: the client
// half of a live crowd-analysis pipeline. It samples frames from a video
// source, streams them to a remote analyzer over a WebSocket, and folds the
// analyzer's out-of-order, partially populated answers into one consistent
// render state that a dashboard can read and drill into.
//
// The public surface is small. `LiveSession` (start, stop,
// snapshot, resolve_cell) is what applications use; the pieces it is built
// from live in `core_modules` and are public so they can be tested and reused
// on their own.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod session;

pub use config::SessionConfig;
pub use core_modules::analytics::{
    Alert, AnalyticsPayload, CellKey, CountPoint, GridDimensions, ImageRef, Prediction,
};
pub use core_modules::frame_sampler::{SyntheticSource, VideoSource};
pub use core_modules::reconciler::{BufferCapacities, LiveState};
pub use core_modules::spatial_index::{CellDrillDown, ContainerBounds};
pub use core_modules::transport::{Connector, TransportChannel, WsConnector};
pub use core_modules::zones::DensityLevel;
pub use error::{LiveError, Result};
pub use image::RgbImage;
pub use session::{LiveSession, SessionState, SessionStatus};
pub use url::Url;
