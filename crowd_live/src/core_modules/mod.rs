pub mod analytics;
pub mod bounded_fifo;
pub mod frame_sampler;
pub mod reconciler;
pub mod spatial_index;
pub mod transport;
pub mod wire;
pub mod zones;
