//! Persistence collaborators. Both sides are traits so a database-backed
//! implementation can replace the in-memory ones without touching callers.

pub mod frames;
pub mod predictions;

pub use frames::{FrameRepository, InMemoryFrameRepository};
pub use predictions::{InMemoryPredictionRepository, PredictionRepository, PredictionStats};
