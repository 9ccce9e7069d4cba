//! Batch path for uploaded videos.

pub mod orchestrator;
pub mod quality;
pub mod selection;

pub use orchestrator::BatchOrchestrator;
pub use quality::{QualityAssessment, QualityScorer};
pub use selection::FrameSelector;
