pub mod features;
pub mod frame;
pub mod prediction;

pub use features::PoseFeatureVector;
pub use frame::{ExtractedFrame, LiveFrame};
pub use prediction::{
    BatchDiagnostics, ConfidenceFlag, EnginePrediction, LiveSequenceInfo, Prediction,
    PredictionMetadata, PredictionSubject,
};
