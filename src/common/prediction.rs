use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOW_CONFIDENCE_BELOW: f32 = 0.1;
const HIGH_CONFIDENCE_ABOVE: f32 = 0.7;

/// What a prediction was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PredictionSubject {
    Video(Uuid),
    Session(Uuid),
}

/// Normalized engine answer. Only ever built from a successful engine response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnginePrediction {
    pub text: String,
    pub confidence: f32,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceFlag {
    /// Usually means the feature normalization upstream went wrong.
    LikelyNormalizationFailure,
    Normal,
    High,
}

impl ConfidenceFlag {
    pub fn for_confidence(confidence: f32) -> Self {
        if confidence < LOW_CONFIDENCE_BELOW {
            ConfidenceFlag::LikelyNormalizationFailure
        } else if confidence > HIGH_CONFIDENCE_ABOVE {
            ConfidenceFlag::High
        } else {
            ConfidenceFlag::Normal
        }
    }
}

/// Quality diagnostics recorded with every batch prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDiagnostics {
    pub total_frames: usize,
    pub missing_files: usize,
    pub selected_frames: usize,
    pub batch_size: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub failed_batch_frames: usize,
    pub extracted_vectors: usize,
    pub valid_vectors: usize,
    pub discarded_vectors: usize,
    pub average_quality: f32,
    pub validity_percentage: f32,
    pub confidence_flag: ConfidenceFlag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSequenceInfo {
    pub sequence_number: u64,
    pub frame_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PredictionMetadata {
    Batch {
        diagnostics: BatchDiagnostics,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine: Option<serde_json::Value>,
    },
    Live {
        sequence: LiveSequenceInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine: Option<serde_json::Value>,
    },
}

/// Immutable record of one recognized gesture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub subject: PredictionSubject,
    pub predicted_text: String,
    pub confidence: f32,
    pub model_version: String,
    pub processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
    pub metadata: PredictionMetadata,
}

impl Prediction {
    pub fn new(
        subject: PredictionSubject,
        engine: EnginePrediction,
        processing_time_ms: u64,
        metadata: PredictionMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            predicted_text: engine.text,
            confidence: engine.confidence.clamp(0.0, 1.0),
            model_version: engine.model_version,
            processing_time_ms,
            created_at: Utc::now(),
            metadata,
        }
    }
}
