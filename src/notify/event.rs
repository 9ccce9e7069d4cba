use crate::common::{Prediction, PredictionSubject};
use crate::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One delivery channel per live session or uploaded video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Session(Uuid),
    Video(Uuid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Session(id) => write!(f, "session.{}", id),
            Topic::Video(id) => write!(f, "video.{}", id),
        }
    }
}

impl From<PredictionSubject> for Topic {
    fn from(subject: PredictionSubject) -> Self {
        match subject {
            PredictionSubject::Session(id) => Topic::Session(id),
            PredictionSubject::Video(id) => Topic::Video(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    PredictionReady {
        prediction_id: Uuid,
        text: String,
        confidence: f32,
        model_version: String,
    },
    ProcessingError {
        kind: ErrorKind,
        message: String,
    },
    /// Opt-in live feedback; not a sequence outcome.
    SequenceProgress {
        frame_count: usize,
        sequence_length: usize,
    },
}

impl NotificationEvent {
    pub fn prediction_ready(prediction: &Prediction) -> Self {
        NotificationEvent::PredictionReady {
            prediction_id: prediction.id,
            text: prediction.predicted_text.clone(),
            confidence: prediction.confidence,
            model_version: prediction.model_version.clone(),
        }
    }

    pub fn processing_error(error: &AppError) -> Self {
        NotificationEvent::ProcessingError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Terminal events close out a sequence or a batch job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationEvent::SequenceProgress { .. })
    }
}
