use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// A frame written to disk during video ingestion. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFrame {
    pub id: Uuid,
    pub video_id: Uuid,
    pub file_path: PathBuf,
    pub timestamp_seconds: f64,
    #[serde(default)]
    pub motion_score: Option<f32>,
    #[serde(default)]
    pub is_keyframe: Option<bool>,
}

impl ExtractedFrame {
    pub fn new(video_id: Uuid, file_path: impl Into<PathBuf>, timestamp_seconds: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            video_id,
            file_path: file_path.into(),
            timestamp_seconds,
            motion_score: None,
            is_keyframe: None,
        }
    }

    pub fn with_motion_score(mut self, motion_score: f32) -> Self {
        self.motion_score = Some(motion_score);
        self
    }

    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = Some(is_keyframe);
        self
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// A camera frame captured on the live path. Cloning shares the image bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFrame {
    data: Arc<[u8]>,
    captured_at: DateTime<Utc>,
    frame_id: Uuid,
}

impl LiveFrame {
    pub fn new(data: impl Into<Arc<[u8]>>, captured_at: DateTime<Utc>) -> Self {
        Self {
            data: data.into(),
            captured_at,
            frame_id: Uuid::new_v4(),
        }
    }

    /// Accepts `data:image/jpeg;base64,<payload>` or a bare base64 payload.
    pub fn from_data_url(
        data_url: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, base64::DecodeError> {
        let payload = match data_url.split_once(',') {
            Some((prefix, payload)) if prefix.starts_with("data:") => payload,
            _ => data_url,
        };
        let bytes = STANDARD.decode(payload.trim())?;
        Ok(Self::new(bytes, captured_at))
    }

    /// Builds a frame from a millisecond epoch timestamp as sent by capture clients.
    pub fn from_millis(data: impl Into<Arc<[u8]>>, timestamp_ms: i64) -> Self {
        let captured_at = DateTime::<Utc>::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);
        Self::new(data, captured_at)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn frame_id(&self) -> Uuid {
        self.frame_id
    }
}
