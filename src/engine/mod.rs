//! Boundary to the opaque prediction engine (pose extraction + classification).

pub mod process;
pub mod protocol;
pub mod retry;
pub mod scripted;

use crate::common::{EnginePrediction, LiveFrame, PoseFeatureVector};
use crate::error::EngineError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub use process::ProcessEngine;
pub use retry::RetryPolicy;
pub use scripted::{EngineCall, ScriptedEngine};

/// One completed live sequence, frames in capture order.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    pub session_id: Uuid,
    pub sequence_number: u64,
    pub frames: Vec<LiveFrame>,
}

#[derive(Debug, Clone)]
pub enum PredictionRequest {
    /// Batch path: quality-filtered feature vectors in temporal order.
    PoseSequence(Vec<PoseFeatureVector>),
    /// Live path: raw captured frames; the engine extracts poses itself.
    FrameSequence(FrameSequence),
}

impl PredictionRequest {
    pub fn len(&self) -> usize {
        match self {
            PredictionRequest::PoseSequence(vectors) => vectors.len(),
            PredictionRequest::FrameSequence(sequence) => sequence.frames.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Allows swapping the real subprocess engine for an in-process fake.
#[async_trait]
pub trait PredictionEngine: Send + Sync {
    async fn predict(&self, request: &PredictionRequest) -> Result<EnginePrediction, EngineError>;

    /// One vector per input path, same order. Not retried here.
    async fn extract_features(
        &self,
        frame_paths: &[PathBuf],
    ) -> Result<Vec<PoseFeatureVector>, EngineError>;

    /// An engine that answers an empty request at all, even with a refusal, is up.
    /// Engines that see the raw reply should accept any parseable answer.
    async fn is_ready(&self) -> bool {
        match self
            .predict(&PredictionRequest::PoseSequence(Vec::new()))
            .await
        {
            Ok(_) | Err(EngineError::Rejected(_)) => true,
            Err(e) => {
                tracing::warn!("Engine readiness check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl<T: PredictionEngine + ?Sized> PredictionEngine for Arc<T> {
    async fn predict(&self, request: &PredictionRequest) -> Result<EnginePrediction, EngineError> {
        (**self).predict(request).await
    }

    async fn extract_features(
        &self,
        frame_paths: &[PathBuf],
    ) -> Result<Vec<PoseFeatureVector>, EngineError> {
        (**self).extract_features(frame_paths).await
    }

    async fn is_ready(&self) -> bool {
        (**self).is_ready().await
    }
}
