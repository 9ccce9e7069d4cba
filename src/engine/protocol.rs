//! Wire format spoken with the external engine process.
//!
//! Requests go out as a single JSON object on stdin. Responses come back as a
//! single JSON object on stdout. Engines in the wild spell the same fields in
//! several ways; [`RawEngineResponse`] is the one place that accepts all of
//! them and normalizes into crate types.

use crate::common::{EnginePrediction, PoseFeatureVector};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const PROTOCOL_VERSION: u32 = 1;
const UNKNOWN_MODEL_VERSION: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ExtractFeatures,
    Predict,
}

#[derive(Debug, Serialize)]
pub struct EngineRequest<'a> {
    pub version: u32,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_paths: Option<&'a [PathBuf]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose_sequence: Option<&'a [PoseFeatureVector]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_path: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<usize>,
}

impl<'a> EngineRequest<'a> {
    fn empty(operation: Operation) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            operation,
            frame_paths: None,
            pose_sequence: None,
            sequence_path: None,
            session_id: None,
            frame_count: None,
        }
    }

    pub fn extract_features(frame_paths: &'a [PathBuf]) -> Self {
        Self {
            frame_paths: Some(frame_paths),
            ..Self::empty(Operation::ExtractFeatures)
        }
    }

    pub fn predict_poses(pose_sequence: &'a [PoseFeatureVector]) -> Self {
        Self {
            pose_sequence: Some(pose_sequence),
            ..Self::empty(Operation::Predict)
        }
    }

    pub fn predict_staged_frames(sequence_path: &'a Path, session_id: Uuid, frame_count: usize) -> Self {
        Self {
            sequence_path: Some(sequence_path),
            session_id: Some(session_id),
            frame_count: Some(frame_count),
            ..Self::empty(Operation::Predict)
        }
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::MalformedOutput(e.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawEngineResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, alias = "predictedText", alias = "prediction")]
    predicted_text: Option<String>,
    #[serde(default, alias = "confidenceScore", alias = "confidence_score")]
    confidence: Option<f64>,
    #[serde(default, alias = "modelVersion")]
    model_version: Option<String>,
    #[serde(default, alias = "poseSequence", alias = "features")]
    pose_sequence: Option<Vec<Vec<f32>>>,
    #[serde(default, alias = "processingInfo")]
    processing_info: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

impl RawEngineResponse {
    pub fn parse(stdout: &str) -> Result<Self, EngineError> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(EngineError::EmptyOutput);
        }
        serde_json::from_str(trimmed).map_err(|e| EngineError::MalformedOutput(e.to_string()))
    }

    fn failure_message(&self) -> Option<String> {
        let flagged = match &self.error {
            Some(Value::Bool(true)) => true,
            Some(Value::String(_)) => true,
            _ => false,
        };
        if self.success != Some(false) && !flagged {
            return None;
        }
        let message = match &self.error {
            Some(Value::String(error)) => Some(error.clone()),
            _ => self.message.clone(),
        };
        Some(message.unwrap_or_else(|| "unknown engine error".to_string()))
    }

    pub fn into_prediction(self) -> Result<EnginePrediction, EngineError> {
        if let Some(message) = self.failure_message() {
            return Err(EngineError::Rejected(message));
        }
        let text = self
            .predicted_text
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| EngineError::MalformedOutput("missing predicted text".to_string()))?;
        let confidence = self
            .confidence
            .ok_or_else(|| EngineError::MalformedOutput("missing confidence".to_string()))?;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::MalformedOutput(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }
        Ok(EnginePrediction {
            text,
            confidence: confidence as f32,
            model_version: self
                .model_version
                .unwrap_or_else(|| UNKNOWN_MODEL_VERSION.to_string()),
            processing_info: self.processing_info,
        })
    }

    pub fn into_features(self) -> Result<Vec<PoseFeatureVector>, EngineError> {
        if let Some(message) = self.failure_message() {
            return Err(EngineError::Rejected(message));
        }
        let sequence = self
            .pose_sequence
            .ok_or_else(|| EngineError::MalformedOutput("missing pose sequence".to_string()))?;
        Ok(sequence.into_iter().map(PoseFeatureVector::from).collect())
    }
}
