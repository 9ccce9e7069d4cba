use crate::common::{EnginePrediction, PoseFeatureVector};
use crate::engine::{PredictionEngine, PredictionRequest};
use crate::error::EngineError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

type FeatureFn = Box<dyn Fn(&Path) -> PoseFeatureVector + Send + Sync>;

#[derive(Debug, Clone)]
pub enum EngineCall {
    Predict(PredictionRequest),
    ExtractFeatures(Vec<PathBuf>),
}

/// In-process engine driven by scripted outcomes. Records every call.
///
/// Scripted outcomes are consumed in order; once a queue runs dry the
/// fallbacks (`always_predict`, `extract_with`) answer instead.
#[derive(Default)]
pub struct ScriptedEngine {
    predictions: Mutex<VecDeque<Result<EnginePrediction, EngineError>>>,
    extractions: Mutex<VecDeque<Result<Vec<PoseFeatureVector>, EngineError>>>,
    fallback_prediction: Option<EnginePrediction>,
    feature_fn: Option<FeatureFn>,
    calls: Mutex<Vec<EngineCall>>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed_prediction(self, prediction: EnginePrediction) -> Self {
        lock(&self.predictions).push_back(Ok(prediction));
        self
    }

    pub fn fail_prediction(self, error: EngineError) -> Self {
        lock(&self.predictions).push_back(Err(error));
        self
    }

    pub fn always_predict(mut self, prediction: EnginePrediction) -> Self {
        self.fallback_prediction = Some(prediction);
        self
    }

    pub fn succeed_extraction(self, vectors: Vec<PoseFeatureVector>) -> Self {
        lock(&self.extractions).push_back(Ok(vectors));
        self
    }

    pub fn fail_extraction(self, error: EngineError) -> Self {
        lock(&self.extractions).push_back(Err(error));
        self
    }

    pub fn extract_with<F>(mut self, feature_fn: F) -> Self
    where
        F: Fn(&Path) -> PoseFeatureVector + Send + Sync + 'static,
    {
        self.feature_fn = Some(Box::new(feature_fn));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each prediction waits for one permit from `gate` before answering.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }

    pub fn predict_requests(&self) -> Vec<PredictionRequest> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                EngineCall::Predict(request) => Some(request.clone()),
                EngineCall::ExtractFeatures(_) => None,
            })
            .collect()
    }

    pub fn predict_calls(&self) -> usize {
        self.predict_requests().len()
    }

    pub fn extract_calls(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| matches!(call, EngineCall::ExtractFeatures(_)))
            .count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl PredictionEngine for ScriptedEngine {
    async fn predict(&self, request: &PredictionRequest) -> Result<EnginePrediction, EngineError> {
        lock(&self.calls).push(EngineCall::Predict(request.clone()));
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = lock(&self.predictions).pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => self
                .fallback_prediction
                .clone()
                .ok_or_else(|| EngineError::Rejected("no scripted prediction left".to_string())),
        }
    }

    async fn extract_features(
        &self,
        frame_paths: &[PathBuf],
    ) -> Result<Vec<PoseFeatureVector>, EngineError> {
        lock(&self.calls).push(EngineCall::ExtractFeatures(frame_paths.to_vec()));
        let scripted = lock(&self.extractions).pop_front();
        match (scripted, &self.feature_fn) {
            (Some(outcome), _) => outcome,
            (None, Some(feature_fn)) => Ok(frame_paths.iter().map(|p| feature_fn(p)).collect()),
            (None, None) => Err(EngineError::Rejected(
                "no scripted extraction left".to_string(),
            )),
        }
    }
}
