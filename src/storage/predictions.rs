use crate::common::{Prediction, PredictionSubject};
use crate::error::AppError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Write side for finished predictions. Records are never updated.
#[async_trait]
pub trait PredictionRepository: Send + Sync {
    async fn save(&self, prediction: &Prediction) -> Result<(), AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Prediction>, AppError>;

    async fn for_subject(&self, subject: PredictionSubject) -> Result<Vec<Prediction>, AppError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PredictionStats {
    pub count: usize,
    pub average_confidence: f32,
    pub min_confidence: f32,
    pub max_confidence: f32,
    pub by_model_version: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct InMemoryPredictionRepository {
    predictions: RwLock<Vec<Prediction>>,
}

impl InMemoryPredictionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.predictions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> PredictionStats {
        let predictions = self.predictions.read().await;
        if predictions.is_empty() {
            return PredictionStats::default();
        }
        let mut stats = PredictionStats {
            count: predictions.len(),
            min_confidence: f32::MAX,
            max_confidence: f32::MIN,
            ..PredictionStats::default()
        };
        let mut total = 0.0f64;
        for prediction in predictions.iter() {
            total += prediction.confidence as f64;
            stats.min_confidence = stats.min_confidence.min(prediction.confidence);
            stats.max_confidence = stats.max_confidence.max(prediction.confidence);
            *stats
                .by_model_version
                .entry(prediction.model_version.clone())
                .or_default() += 1;
        }
        stats.average_confidence = (total / predictions.len() as f64) as f32;
        stats
    }
}

#[async_trait]
impl PredictionRepository for InMemoryPredictionRepository {
    async fn save(&self, prediction: &Prediction) -> Result<(), AppError> {
        let mut predictions = self.predictions.write().await;
        if predictions.iter().any(|p| p.id == prediction.id) {
            return Err(AppError::Persistence(format!(
                "prediction {} already stored",
                prediction.id
            )));
        }
        predictions.push(prediction.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Prediction>, AppError> {
        Ok(self
            .predictions
            .read()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn for_subject(&self, subject: PredictionSubject) -> Result<Vec<Prediction>, AppError> {
        Ok(self
            .predictions
            .read()
            .await
            .iter()
            .filter(|p| p.subject == subject)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EnginePrediction, LiveSequenceInfo, PredictionMetadata};

    fn prediction(subject: PredictionSubject, confidence: f32, model: &str) -> Prediction {
        Prediction::new(
            subject,
            EnginePrediction {
                text: "hello".to_string(),
                confidence,
                model_version: model.to_string(),
                processing_info: None,
            },
            12,
            PredictionMetadata::Live {
                sequence: LiveSequenceInfo {
                    sequence_number: 1,
                    frame_count: 30,
                },
                engine: None,
            },
        )
    }

    #[tokio::test]
    async fn saved_predictions_are_found_by_id_and_subject() {
        let repository = InMemoryPredictionRepository::new();
        let session = PredictionSubject::Session(Uuid::new_v4());
        let first = prediction(session, 0.5, "v1");
        repository.save(&first).await.unwrap();
        repository
            .save(&prediction(PredictionSubject::Video(Uuid::new_v4()), 0.9, "v1"))
            .await
            .unwrap();

        assert_eq!(repository.find_by_id(first.id).await.unwrap(), Some(first));
        assert_eq!(repository.for_subject(session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn saving_twice_is_rejected() {
        let repository = InMemoryPredictionRepository::new();
        let record = prediction(PredictionSubject::Video(Uuid::new_v4()), 0.5, "v1");
        repository.save(&record).await.unwrap();
        assert!(matches!(
            repository.save(&record).await,
            Err(AppError::Persistence(_))
        ));
        assert_eq!(repository.len().await, 1);
    }

    #[tokio::test]
    async fn stats_summarize_confidence_and_models() {
        let repository = InMemoryPredictionRepository::new();
        assert_eq!(repository.stats().await, PredictionStats::default());

        for (confidence, model) in [(0.2, "v1"), (0.6, "v1"), (1.0, "v2")] {
            repository
                .save(&prediction(PredictionSubject::Video(Uuid::new_v4()), confidence, model))
                .await
                .unwrap();
        }
        let stats = repository.stats().await;
        assert_eq!(stats.count, 3);
        assert!((stats.average_confidence - 0.6).abs() < 1e-6);
        assert_eq!(stats.min_confidence, 0.2);
        assert_eq!(stats.max_confidence, 1.0);
        assert_eq!(stats.by_model_version["v1"], 2);
        assert_eq!(stats.by_model_version["v2"], 1);
    }
}
