use crate::common::{
    BatchDiagnostics, ConfidenceFlag, ExtractedFrame, PoseFeatureVector, Prediction,
    PredictionMetadata, PredictionSubject,
};
use crate::config::Configuration;
use crate::engine::{PredictionEngine, PredictionRequest, RetryPolicy};
use crate::error::AppError;
use crate::notify::{NotificationEvent, Notifier, Topic};
use crate::pipeline::quality::QualityScorer;
use crate::pipeline::selection::FrameSelector;
use crate::storage::{FrameRepository, PredictionRepository};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Vectors that survived extraction, still in temporal order.
#[derive(Debug, Default)]
struct Extraction {
    vectors: Vec<PoseFeatureVector>,
    batches: usize,
    failed_batches: usize,
    failed_batch_frames: usize,
}

#[derive(Debug)]
struct Filtered {
    valid: Vec<PoseFeatureVector>,
    discarded: usize,
    average_quality: f32,
}

/// Turns an uploaded video's extracted frames into one persisted prediction.
///
/// fetch -> drop missing files -> select -> extract in batches -> score ->
/// predict with retry -> persist. Every run ends with exactly one terminal
/// event on the video's topic.
#[derive(Clone)]
pub struct BatchOrchestrator {
    frames: Arc<dyn FrameRepository>,
    predictions: Arc<dyn PredictionRepository>,
    engine: Arc<dyn PredictionEngine>,
    notifier: Notifier,
    selector: FrameSelector,
    scorer: QualityScorer,
    retry: RetryPolicy,
    batch_size: usize,
    inter_batch_pause: Duration,
    verify_frame_files: bool,
}

impl BatchOrchestrator {
    pub fn new(
        configuration: &Configuration,
        frames: Arc<dyn FrameRepository>,
        predictions: Arc<dyn PredictionRepository>,
        engine: Arc<dyn PredictionEngine>,
        notifier: Notifier,
    ) -> Self {
        let batch = &configuration.batch;
        Self {
            frames,
            predictions,
            engine,
            notifier,
            selector: FrameSelector::new(batch.max_frames_per_video),
            scorer: QualityScorer::new(batch.feature_dimension, batch.quality_threshold),
            retry: RetryPolicy::new(
                configuration.engine.retry_attempts,
                configuration.engine.retry_base_delay(),
            ),
            batch_size: batch.batch_size.max(1),
            inter_batch_pause: batch.inter_batch_pause(),
            verify_frame_files: batch.verify_frame_files,
        }
    }

    /// Re-running for the same video repeats the whole pipeline.
    #[instrument(skip_all, fields(video_id = %video_id))]
    pub async fn process(&self, video_id: Uuid) -> Result<Prediction, AppError> {
        let result = self.run(video_id).await;
        let event = match &result {
            Ok(prediction) => {
                info!(
                    "Video {} recognized as {:?} ({:.2})",
                    video_id, prediction.predicted_text, prediction.confidence
                );
                NotificationEvent::prediction_ready(prediction)
            }
            Err(e) => {
                error!("Video {} failed: {}", video_id, e);
                NotificationEvent::processing_error(e)
            }
        };
        if let Err(e) = self
            .notifier
            .clone()
            .oneshot((Topic::Video(video_id), event))
            .await
        {
            warn!("Could not notify subscribers of video {}: {}", video_id, e);
        }
        // Nothing more is published for this run.
        self.notifier.close_topic(Topic::Video(video_id));
        result
    }

    async fn run(&self, video_id: Uuid) -> Result<Prediction, AppError> {
        let start = Instant::now();

        let frames = self.frames.frames_for_video(video_id).await?;
        if frames.is_empty() {
            return Err(AppError::NoFramesFound(video_id));
        }
        let total_frames = frames.len();

        let available = self.drop_missing(frames).await;
        let missing_files = total_frames - available.len();
        if available.is_empty() {
            return Err(AppError::NoFramesFound(video_id));
        }

        let selected = self.selector.select(&available);
        debug!(
            "Selected {} of {} frames ({} missing)",
            selected.len(),
            total_frames,
            missing_files
        );

        let extraction = self.extract(&selected).await;
        let extracted_vectors = extraction.vectors.len();
        let filtered = self.filter(extraction.vectors);
        if filtered.valid.is_empty() {
            return Err(AppError::PoseExtractionFailed {
                extracted: extracted_vectors,
                discarded: filtered.discarded,
            });
        }
        let valid_vectors = filtered.valid.len();

        let request = PredictionRequest::PoseSequence(filtered.valid);
        let engine_prediction = self.retry.predict(self.engine.as_ref(), &request).await?;

        let diagnostics = BatchDiagnostics {
            total_frames,
            missing_files,
            selected_frames: selected.len(),
            batch_size: self.batch_size,
            batches: extraction.batches,
            failed_batches: extraction.failed_batches,
            failed_batch_frames: extraction.failed_batch_frames,
            extracted_vectors,
            valid_vectors,
            discarded_vectors: filtered.discarded,
            average_quality: filtered.average_quality,
            validity_percentage: valid_vectors as f32 / extracted_vectors as f32 * 100.0,
            confidence_flag: ConfidenceFlag::for_confidence(engine_prediction.confidence),
        };
        match diagnostics.confidence_flag {
            ConfidenceFlag::LikelyNormalizationFailure => warn!(
                "Confidence {:.3} for video {}, feature normalization may be off",
                engine_prediction.confidence, video_id
            ),
            ConfidenceFlag::High => debug!("High confidence for video {}", video_id),
            ConfidenceFlag::Normal => {}
        }

        let engine_info = engine_prediction.processing_info.clone();
        let prediction = Prediction::new(
            PredictionSubject::Video(video_id),
            engine_prediction,
            start.elapsed().as_millis() as u64,
            PredictionMetadata::Batch {
                diagnostics,
                engine: engine_info,
            },
        );
        self.predictions.save(&prediction).await?;
        Ok(prediction)
    }

    async fn drop_missing(&self, frames: Vec<ExtractedFrame>) -> Vec<ExtractedFrame> {
        let mut available = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.file_path.as_os_str().is_empty() {
                debug!("Frame {} has no file path", frame.id);
                continue;
            }
            if self.verify_frame_files
                && !tokio::fs::try_exists(&frame.file_path)
                    .await
                    .unwrap_or(false)
            {
                debug!("Frame file missing: {}", frame.file_path.display());
                continue;
            }
            available.push(frame);
        }
        available
    }

    /// Failed batches are skipped, not retried.
    async fn extract(&self, selected: &[ExtractedFrame]) -> Extraction {
        let mut extraction = Extraction::default();
        for (index, batch) in selected.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.inter_batch_pause.is_zero() {
                tokio::time::sleep(self.inter_batch_pause).await;
            }
            extraction.batches += 1;
            let paths: Vec<PathBuf> = batch.iter().map(|f| f.file_path.clone()).collect();
            match self.engine.extract_features(&paths).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    extraction.vectors.extend(vectors);
                }
                Ok(vectors) => {
                    warn!(
                        "Batch {} returned {} vectors for {} frames, skipping",
                        index + 1,
                        vectors.len(),
                        batch.len()
                    );
                    extraction.failed_batches += 1;
                    extraction.failed_batch_frames += batch.len();
                }
                Err(e) => {
                    warn!("Batch {} extraction failed, skipping: {}", index + 1, e);
                    extraction.failed_batches += 1;
                    extraction.failed_batch_frames += batch.len();
                }
            }
        }
        extraction
    }

    fn filter(&self, vectors: Vec<PoseFeatureVector>) -> Filtered {
        let total = vectors.len();
        let mut valid = Vec::with_capacity(total);
        let mut quality_sum = 0.0f64;
        for (index, vector) in vectors.into_iter().enumerate() {
            let assessment = self.scorer.assess(&vector);
            quality_sum += assessment.score as f64;
            if assessment.valid {
                valid.push(vector);
            } else {
                debug!(
                    "Discarding vector {} (score {:.3}, length {})",
                    index,
                    assessment.score,
                    vector.len()
                );
            }
        }
        Filtered {
            discarded: total - valid.len(),
            average_quality: if total == 0 {
                0.0
            } else {
                (quality_sum / total as f64) as f32
            },
            valid,
        }
    }
}

impl Service<Uuid> for BatchOrchestrator {
    type Response = Prediction;
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, video_id: Uuid) -> Self::Future {
        let orchestrator = self.clone();
        Box::pin(async move { orchestrator.process(video_id).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EnginePrediction;
    use crate::engine::ScriptedEngine;
    use crate::error::{EngineError, ErrorKind};
    use crate::storage::{InMemoryFrameRepository, InMemoryPredictionRepository};
    use std::path::Path;
    use tokio::sync::broadcast;

    const DIMENSION: usize = 288;

    struct Harness {
        orchestrator: BatchOrchestrator,
        engine: Arc<ScriptedEngine>,
        predictions: Arc<InMemoryPredictionRepository>,
        events: broadcast::Receiver<NotificationEvent>,
        video_id: Uuid,
    }

    fn configuration() -> Configuration {
        let mut configuration = Configuration::default();
        configuration.batch.verify_frame_files = false;
        configuration.batch.feature_dimension = DIMENSION;
        configuration.engine.retry_base_delay_ms = 10;
        configuration
    }

    fn frames(video_id: Uuid, count: usize) -> Vec<ExtractedFrame> {
        (0..count)
            .map(|i| {
                ExtractedFrame::new(video_id, format!("/frames/{:04}.jpg", i), i as f64 * 0.1)
                    .with_motion_score(((i * 53) % 97) as f32 / 97.0)
            })
            .collect()
    }

    /// Encodes the frame number in the first component so order is observable.
    fn pose_for(path: &Path) -> PoseFeatureVector {
        let number: f32 = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let mut values: Vec<f32> = (0..DIMENSION)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        values[0] = number + 1.0;
        PoseFeatureVector::new(values)
    }

    fn engine_answer(confidence: f32) -> EnginePrediction {
        EnginePrediction {
            text: "thank you".to_string(),
            confidence,
            model_version: "lstm_v2".to_string(),
            processing_info: None,
        }
    }

    fn harness(configuration: &Configuration, frame_count: usize, engine: ScriptedEngine) -> Harness {
        let video_id = Uuid::new_v4();
        let engine = Arc::new(engine);
        let predictions = Arc::new(InMemoryPredictionRepository::new());
        let notifier = Notifier::new(16);
        let events = notifier.subscribe(Topic::Video(video_id));
        let orchestrator = BatchOrchestrator::new(
            configuration,
            Arc::new(InMemoryFrameRepository::with_frames(frames(video_id, frame_count))),
            predictions.clone(),
            engine.clone(),
            notifier,
        );
        Harness {
            orchestrator,
            engine,
            predictions,
            events,
            video_id,
        }
    }

    fn only_event(events: &mut broadcast::Receiver<NotificationEvent>) -> NotificationEvent {
        let event = events.try_recv().expect("one terminal event");
        assert!(events.try_recv().is_err(), "more than one event published");
        event
    }

    #[tokio::test(start_paused = true)]
    async fn large_video_is_selected_batched_and_predicted_in_temporal_order() {
        let engine = ScriptedEngine::new()
            .extract_with(pose_for)
            .always_predict(engine_answer(0.82));
        let mut h = harness(&configuration(), 250, engine);

        let prediction = h.orchestrator.process(h.video_id).await.unwrap();

        assert_eq!(h.engine.extract_calls(), 5);
        let requests = h.engine.predict_requests();
        assert_eq!(requests.len(), 1);
        let PredictionRequest::PoseSequence(vectors) = &requests[0] else {
            panic!("expected a pose sequence");
        };
        assert_eq!(vectors.len(), 100);
        assert!(vectors
            .windows(2)
            .all(|w| w[0].values()[0] < w[1].values()[0]));

        match &prediction.metadata {
            PredictionMetadata::Batch { diagnostics, .. } => {
                assert_eq!(diagnostics.total_frames, 250);
                assert_eq!(diagnostics.selected_frames, 100);
                assert_eq!(diagnostics.batches, 5);
                assert_eq!(diagnostics.valid_vectors, 100);
                assert_eq!(diagnostics.validity_percentage, 100.0);
                assert_eq!(diagnostics.confidence_flag, ConfidenceFlag::High);
            }
            other => panic!("unexpected metadata {:?}", other),
        }
        assert_eq!(prediction.subject, PredictionSubject::Video(h.video_id));
        assert_eq!(h.predictions.len().await, 1);
        assert!(matches!(
            only_event(&mut h.events),
            NotificationEvent::PredictionReady { prediction_id, .. } if prediction_id == prediction.id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_release_their_topic() {
        let engine = ScriptedEngine::new()
            .extract_with(pose_for)
            .always_predict(engine_answer(0.5));
        let mut h = harness(&configuration(), 10, engine);
        let notifier = h.orchestrator.notifier.clone();

        h.orchestrator.process(h.video_id).await.unwrap();

        assert_eq!(notifier.topic_count(), 0);
        assert!(matches!(
            h.events.try_recv(),
            Ok(NotificationEvent::PredictionReady { .. })
        ));
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));

        for _ in 0..20 {
            let rx = notifier.subscribe(Topic::Video(h.video_id));
            h.orchestrator.process(h.video_id).await.unwrap();
            drop(rx);
        }
        assert_eq!(notifier.topic_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn all_zero_vectors_fail_without_calling_the_engine() {
        let engine = ScriptedEngine::new()
            .extract_with(|_| PoseFeatureVector::new(vec![0.0; DIMENSION]))
            .always_predict(engine_answer(0.9));
        let mut h = harness(&configuration(), 40, engine);

        let error = h.orchestrator.process(h.video_id).await.unwrap_err();

        assert!(matches!(
            error,
            AppError::PoseExtractionFailed {
                extracted: 40,
                discarded: 40
            }
        ));
        assert_eq!(h.engine.predict_calls(), 0);
        assert!(h.predictions.is_empty().await);
        assert!(matches!(
            only_event(&mut h.events),
            NotificationEvent::ProcessingError {
                kind: ErrorKind::PoseExtractionFailed,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_persist_nothing() {
        let engine = ScriptedEngine::new()
            .extract_with(pose_for)
            .fail_prediction(EngineError::EmptyOutput)
            .fail_prediction(EngineError::EmptyOutput)
            .fail_prediction(EngineError::MalformedOutput("junk".to_string()));
        let mut h = harness(&configuration(), 10, engine);

        let error = h.orchestrator.process(h.video_id).await.unwrap_err();

        assert!(matches!(
            error,
            AppError::PredictionFailedAfterRetries { attempts: 3, .. }
        ));
        assert_eq!(h.engine.predict_calls(), 3);
        assert!(h.predictions.is_empty().await);
        assert!(matches!(
            only_event(&mut h.events),
            NotificationEvent::ProcessingError {
                kind: ErrorKind::PredictionFailedAfterRetries,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_video_has_no_frames() {
        let mut h = harness(&configuration(), 5, ScriptedEngine::new());
        let other = Uuid::new_v4();
        assert!(matches!(
            h.orchestrator.process(other).await,
            Err(AppError::NoFramesFound(id)) if id == other
        ));
        // Published on the other video's topic, not this one.
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.engine.calls().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batches_are_skipped_and_counted() {
        let engine = ScriptedEngine::new()
            .fail_extraction(EngineError::Timeout(Duration::from_secs(120)))
            .extract_with(pose_for)
            .always_predict(engine_answer(0.5));
        let h = harness(&configuration(), 40, engine);

        let prediction = h.orchestrator.process(h.video_id).await.unwrap();

        let PredictionMetadata::Batch { diagnostics, .. } = prediction.metadata else {
            panic!("expected batch metadata");
        };
        assert_eq!(diagnostics.batches, 2);
        assert_eq!(diagnostics.failed_batches, 1);
        assert_eq!(diagnostics.failed_batch_frames, 20);
        assert_eq!(diagnostics.valid_vectors, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn short_batches_and_wrong_dimensions_are_discarded() {
        let engine = ScriptedEngine::new()
            .succeed_extraction(vec![pose_for(Path::new("0000.jpg"))])
            .extract_with(|path| {
                if path.to_string_lossy().ends_with("5.jpg") {
                    PoseFeatureVector::new(vec![1.0, -1.0])
                } else {
                    pose_for(path)
                }
            })
            .always_predict(engine_answer(0.05));
        let h = harness(&configuration(), 40, engine);

        let prediction = h.orchestrator.process(h.video_id).await.unwrap();

        let PredictionMetadata::Batch { diagnostics, .. } = prediction.metadata else {
            panic!("expected batch metadata");
        };
        assert_eq!(diagnostics.failed_batches, 1);
        assert_eq!(diagnostics.extracted_vectors, 20);
        // Frames 25 and 35 come back two-dimensional.
        assert_eq!(diagnostics.discarded_vectors, 2);
        assert_eq!(diagnostics.valid_vectors, 18);
        assert!((diagnostics.validity_percentage - 90.0).abs() < 1e-4);
        assert_eq!(
            diagnostics.confidence_flag,
            ConfidenceFlag::LikelyNormalizationFailure
        );
    }

    #[tokio::test]
    async fn missing_frame_files_are_dropped_before_selection() {
        let dir = tempfile::tempdir().unwrap();
        let video_id = Uuid::new_v4();
        let mut stored = Vec::new();
        for i in 0..3 {
            let path = dir.path().join(format!("{:04}.jpg", i));
            std::fs::write(&path, b"jpeg").unwrap();
            stored.push(ExtractedFrame::new(video_id, path, i as f64));
        }
        stored.push(ExtractedFrame::new(video_id, dir.path().join("gone.jpg"), 3.0));
        stored.push(ExtractedFrame::new(video_id, "", 4.0));

        let mut configuration = configuration();
        configuration.batch.verify_frame_files = true;
        let engine = Arc::new(
            ScriptedEngine::new()
                .extract_with(pose_for)
                .always_predict(engine_answer(0.5)),
        );
        let orchestrator = BatchOrchestrator::new(
            &configuration,
            Arc::new(InMemoryFrameRepository::with_frames(stored)),
            Arc::new(InMemoryPredictionRepository::new()),
            engine.clone(),
            Notifier::default(),
        );

        let prediction = orchestrator.process(video_id).await.unwrap();

        let PredictionMetadata::Batch { diagnostics, .. } = prediction.metadata else {
            panic!("expected batch metadata");
        };
        assert_eq!(diagnostics.total_frames, 5);
        assert_eq!(diagnostics.missing_files, 2);
        assert_eq!(diagnostics.selected_frames, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn orchestrator_is_a_tower_service() {
        let engine = ScriptedEngine::new()
            .extract_with(pose_for)
            .always_predict(engine_answer(0.6));
        let h = harness(&configuration(), 5, engine);

        let prediction = h.orchestrator.clone().oneshot(h.video_id).await.unwrap();
        assert_eq!(prediction.predicted_text, "thank you");
    }
}
