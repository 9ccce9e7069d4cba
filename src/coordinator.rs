use crate::{
    common::Prediction,
    config::Configuration,
    engine::{PredictionEngine, ProcessEngine, RetryPolicy},
    error::AppError,
    intake::session::{LiveIngest, PredictionContext, SessionManager},
    notify::{NotificationEvent, Notifier, Topic},
    pipeline::BatchOrchestrator,
    storage::{
        FrameRepository, InMemoryFrameRepository, InMemoryPredictionRepository,
        PredictionRepository,
    },
    workers::WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Wires the live and batch paths around one engine, one worker pool and
/// one notifier.
pub struct Coordinator {
    ingest: LiveIngest,
    orchestrator: BatchOrchestrator,
    pool: WorkerPool,
    notifier: Notifier,
    engine: Arc<dyn PredictionEngine>,
    predictions: Arc<dyn PredictionRepository>,
    session_manager: Option<SessionManager>,
    worker_tasks: Vec<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl Coordinator {
    fn new(
        configuration: Configuration,
        engine: Arc<dyn PredictionEngine>,
        frames: Arc<dyn FrameRepository>,
        predictions: Arc<dyn PredictionRepository>,
        notifier: Notifier,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let (pool, worker_tasks) = WorkerPool::start(&configuration.workers, cancel_token.clone());

        let context = PredictionContext {
            engine: engine.clone(),
            predictions: predictions.clone(),
            retry: RetryPolicy::new(
                configuration.engine.retry_attempts,
                configuration.engine.retry_base_delay(),
            ),
            pool: pool.clone(),
        };
        let (session_manager, ingest) = SessionManager::start(
            notifier.clone(),
            context,
            configuration.sequence.clone(),
            &configuration.sessions,
            cancel_token.clone(),
        );
        let orchestrator = BatchOrchestrator::new(
            &configuration,
            frames,
            predictions.clone(),
            engine.clone(),
            notifier.clone(),
        );

        info!(
            "Coordinator started: sequence length {}, {} workers",
            configuration.sequence.length,
            pool.size()
        );
        Self {
            ingest,
            orchestrator,
            pool,
            notifier,
            engine,
            predictions,
            session_manager: Some(session_manager),
            worker_tasks,
            cancel_token,
        }
    }

    pub fn builder(configuration: Configuration) -> CoordinatorBuilder {
        CoordinatorBuilder::new(configuration)
    }

    pub fn live(&self) -> LiveIngest {
        self.ingest.clone()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn predictions(&self) -> Arc<dyn PredictionRepository> {
        self.predictions.clone()
    }

    /// Runs the batch pipeline for one video on the worker pool, waiting for
    /// queue capacity.
    pub async fn process_video(&self, video_id: Uuid) -> Result<Prediction, AppError> {
        let orchestrator = self.orchestrator.clone();
        self.pool
            .run(async move { orchestrator.process(video_id).await })
            .await?
    }

    pub fn subscribe_video(&self, video_id: Uuid) -> broadcast::Receiver<NotificationEvent> {
        self.notifier.subscribe(Topic::Video(video_id))
    }

    pub async fn engine_ready(&self) -> bool {
        self.engine.is_ready().await
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Cancels all tasks and waits for them. Jobs already running finish.
    pub async fn shutdown(&mut self) {
        self.stop();
        if let Some(session_manager) = self.session_manager.take() {
            session_manager.join().await;
        }
        for task in self.worker_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Worker task failed: {}", e);
            }
        }
        info!("Coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct CoordinatorBuilder {
    configuration: Configuration,
    engine: Option<Arc<dyn PredictionEngine>>,
    frames: Option<Arc<dyn FrameRepository>>,
    predictions: Option<Arc<dyn PredictionRepository>>,
    notifier: Option<Notifier>,
}

impl CoordinatorBuilder {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            engine: None,
            frames: None,
            predictions: None,
            notifier: None,
        }
    }

    // Overrides the number of frames per live gesture sequence.
    pub fn sequence_length(mut self, length: usize) -> Self {
        self.configuration.sequence.length = length;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.configuration.sequence.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    // Overrides the pose extraction batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.configuration.batch.batch_size = batch_size;
        self
    }

    pub fn max_frames_per_video(mut self, max_frames: usize) -> Self {
        self.configuration.batch.max_frames_per_video = max_frames;
        self
    }

    pub fn quality_threshold(mut self, threshold: f32) -> Self {
        self.configuration.batch.quality_threshold = threshold;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.configuration.engine.retry_attempts = attempts;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.configuration.engine.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    // Overrides the worker pool size, this caps concurrent engine processes.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.configuration.workers.pool_size = pool_size;
        self
    }

    // Without an engine, build() starts the configured engine process.
    pub fn engine(mut self, engine: Arc<dyn PredictionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn frames(mut self, frames: Arc<dyn FrameRepository>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn predictions(mut self, predictions: Arc<dyn PredictionRepository>) -> Self {
        self.predictions = Some(predictions);
        self
    }

    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Must be called inside a tokio runtime; spawns the workers and the
    /// session supervisor.
    pub fn build(self) -> Result<Coordinator, AppError> {
        self.configuration.validate()?;
        let engine: Arc<dyn PredictionEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(ProcessEngine::new(&self.configuration.engine)),
        };
        let frames: Arc<dyn FrameRepository> = match self.frames {
            Some(frames) => frames,
            None => Arc::new(InMemoryFrameRepository::new()),
        };
        let predictions: Arc<dyn PredictionRepository> = match self.predictions {
            Some(predictions) => predictions,
            None => Arc::new(InMemoryPredictionRepository::new()),
        };
        let notifier = self
            .notifier
            .unwrap_or_else(|| Notifier::new(self.configuration.notifier.channel_capacity));
        Ok(Coordinator::new(
            self.configuration,
            engine,
            frames,
            predictions,
            notifier,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EnginePrediction, ExtractedFrame, LiveFrame, PoseFeatureVector, PredictionSubject};
    use crate::engine::ScriptedEngine;
    use crate::error::EngineError;
    use crate::intake::FrameAck;

    fn answer(text: &str) -> EnginePrediction {
        EnginePrediction {
            text: text.to_string(),
            confidence: 0.9,
            model_version: "v9".to_string(),
            processing_info: None,
        }
    }

    fn dense_pose() -> PoseFeatureVector {
        PoseFeatureVector::new((0..288).map(|i| (i % 7) as f32 * 0.1 + 0.05).collect())
    }

    fn test_configuration() -> Configuration {
        let mut configuration = Configuration::default();
        configuration.batch.verify_frame_files = false;
        configuration.batch.inter_batch_pause_ms = 0;
        configuration.engine.retry_base_delay_ms = 1;
        configuration.sequence.cooldown_ms = 0;
        configuration
    }

    #[tokio::test]
    async fn test_coordinator_runs_batch_jobs_on_the_pool() {
        let video_id = Uuid::new_v4();
        let frames = InMemoryFrameRepository::with_frames(
            (0..30).map(|i| ExtractedFrame::new(video_id, format!("/v/{}.jpg", i), i as f64)),
        );
        let engine = Arc::new(
            ScriptedEngine::new()
                .extract_with(|_| dense_pose())
                .always_predict(answer("goodbye")),
        );
        let predictions = Arc::new(InMemoryPredictionRepository::new());
        let mut coordinator = CoordinatorBuilder::new(test_configuration())
            .batch_size(10)
            .pool_size(2)
            .engine(engine.clone())
            .frames(Arc::new(frames))
            .predictions(predictions.clone())
            .build()
            .expect("Failed to build coordinator");
        let mut events = coordinator.subscribe_video(video_id);

        let prediction = coordinator.process_video(video_id).await.unwrap();

        assert_eq!(prediction.predicted_text, "goodbye");
        assert_eq!(prediction.subject, PredictionSubject::Video(video_id));
        assert_eq!(engine.extract_calls(), 3);
        assert!(matches!(
            events.recv().await.unwrap(),
            NotificationEvent::PredictionReady { .. }
        ));
        assert_eq!(predictions.stats().await.count, 1);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_coordinator_live_path() {
        let engine = Arc::new(ScriptedEngine::new().always_predict(answer("yes")));
        let mut coordinator = CoordinatorBuilder::new(test_configuration())
            .sequence_length(4)
            .engine(engine.clone())
            .build()
            .expect("Failed to build coordinator");
        let live = coordinator.live();

        let session_id = live.start_session("user-1").await.unwrap();
        let mut rx = live.subscribe(session_id).await.unwrap();
        for i in 0..4 {
            let ack = live
                .send_frame(session_id, LiveFrame::from_millis(vec![1, 2, 3], i * 200))
                .await
                .unwrap();
            if i == 3 {
                assert!(matches!(ack, FrameAck::SequenceDispatched { frame_count: 4, .. }));
            }
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            NotificationEvent::PredictionReady { text, .. } if text == "yes"
        ));
        assert_eq!(
            coordinator
                .predictions()
                .for_subject(PredictionSubject::Session(session_id))
                .await
                .unwrap()
                .len(),
            1
        );

        coordinator.shutdown().await;
        assert!(!live.is_active(session_id).await);
    }

    #[tokio::test]
    async fn test_engine_readiness_probe() {
        let ready = CoordinatorBuilder::new(test_configuration())
            .engine(Arc::new(
                ScriptedEngine::new().fail_prediction(EngineError::Rejected("empty".to_string())),
            ))
            .build()
            .unwrap();
        assert!(ready.engine_ready().await);

        let broken = CoordinatorBuilder::new(test_configuration())
            .engine(Arc::new(
                ScriptedEngine::new().fail_prediction(EngineError::EmptyOutput),
            ))
            .build()
            .unwrap();
        assert!(!broken.engine_ready().await);
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_configuration() {
        let result = CoordinatorBuilder::new(Configuration::default())
            .sequence_length(0)
            .engine(Arc::new(ScriptedEngine::new()))
            .build();
        assert!(matches!(result, Err(AppError::InvalidConfig(_))));
    }
}
