use crate::common::{LiveFrame, LiveSequenceInfo, Prediction, PredictionMetadata, PredictionSubject};
use crate::config::SequenceConfig;
use crate::engine::{FrameSequence, PredictionEngine, PredictionRequest, RetryPolicy};
use crate::error::AppError;
use crate::intake::session::state::{FrameAck, FrameOutcome, LiveSession, SessionStats};
use crate::notify::{NotificationEvent, Notifier, Topic};
use crate::storage::PredictionRepository;
use crate::workers::WorkerPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub enum SessionCommand {
    Start {
        user_id: String,
        responder: oneshot::Sender<Result<Uuid, AppError>>,
    },
    Stop {
        session_id: Uuid,
        responder: oneshot::Sender<()>,
    },
    IsActive {
        session_id: Uuid,
        responder: oneshot::Sender<bool>,
    },
    SubmitFrame {
        session_id: Uuid,
        frame: LiveFrame,
        responder: oneshot::Sender<Result<FrameAck, AppError>>,
    },
    CompleteSequence {
        session_id: Uuid,
        responder: oneshot::Sender<Result<Option<u64>, AppError>>,
    },
    SequenceFinished {
        session_id: Uuid,
        sequence_number: u64,
        outcome: Result<Prediction, AppError>,
    },
    Stats {
        session_id: Uuid,
        responder: oneshot::Sender<Result<SessionStats, AppError>>,
    },
    ListSessions {
        responder: oneshot::Sender<Vec<Uuid>>,
    },
    ReapIdle {
        idle_for: Duration,
        responder: oneshot::Sender<Vec<Uuid>>,
    },
}

/// Everything a live prediction job needs, shared by all sessions.
#[derive(Clone)]
pub struct PredictionContext {
    pub engine: Arc<dyn PredictionEngine>,
    pub predictions: Arc<dyn PredictionRepository>,
    pub retry: RetryPolicy,
    pub pool: WorkerPool,
}

/// Owns the live session registry. Runs as a single task, so per-session
/// state needs no locking; engine work happens on the worker pool and
/// reports back through `SequenceFinished`.
pub struct SessionSupervisor {
    sessions: HashMap<Uuid, LiveSession>,
    notifier: Notifier,
    context: PredictionContext,
    sequence: SequenceConfig,
    command_tx: mpsc::WeakSender<SessionCommand>,
}

impl SessionSupervisor {
    pub fn new(
        notifier: Notifier,
        context: PredictionContext,
        sequence: SequenceConfig,
        command_tx: mpsc::WeakSender<SessionCommand>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            notifier,
            context,
            sequence,
            command_tx,
        }
    }

    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        info!(
            "Session supervisor stopped with {} open sessions",
            self.sessions.len()
        );
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start { user_id, responder } => {
                let _ = responder.send(self.start(user_id));
            }
            SessionCommand::Stop {
                session_id,
                responder,
            } => {
                self.stop(session_id);
                let _ = responder.send(());
            }
            SessionCommand::IsActive {
                session_id,
                responder,
            } => {
                let _ = responder.send(self.sessions.contains_key(&session_id));
            }
            SessionCommand::SubmitFrame {
                session_id,
                frame,
                responder,
            } => {
                let _ = responder.send(self.submit_frame(session_id, frame));
            }
            SessionCommand::CompleteSequence {
                session_id,
                responder,
            } => {
                let _ = responder.send(self.complete_sequence(session_id));
            }
            SessionCommand::SequenceFinished {
                session_id,
                sequence_number,
                outcome,
            } => self.finish(session_id, sequence_number, outcome),
            SessionCommand::Stats {
                session_id,
                responder,
            } => {
                let stats = self
                    .sessions
                    .get(&session_id)
                    .map(LiveSession::stats)
                    .ok_or(AppError::SessionNotFound(session_id));
                let _ = responder.send(stats);
            }
            SessionCommand::ListSessions { responder } => {
                let _ = responder.send(self.sessions.keys().copied().collect());
            }
            SessionCommand::ReapIdle {
                idle_for,
                responder,
            } => {
                let _ = responder.send(self.reap_idle(idle_for));
            }
        }
    }

    fn start(&mut self, user_id: String) -> Result<Uuid, AppError> {
        if !self.notifier.is_connected() {
            return Err(AppError::NotConnected);
        }
        let session = LiveSession::new(user_id);
        let session_id = session.session_id();
        info!("Live session {} started", session_id);
        self.sessions.insert(session_id, session);
        Ok(session_id)
    }

    /// Unknown sessions are ignored so stopping twice is harmless.
    fn stop(&mut self, session_id: Uuid) {
        if let Some(session) = self.sessions.remove(&session_id) {
            let stats = session.stats();
            info!(
                "Live session {} stopped after {} predictions, {} errors",
                session_id, stats.predictions_made, stats.errors
            );
            self.notifier.close_topic(Topic::Session(session_id));
        }
    }

    fn submit_frame(&mut self, session_id: Uuid, frame: LiveFrame) -> Result<FrameAck, AppError> {
        let length = self.sequence.length;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(AppError::SessionNotFound(session_id))?;

        match session.accept_frame(frame, Instant::now(), length) {
            FrameOutcome::Accepted { frame_count } => {
                if self.sequence.publish_progress {
                    self.notifier.publish(
                        Topic::Session(session_id),
                        NotificationEvent::SequenceProgress {
                            frame_count,
                            sequence_length: length,
                        },
                    );
                }
                Ok(FrameAck::Accepted { frame_count })
            }
            FrameOutcome::SequenceFull(sequence) => {
                let ack = FrameAck::SequenceDispatched {
                    sequence_number: sequence.sequence_number,
                    frame_count: sequence.frames.len(),
                };
                self.dispatch(sequence);
                Ok(ack)
            }
            FrameOutcome::Dropped(reason) => {
                debug!("Session {} dropped a frame: {:?}", session_id, reason);
                Ok(FrameAck::Dropped { reason })
            }
        }
    }

    fn complete_sequence(&mut self, session_id: Uuid) -> Result<Option<u64>, AppError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(AppError::SessionNotFound(session_id))?;
        let Some(sequence) = session.complete(Instant::now()) else {
            return Ok(None);
        };
        let sequence_number = sequence.sequence_number;
        debug!(
            "Session {} completing sequence {} early with {} frames",
            session_id,
            sequence_number,
            sequence.frames.len()
        );
        self.dispatch(sequence);
        Ok(Some(sequence_number))
    }

    /// Never blocks: a full worker queue ends the sequence with an error.
    fn dispatch(&mut self, sequence: FrameSequence) {
        let session_id = sequence.session_id;
        let sequence_number = sequence.sequence_number;
        let Some(done_tx) = self.command_tx.upgrade() else {
            self.finish(session_id, sequence_number, Err(AppError::SupervisorStopped));
            return;
        };
        let job = predict_sequence(self.context.clone(), sequence, done_tx);
        match self.context.pool.try_submit(job) {
            Ok(()) => debug!(
                "Session {} sequence {} queued for prediction",
                session_id, sequence_number
            ),
            Err(e) => {
                warn!(
                    "Session {} sequence {} not queued: {}",
                    session_id, sequence_number, e
                );
                self.finish(session_id, sequence_number, Err(e));
            }
        }
    }

    /// Publishes the one terminal event for a sequence and re-arms the session.
    fn finish(&mut self, session_id: Uuid, sequence_number: u64, outcome: Result<Prediction, AppError>) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!(
                "Session {} closed before sequence {} finished, discarding result",
                session_id, sequence_number
            );
            return;
        };
        if !session.finish_sequence(
            sequence_number,
            outcome.is_ok(),
            Instant::now(),
            self.sequence.cooldown(),
        ) {
            warn!(
                "Ignoring stale result for session {} sequence {}",
                session_id, sequence_number
            );
            return;
        }
        let event = match &outcome {
            Ok(prediction) => {
                info!(
                    "Session {} sequence {}: {:?} ({:.2})",
                    session_id, sequence_number, prediction.predicted_text, prediction.confidence
                );
                NotificationEvent::prediction_ready(prediction)
            }
            Err(e) => {
                error!(
                    "Session {} sequence {} failed: {}",
                    session_id, sequence_number, e
                );
                NotificationEvent::processing_error(e)
            }
        };
        self.notifier.publish(Topic::Session(session_id), event);
    }

    fn reap_idle(&mut self, idle_for: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let idle: Vec<Uuid> = self
            .sessions
            .values()
            .filter(|session| session.idle_for(now) >= idle_for)
            .map(LiveSession::session_id)
            .collect();
        for session_id in &idle {
            info!("Reaping idle session {}", session_id);
            self.stop(*session_id);
        }
        idle
    }
}

async fn predict_sequence(
    context: PredictionContext,
    sequence: FrameSequence,
    done_tx: mpsc::Sender<SessionCommand>,
) {
    let start = std::time::Instant::now();
    let session_id = sequence.session_id;
    let sequence_number = sequence.sequence_number;
    let frame_count = sequence.frames.len();
    let request = PredictionRequest::FrameSequence(sequence);

    let outcome = match context.retry.predict(context.engine.as_ref(), &request).await {
        Ok(answer) => {
            let engine_info = answer.processing_info.clone();
            let prediction = Prediction::new(
                PredictionSubject::Session(session_id),
                answer,
                start.elapsed().as_millis() as u64,
                PredictionMetadata::Live {
                    sequence: LiveSequenceInfo {
                        sequence_number,
                        frame_count,
                    },
                    engine: engine_info,
                },
            );
            context
                .predictions
                .save(&prediction)
                .await
                .map(|()| prediction)
        }
        Err(e) => Err(e),
    };

    let finished = SessionCommand::SequenceFinished {
        session_id,
        sequence_number,
        outcome,
    };
    if done_tx.send(finished).await.is_err() {
        debug!("Supervisor gone before session {} result arrived", session_id);
    }
}
