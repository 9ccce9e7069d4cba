use crate::common::LiveFrame;
use crate::config::{SequenceConfig, SessionConfig};
use crate::error::AppError;
use crate::intake::session::state::{FrameAck, SessionStats};
use crate::intake::session::supervisor::{PredictionContext, SessionCommand, SessionSupervisor};
use crate::notify::{NotificationEvent, Notifier, Topic};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cloneable front door of the live path. Every call is a message to the
/// session supervisor task.
#[derive(Clone)]
pub struct LiveIngest {
    command_tx: mpsc::Sender<SessionCommand>,
    notifier: Notifier,
}

impl LiveIngest {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, AppError> {
        let (responder, response_rx) = oneshot::channel();
        self.command_tx
            .send(command(responder))
            .await
            .map_err(|_| AppError::SupervisorStopped)?;
        response_rx.await.map_err(|_| AppError::SupervisorStopped)
    }

    pub async fn start_session(&self, user_id: impl Into<String>) -> Result<Uuid, AppError> {
        let user_id = user_id.into();
        debug!("Starting live session for {}", user_id);
        self.request(|responder| SessionCommand::Start { user_id, responder })
            .await?
    }

    /// Idempotent; an in-flight prediction still completes but is not delivered.
    pub async fn stop_session(&self, session_id: Uuid) -> Result<(), AppError> {
        self.request(|responder| SessionCommand::Stop {
            session_id,
            responder,
        })
        .await
    }

    pub async fn is_active(&self, session_id: Uuid) -> bool {
        self.request(|responder| SessionCommand::IsActive {
            session_id,
            responder,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn send_frame(&self, session_id: Uuid, frame: LiveFrame) -> Result<FrameAck, AppError> {
        self.request(|responder| SessionCommand::SubmitFrame {
            session_id,
            frame,
            responder,
        })
        .await?
    }

    /// Returns the dispatched sequence number, or `None` when there was
    /// nothing to dispatch.
    pub async fn complete_sequence(&self, session_id: Uuid) -> Result<Option<u64>, AppError> {
        self.request(|responder| SessionCommand::CompleteSequence {
            session_id,
            responder,
        })
        .await?
    }

    pub async fn session_stats(&self, session_id: Uuid) -> Result<SessionStats, AppError> {
        self.request(|responder| SessionCommand::Stats {
            session_id,
            responder,
        })
        .await?
    }

    pub async fn list_sessions(&self) -> Result<Vec<Uuid>, AppError> {
        self.request(|responder| SessionCommand::ListSessions { responder })
            .await
    }

    pub async fn reap_idle(&self, idle_for: Duration) -> Result<Vec<Uuid>, AppError> {
        self.request(|responder| SessionCommand::ReapIdle {
            idle_for,
            responder,
        })
        .await
    }

    pub async fn subscribe(
        &self,
        session_id: Uuid,
    ) -> Result<broadcast::Receiver<NotificationEvent>, AppError> {
        if !self.is_active(session_id).await {
            return Err(AppError::SessionNotFound(session_id));
        }
        Ok(self.notifier.subscribe(Topic::Session(session_id)))
    }

    /// Like [`LiveIngest::subscribe`], skipping over lag gaps. Ends when the
    /// session stops.
    pub async fn events(
        &self,
        session_id: Uuid,
    ) -> Result<impl Stream<Item = NotificationEvent> + Unpin + use<>, AppError> {
        let receiver = self.subscribe(session_id).await?;
        Ok(BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Session {} subscriber lagged: {}", session_id, e);
                None
            }
        }))
    }
}

pub struct SessionManager {
    supervisor_task: JoinHandle<()>,
    reaper_task: JoinHandle<()>,
}

impl SessionManager {
    pub fn start(
        notifier: Notifier,
        context: PredictionContext,
        sequence: SequenceConfig,
        sessions: &SessionConfig,
        cancel_token: CancellationToken,
    ) -> (Self, LiveIngest) {
        let (command_tx, command_rx) = mpsc::channel(sessions.command_buffer.max(1));
        let supervisor =
            SessionSupervisor::new(notifier.clone(), context, sequence, command_tx.downgrade());
        let supervisor_task = tokio::spawn(supervisor.run(command_rx, cancel_token.clone()));

        let ingest = LiveIngest {
            command_tx,
            notifier,
        };
        let reaper_task = Self::start_reaper(
            ingest.clone(),
            sessions.reap_interval(),
            sessions.idle_timeout(),
            cancel_token,
        );
        (
            Self {
                supervisor_task,
                reaper_task,
            },
            ingest,
        )
    }

    fn start_reaper(
        ingest: LiveIngest,
        every: Duration,
        idle_for: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => match ingest.reap_idle(idle_for).await {
                        Ok(reaped) if !reaped.is_empty() => {
                            debug!("Reaped {} idle sessions", reaped.len());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Stopping session reaper: {}", e);
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Waits for the supervisor and reaper to exit after cancellation.
    pub async fn join(self) {
        if let Err(e) = self.supervisor_task.await {
            warn!("Session supervisor task failed: {}", e);
        }
        if let Err(e) = self.reaper_task.await {
            warn!("Session reaper task failed: {}", e);
        }
    }
}
