use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("Notification transport is not connected")]
    NotConnected,
    #[error("No frames found for video: {0}")]
    NoFramesFound(Uuid),
    #[error("Pose extraction produced no usable vectors ({extracted} extracted, {discarded} discarded)")]
    PoseExtractionFailed { extracted: usize, discarded: usize },
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Prediction failed after {attempts} attempts: {source}")]
    PredictionFailedAfterRetries {
        attempts: u32,
        #[source]
        source: EngineError,
    },
    #[error("Worker pool queue is full")]
    WorkerPoolSaturated,
    #[error("Worker pool is shut down")]
    WorkerPoolClosed,
    #[error("Session supervisor has stopped")]
    SupervisorStopped,
    #[error("Failed to persist prediction: {0}")]
    Persistence(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            AppError::NotConnected => ErrorKind::NotConnected,
            AppError::NoFramesFound(_) => ErrorKind::NoFramesFound,
            AppError::PoseExtractionFailed { .. } => ErrorKind::PoseExtractionFailed,
            AppError::Engine(_) => ErrorKind::EngineError,
            AppError::PredictionFailedAfterRetries { .. } => ErrorKind::PredictionFailedAfterRetries,
            AppError::WorkerPoolSaturated => ErrorKind::WorkerPoolSaturated,
            AppError::WorkerPoolClosed | AppError::SupervisorStopped => ErrorKind::ShuttingDown,
            AppError::Persistence(_) => ErrorKind::Persistence,
            AppError::InvalidConfig(_)
            | AppError::Config(_)
            | AppError::Io(_)
            | AppError::Json(_) => ErrorKind::Internal,
        }
    }
}

// Failures at the prediction engine process boundary
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to launch engine process: {0}")]
    Spawn(std::io::Error),
    #[error("Engine timed out after {0:?}")]
    Timeout(Duration),
    #[error("Engine exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("Engine produced no output")]
    EmptyOutput,
    #[error("Engine produced malformed output: {0}")]
    MalformedOutput(String),
    #[error("Engine reported failure: {0}")]
    Rejected(String),
    #[error("Failed to stage frames for the engine: {0}")]
    Staging(std::io::Error),
}

/// Serializable error category carried by `ProcessingError` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionNotFound,
    NotConnected,
    NoFramesFound,
    PoseExtractionFailed,
    EngineError,
    PredictionFailedAfterRetries,
    WorkerPoolSaturated,
    /// The service is stopping and no longer takes work.
    ShuttingDown,
    Persistence,
    Internal,
}

pub type Result<T> = std::result::Result<T, AppError>;
