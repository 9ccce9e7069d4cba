use crate::common::{EnginePrediction, PoseFeatureVector};
use crate::config::EngineConfig;
use crate::engine::protocol::{EngineRequest, RawEngineResponse};
use crate::engine::{FrameSequence, PredictionEngine, PredictionRequest};
use crate::error::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

const MAX_STDERR_CHARS: usize = 2000;

/// Runs the engine as a child process per call: request JSON on stdin,
/// response JSON on stdout, killed when the wall-clock timeout expires.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl ProcessEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            timeout: config.timeout(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    async fn invoke(&self, request: &EngineRequest<'_>) -> Result<RawEngineResponse, EngineError> {
        let payload = request.to_json()?;
        let start = Instant::now();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        let stdin = child.stdin.take();
        let write_request = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    // Engines that take no input close stdin early.
                    debug!("Engine did not consume the request body: {}", e);
                }
            }
        };

        let run = async move {
            let ((), output) = tokio::join!(write_request, child.wait_with_output());
            output
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Err(_) => {
                error!("Engine timed out after {:?}", self.timeout);
                return Err(EngineError::Timeout(self.timeout));
            }
            Ok(Err(e)) => return Err(EngineError::Spawn(e)),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            error!(
                "Engine exited with {:?} after {}ms",
                output.status.code(),
                start.elapsed().as_millis()
            );
            return Err(EngineError::NonZeroExit {
                code: output.status.code(),
                stderr: truncate(stderr.trim(), MAX_STDERR_CHARS),
            });
        }
        if !stderr.trim().is_empty() {
            debug!("Engine log: {}", truncate(stderr.trim(), MAX_STDERR_CHARS));
        }
        debug!(
            "Engine answered in {}ms, output length {}",
            start.elapsed().as_millis(),
            stdout.len()
        );
        RawEngineResponse::parse(&stdout)
    }

    async fn predict_frames(&self, sequence: &FrameSequence) -> Result<EnginePrediction, EngineError> {
        let sequence_dir = self.scratch_dir.join(format!(
            "{}_{}",
            sequence.session_id,
            Utc::now().timestamp_millis()
        ));
        let result = match stage_frames(&sequence_dir, sequence).await {
            Ok(()) => {
                let request = EngineRequest::predict_staged_frames(
                    &sequence_dir,
                    sequence.session_id,
                    sequence.frames.len(),
                );
                match self.invoke(&request).await {
                    Ok(response) => response.into_prediction(),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = tokio::fs::remove_dir_all(&sequence_dir).await {
            warn!(
                "Failed to clean up staged sequence {}: {}",
                sequence_dir.display(),
                e
            );
        }
        result
    }
}

async fn stage_frames(sequence_dir: &Path, sequence: &FrameSequence) -> Result<(), EngineError> {
    tokio::fs::create_dir_all(sequence_dir)
        .await
        .map_err(EngineError::Staging)?;
    for (index, frame) in sequence.frames.iter().enumerate() {
        let frame_path = sequence_dir.join(format!("frame_{:03}.jpg", index));
        tokio::fs::write(&frame_path, frame.data())
            .await
            .map_err(EngineError::Staging)?;
    }
    debug!(
        "Staged {} frames to {}",
        sequence.frames.len(),
        sequence_dir.display()
    );
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[async_trait]
impl PredictionEngine for ProcessEngine {
    #[instrument(skip(self, request), fields(len = request.len()))]
    async fn predict(&self, request: &PredictionRequest) -> Result<EnginePrediction, EngineError> {
        match request {
            PredictionRequest::PoseSequence(vectors) => {
                self.invoke(&EngineRequest::predict_poses(vectors))
                    .await?
                    .into_prediction()
            }
            PredictionRequest::FrameSequence(sequence) => self.predict_frames(sequence).await,
        }
    }

    #[instrument(skip(self, frame_paths), fields(frames = frame_paths.len()))]
    async fn extract_features(
        &self,
        frame_paths: &[PathBuf],
    ) -> Result<Vec<PoseFeatureVector>, EngineError> {
        self.invoke(&EngineRequest::extract_features(frame_paths))
            .await?
            .into_features()
    }

    /// Any JSON reply to an empty predict request means the engine is up,
    /// whether or not it carries a prediction.
    async fn is_ready(&self) -> bool {
        match self.invoke(&EngineRequest::predict_poses(&[])).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Engine readiness check failed: {}", e);
                false
            }
        }
    }
}
