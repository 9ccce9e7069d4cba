use crate::error::AppError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SIGNSIGHT";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub sequence: SequenceConfig,
    pub batch: BatchConfig,
    pub engine: EngineConfig,
    pub workers: WorkerConfig,
    pub notifier: NotifierConfig,
    pub sessions: SessionConfig,
    pub logging: LoggingConfig,
}

/// Live path: how frames are grouped into gesture sequences.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub length: usize,
    pub cooldown_ms: u64,
    pub publish_progress: bool,
}

/// Batch path: selection, feature extraction and quality filtering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_frames_per_video: usize,
    pub inter_batch_pause_ms: u64,
    pub quality_threshold: f32,
    pub feature_dimension: usize,
    pub verify_frame_files: bool,
}

/// External prediction engine process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub command_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            length: 30,
            cooldown_ms: 1000,
            publish_progress: false,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_frames_per_video: 100,
            inter_batch_pause_ms: 100,
            quality_threshold: 0.3,
            feature_dimension: 288,
            verify_frame_files: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("TF_CPP_MIN_LOG_LEVEL".to_string(), "2".to_string());
        env.insert("TF_ENABLE_ONEDNN_OPTS".to_string(), "0".to_string());
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        Self {
            program: "python3".to_string(),
            args: vec!["engine/sign_engine.py".to_string()],
            env,
            timeout_secs: 120,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            scratch_dir: std::env::temp_dir().join("signsight"),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 25,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            reap_interval_secs: 60,
            command_buffer: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SequenceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl BatchConfig {
    pub fn inter_batch_pause(&self) -> Duration {
        Duration::from_millis(self.inter_batch_pause_ms)
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Configuration {
    /// Loads defaults, then the optional file, then `SIGNSIGHT__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let configuration: Configuration = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sequence.length == 0 {
            return Err(invalid("sequence.length must be greater than 0"));
        }
        if self.batch.batch_size == 0 {
            return Err(invalid("batch.batch_size must be greater than 0"));
        }
        if self.batch.max_frames_per_video == 0 {
            return Err(invalid("batch.max_frames_per_video must be greater than 0"));
        }
        if self.batch.feature_dimension == 0 {
            return Err(invalid("batch.feature_dimension must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.batch.quality_threshold) {
            return Err(invalid("batch.quality_threshold must be between 0.0 and 1.0"));
        }
        if self.engine.program.trim().is_empty() {
            return Err(invalid("engine.program must not be empty"));
        }
        if self.engine.retry_attempts == 0 {
            return Err(invalid("engine.retry_attempts must be at least 1"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(invalid("engine.timeout_secs must be greater than 0"));
        }
        if self.workers.pool_size == 0 || self.workers.queue_capacity == 0 {
            return Err(invalid("workers.pool_size and workers.queue_capacity must be greater than 0"));
        }
        if self.notifier.channel_capacity == 0 {
            return Err(invalid("notifier.channel_capacity must be greater than 0"));
        }
        if self.sessions.command_buffer == 0 {
            return Err(invalid("sessions.command_buffer must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> AppError {
    AppError::InvalidConfig(message.to_string())
}
