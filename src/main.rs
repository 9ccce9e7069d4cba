use clap::{Parser, Subcommand};
use signsight::config::Configuration;
use signsight::coordinator::{Coordinator, CoordinatorBuilder};
use signsight::error::AppError;
use signsight::intake::{CaptureThrottle, FrameAck};
use signsight::storage::InMemoryFrameRepository;
use signsight::{LiveFrame, NotificationEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "signsight", version, about = "Recognize signed gestures from video frames")]
struct Cli {
    /// TOML or JSON configuration file
    #[arg(long, global = true, env = "SIGNSIGHT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize an uploaded video from its extracted-frame manifest
    Batch {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        video: Uuid,
    },
    /// Replay a directory of images as a live camera session
    Live {
        #[arg(long)]
        frames: PathBuf,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Ask the engine whether it is up
    Check,
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    let configuration = Configuration::load(cli.config.as_deref())?;
    init_logging(&configuration.logging.level);

    match cli.command {
        Command::Batch { manifest, video } => run_batch(configuration, &manifest, video).await,
        Command::Live { frames, user } => run_live(configuration, &frames, user).await,
        Command::Check => {
            let mut coordinator = CoordinatorBuilder::new(configuration).build()?;
            let ready = coordinator.engine_ready().await;
            println!("{}", serde_json::json!({ "engine_ready": ready }));
            coordinator.shutdown().await;
            Ok(())
        }
    }
}

async fn run_batch(configuration: Configuration, manifest: &Path, video_id: Uuid) -> Result<(), AppError> {
    let frames = InMemoryFrameRepository::from_manifest(manifest).await?;
    let mut coordinator = CoordinatorBuilder::new(configuration)
        .frames(Arc::new(frames))
        .build()?;

    let result = coordinator.process_video(video_id).await;
    coordinator.shutdown().await;
    let prediction = result?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

async fn run_live(configuration: Configuration, frames_dir: &Path, user: String) -> Result<(), AppError> {
    let images = image_files(frames_dir).await?;
    info!("Replaying {} frames from {}", images.len(), frames_dir.display());
    let wait_limit = configuration.engine.timeout() * (configuration.engine.retry_attempts + 1);

    let mut coordinator = CoordinatorBuilder::new(configuration).build()?;
    let result = replay(&coordinator, &images, user, wait_limit).await;
    coordinator.shutdown().await;
    result
}

async fn replay(
    coordinator: &Coordinator,
    images: &[PathBuf],
    user: String,
    wait_limit: std::time::Duration,
) -> Result<(), AppError> {
    let live = coordinator.live();
    let session_id = live.start_session(user).await?;
    let mut events = live.events(session_id).await?;
    let mut throttle = CaptureThrottle::default();
    let mut dispatched = 0usize;

    for path in images {
        throttle.wait().await;
        let data = tokio::fs::read(path).await?;
        match live.send_frame(session_id, LiveFrame::new(data, chrono::Utc::now())).await? {
            FrameAck::SequenceDispatched { .. } => dispatched += 1,
            FrameAck::Dropped { reason } => info!("Frame {} dropped: {:?}", path.display(), reason),
            FrameAck::Accepted { .. } => {}
        }
    }
    if live.complete_sequence(session_id).await?.is_some() {
        dispatched += 1;
    }

    let mut delivered = 0usize;
    while delivered < dispatched {
        match tokio::time::timeout(wait_limit, events.next()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    delivered += 1;
                }
                print_event(&event)?;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Gave up waiting for {} outstanding sequences", dispatched - delivered);
                break;
            }
        }
    }

    let stats = live.session_stats(session_id).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    live.stop_session(session_id).await
}

fn print_event(event: &NotificationEvent) -> Result<(), AppError> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn image_files(dir: &Path) -> Result<Vec<PathBuf>, AppError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if is_image {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
