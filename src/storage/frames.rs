use crate::common::ExtractedFrame;
use crate::error::AppError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Read side of the frames written during video ingestion.
#[async_trait]
pub trait FrameRepository: Send + Sync {
    /// All extracted frames for a video, in no particular order.
    async fn frames_for_video(&self, video_id: Uuid) -> Result<Vec<ExtractedFrame>, AppError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFrameRepository {
    frames: RwLock<HashMap<Uuid, Vec<ExtractedFrame>>>,
}

impl InMemoryFrameRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frames(frames: impl IntoIterator<Item = ExtractedFrame>) -> Self {
        let mut by_video: HashMap<Uuid, Vec<ExtractedFrame>> = HashMap::new();
        for frame in frames {
            by_video.entry(frame.video_id).or_default().push(frame);
        }
        Self {
            frames: RwLock::new(by_video),
        }
    }

    /// Loads a JSON array of frames. Relative `filePath`s resolve against
    /// the manifest's directory.
    pub async fn from_manifest(path: &Path) -> Result<Self, AppError> {
        let contents = tokio::fs::read_to_string(path).await?;
        let mut frames: Vec<ExtractedFrame> = serde_json::from_str(&contents)?;
        if let Some(base) = path.parent() {
            for frame in frames.iter_mut().filter(|f| f.file_path.is_relative()) {
                frame.file_path = base.join(&frame.file_path);
            }
        }
        tracing::info!("Loaded {} frames from {}", frames.len(), path.display());
        Ok(Self::with_frames(frames))
    }

    pub async fn insert(&self, frame: ExtractedFrame) {
        self.frames
            .write()
            .await
            .entry(frame.video_id)
            .or_default()
            .push(frame);
    }
}

#[async_trait]
impl FrameRepository for InMemoryFrameRepository {
    async fn frames_for_video(&self, video_id: Uuid) -> Result<Vec<ExtractedFrame>, AppError> {
        Ok(self
            .frames
            .read()
            .await
            .get(&video_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_are_grouped_by_video() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let repository = InMemoryFrameRepository::with_frames(vec![
            ExtractedFrame::new(a, "/a/1.jpg", 0.0),
            ExtractedFrame::new(b, "/b/1.jpg", 0.0),
            ExtractedFrame::new(a, "/a/2.jpg", 0.1),
        ]);
        repository.insert(ExtractedFrame::new(a, "/a/3.jpg", 0.2)).await;

        assert_eq!(repository.frames_for_video(a).await.unwrap().len(), 3);
        assert_eq!(repository.frames_for_video(b).await.unwrap().len(), 1);
        assert!(repository
            .frames_for_video(Uuid::new_v4())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn manifest_paths_resolve_against_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let video_id = Uuid::new_v4();
        let manifest = serde_json::json!([
            {"id": Uuid::new_v4(), "videoId": video_id, "filePath": "frames/0001.jpg", "timestampSeconds": 0.0, "motionScore": 0.4},
            {"id": Uuid::new_v4(), "videoId": video_id, "filePath": "/abs/0002.jpg", "timestampSeconds": 0.5, "isKeyframe": true}
        ]);
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, manifest.to_string()).unwrap();

        let repository = InMemoryFrameRepository::from_manifest(&path).await.unwrap();
        let mut frames = repository.frames_for_video(video_id).await.unwrap();
        frames.sort_by(|a, b| a.timestamp_seconds.total_cmp(&b.timestamp_seconds));

        assert_eq!(frames[0].file_path, dir.path().join("frames/0001.jpg"));
        assert_eq!(frames[0].motion_score, Some(0.4));
        assert_eq!(frames[1].file_path, Path::new("/abs/0002.jpg"));
        assert_eq!(frames[1].is_keyframe, Some(true));
    }

    #[tokio::test]
    async fn malformed_manifest_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            InMemoryFrameRepository::from_manifest(&path).await,
            Err(AppError::Json(_))
        ));
    }
}
