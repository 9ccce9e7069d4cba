use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(200);

/// Capture-side rate limit (5 fps by default). The sequencer never throttles
/// on its own; callers feeding it camera frames use this.
#[derive(Debug, Clone)]
pub struct CaptureThrottle {
    interval: Duration,
    last_capture: Option<Instant>,
}

impl CaptureThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_capture: None,
        }
    }

    /// True when a frame may be captured at `now`; records the capture.
    pub fn try_capture(&mut self, now: Instant) -> bool {
        match self.last_capture {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_capture = Some(now);
                true
            }
        }
    }

    /// Sleeps until the next capture slot and claims it.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_capture {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last_capture = Some(Instant::now());
    }
}

impl Default for CaptureThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_INTERVAL)
    }
}
