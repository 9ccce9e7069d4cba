use crate::common::EnginePrediction;
use crate::engine::{PredictionEngine, PredictionRequest};
use crate::error::{AppError, EngineError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Linear-growth backoff: attempt `n` failing waits `n * base_delay` before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Runs `call` until it succeeds or attempts run out. The last engine
    /// failure is carried unchanged inside `PredictionFailedAfterRetries`.
    pub async fn run<T, F, Fut>(&self, mut call: F) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 1;
        loop {
            debug!("Engine attempt {} of {}", attempt, self.attempts);
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => {
                    warn!("Engine attempt {} failed, giving up: {}", attempt, e);
                    return Err(AppError::PredictionFailedAfterRetries {
                        attempts: self.attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "Engine attempt {} failed, retrying in {:?}: {}",
                        attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn predict<E>(
        &self,
        engine: &E,
        request: &PredictionRequest,
    ) -> Result<EnginePrediction, AppError>
    where
        E: PredictionEngine + ?Sized,
    {
        self.run(|_| engine.predict(request)).await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use tokio::time::Instant;

    fn prediction(text: &str) -> EnginePrediction {
        EnginePrediction {
            text: text.to_string(),
            confidence: 0.9,
            model_version: "test".to_string(),
            processing_info: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_uses_three_calls() {
        let engine = ScriptedEngine::new()
            .fail_prediction(EngineError::EmptyOutput)
            .fail_prediction(EngineError::Timeout(Duration::from_secs(1)))
            .succeed_prediction(prediction("hello"));
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let result = policy
            .predict(&engine, &PredictionRequest::PoseSequence(Vec::new()))
            .await
            .unwrap();

        assert_eq!(result.text, "hello");
        assert_eq!(engine.predict_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_reports_last_failure() {
        let engine = ScriptedEngine::new()
            .fail_prediction(EngineError::EmptyOutput)
            .fail_prediction(EngineError::EmptyOutput)
            .fail_prediction(EngineError::Rejected("last".to_string()));
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let error = policy
            .predict(&engine, &PredictionRequest::PoseSequence(Vec::new()))
            .await
            .unwrap_err();

        match error {
            AppError::PredictionFailedAfterRetries { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, EngineError::Rejected(m) if m == "last"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(engine.predict_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_with_attempt_number() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let start = Instant::now();
        let result: Result<(), AppError> = policy.run(|_| async { Err(EngineError::EmptyOutput) }).await;
        assert!(result.is_err());
        // 100ms after the first failure, 200ms after the second, none after the last.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
    }
}
