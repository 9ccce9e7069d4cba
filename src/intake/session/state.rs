use crate::common::LiveFrame;
use crate::engine::FrameSequence;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePhase {
    Idle,
    Capturing,
    /// A full sequence is with the engine; new frames are dropped.
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Processing,
    CoolingDown,
}

/// What happened to one submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameAck {
    Accepted { frame_count: usize },
    SequenceDispatched { sequence_number: u64, frame_count: usize },
    Dropped { reason: DropReason },
}

#[derive(Debug)]
pub enum FrameOutcome {
    Accepted { frame_count: usize },
    SequenceFull(FrameSequence),
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub user_id: String,
    pub is_active: bool,
    pub phase: SequencePhase,
    pub frame_sequence_count: usize,
    pub sequences_started: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub predictions_made: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Per-session sequencer state. Owned by the session supervisor; nothing
/// else mutates it.
#[derive(Debug)]
pub struct LiveSession {
    session_id: Uuid,
    user_id: String,
    phase: SequencePhase,
    frames: Vec<LiveFrame>,
    frame_sequence_count: usize,
    sequence_number: u64,
    cooldown_until: Option<Instant>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_seen: Instant,
    frames_received: u64,
    frames_dropped: u64,
    predictions_made: u64,
    errors: u64,
}

impl LiveSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            user_id: user_id.into(),
            phase: SequencePhase::Idle,
            frames: Vec::new(),
            frame_sequence_count: 0,
            sequence_number: 0,
            cooldown_until: None,
            started_at: now,
            last_activity_at: now,
            last_seen: Instant::now(),
            frames_received: 0,
            frames_dropped: 0,
            predictions_made: 0,
            errors: 0,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn phase(&self) -> SequencePhase {
        self.phase
    }

    pub fn frame_sequence_count(&self) -> usize {
        self.frame_sequence_count
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_activity_at = Utc::now();
    }

    /// Frames arriving while a sequence is processing, or during the
    /// cool-down after it, are dropped and leave the counter untouched.
    pub fn accept_frame(
        &mut self,
        frame: LiveFrame,
        now: Instant,
        sequence_length: usize,
    ) -> FrameOutcome {
        self.touch(now);
        self.frames_received += 1;

        if self.phase == SequencePhase::Processing {
            self.frames_dropped += 1;
            return FrameOutcome::Dropped(DropReason::Processing);
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                self.frames_dropped += 1;
                return FrameOutcome::Dropped(DropReason::CoolingDown);
            }
            self.cooldown_until = None;
        }

        if self.phase == SequencePhase::Idle {
            self.sequence_number += 1;
            self.phase = SequencePhase::Capturing;
        }
        self.frames.push(frame);
        self.frame_sequence_count += 1;

        if self.frame_sequence_count >= sequence_length.max(1) {
            FrameOutcome::SequenceFull(self.begin_processing())
        } else {
            FrameOutcome::Accepted {
                frame_count: self.frame_sequence_count,
            }
        }
    }

    /// Dispatches whatever has been captured so far. No-op when nothing is
    /// captured or a sequence is already processing.
    pub fn complete(&mut self, now: Instant) -> Option<FrameSequence> {
        self.touch(now);
        match self.phase {
            SequencePhase::Capturing if !self.frames.is_empty() => Some(self.begin_processing()),
            _ => None,
        }
    }

    fn begin_processing(&mut self) -> FrameSequence {
        self.phase = SequencePhase::Processing;
        FrameSequence {
            session_id: self.session_id,
            sequence_number: self.sequence_number,
            frames: std::mem::take(&mut self.frames),
        }
    }

    /// Closes out the processing sequence. Returns false for a result that
    /// does not belong to the current sequence.
    pub fn finish_sequence(
        &mut self,
        sequence_number: u64,
        succeeded: bool,
        now: Instant,
        cooldown: Duration,
    ) -> bool {
        if self.phase != SequencePhase::Processing || sequence_number != self.sequence_number {
            return false;
        }
        if succeeded {
            self.predictions_made += 1;
        } else {
            self.errors += 1;
        }
        self.phase = SequencePhase::Idle;
        self.frame_sequence_count = 0;
        self.cooldown_until = (!cooldown.is_zero()).then(|| now + cooldown);
        true
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id,
            user_id: self.user_id.clone(),
            is_active: true,
            phase: self.phase,
            frame_sequence_count: self.frame_sequence_count,
            sequences_started: self.sequence_number,
            frames_received: self.frames_received,
            frames_dropped: self.frames_dropped,
            predictions_made: self.predictions_made,
            errors: self.errors,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
        }
    }
}
