//! Live path: camera frames in, one prediction per gesture sequence out.

pub mod session;

pub use session::{CaptureThrottle, FrameAck, LiveIngest, SessionManager, SessionStats};
