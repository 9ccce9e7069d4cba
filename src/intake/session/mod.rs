pub mod manager;
pub mod state;
pub mod supervisor;
pub mod throttle;

pub use manager::{LiveIngest, SessionManager};
pub use state::{DropReason, FrameAck, SequencePhase, SessionStats};
pub use supervisor::{PredictionContext, SessionSupervisor};
pub use throttle::CaptureThrottle;
