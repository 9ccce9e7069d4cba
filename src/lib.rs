pub mod common;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod intake;
pub mod notify;
pub mod pipeline;
pub mod storage;
pub mod workers;

pub use config::Configuration;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{AppError, EngineError, ErrorKind};

pub use common::{ExtractedFrame, LiveFrame, Prediction};
pub use engine::{PredictionEngine, ProcessEngine, ScriptedEngine};
pub use intake::{FrameAck, LiveIngest};
pub use notify::{NotificationEvent, Notifier, Topic};
