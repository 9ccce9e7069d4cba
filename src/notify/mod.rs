pub mod event;
pub mod notifier;

pub use event::{NotificationEvent, Topic};
pub use notifier::Notifier;
