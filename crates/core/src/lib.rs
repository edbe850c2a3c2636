pub mod clock;
pub mod config;
pub mod errors;
pub mod feedback;
pub mod unwrap;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use errors::{ApplicationError, DeliveryFailure, InterfaceError};
pub use feedback::{spawn_sweeper, FeedbackRecord, FeedbackTracker, SWEEP_INTERVAL};
pub use unwrap::{unwrap_output, unwrap_with_depth, UnwrappedOutput, MAX_UNWRAP_DEPTH};
