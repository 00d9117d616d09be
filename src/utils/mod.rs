//! Utility modules: logging, retries, signals and time

pub mod logging;
pub mod retry;
pub mod signal;
pub mod time;

// Re-export commonly used items
pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use retry::{retry_async_with_backoff, RetryConfig};
pub use signal::{spawn_signal_listener, ShutdownMode, SupervisorSignal};
pub use time::{current_timestamp, log_timestamp};
