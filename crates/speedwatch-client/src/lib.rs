pub mod config;
pub mod consumer;
pub mod error;
pub mod render;
pub mod session;

pub use config::{load_config, Config};
pub use consumer::{ConsumerEvent, ConsumerState, Failure, StreamConsumer, Transition};
pub use error::ClientError;
pub use session::{CancelHandle, HubClient, MeasurementSession, ValidateVerdict};

use tracing_subscriber::EnvFilter;

/// Logs go to stderr so the progress line owns stdout.
pub fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("SPEEDWATCH_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
