//! Capabilities the engine consumes from its host: process supervision and
//! a human-readable packet log.

use tracing::{error, info};

use crate::error::SupervisorError;

/// Controls the target protocol stack process.
pub trait Supervisor: Send + Sync {
    fn start(&self) -> Result<(), SupervisorError>;

    fn stop(&self) -> Result<(), SupervisorError>;

    fn restart(&self) -> Result<(), SupervisorError> {
        self.stop()?;
        self.start()
    }

    /// Register a callback for when the target exits on its own.
    fn on_exit(&self, callback: Box<dyn Fn(Option<i32>) + Send + Sync>);
}

/// Receives one line per packet event and per recoverable error.
pub trait LogSink: Send + Sync {
    fn write(&self, msg: &str, is_error: bool);
}

/// Forwards sink lines to `tracing` under the `packets` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, msg: &str, is_error: bool) {
        if is_error {
            error!(target: "packets", "{msg}");
        } else {
            info!(target: "packets", "{msg}");
        }
    }
}
