//! Engine context wiring the transport, state model and fuzzing decisions
//! together: per-channel workers, the event consumer and the global watchdog.

pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod watchdog;
pub mod worker;

pub use collab::{LogSink, Supervisor, TracingLogSink};
pub use config::{FuzzerConfig, LoggingConfig, WatchdogConfig};
pub use engine::{EngineBuilder, FuzzingEngine};
pub use error::{ConfigError, EngineError, SupervisorError};
pub use event::{EngineStats, PacketEvent, StatsSnapshot};
pub use logging::init_logging;
pub use watchdog::{Watchdog, WatchdogBuilder, WatchdogStatus};
pub use worker::{run_channel, ChannelControl, Intercepted, PacketProcessor, SharedComponents};
