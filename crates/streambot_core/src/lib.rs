#![forbid(unsafe_code)]

//! Bot runtime: token lifecycle, stream monitoring, scheduled broadcasts,
//! chat dispatch and the overlay history feed.

pub mod audience;
pub mod commands;
pub mod error;
pub mod history;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod statistics;
pub mod stream_monitor;
pub mod token_broker;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod scheduler_tests;

pub use error::{AuthError, ConnectionError, MonitorError, StartOutcome};
pub use history::{ChatHistory, PushEvent, PushHub, PushHubConfig, PushItem};
pub use scheduler::BroadcastScheduler;
pub use session::{BotEvent, BotSession, BotSessionConfig, BotSessionDeps};
pub use settings::{BotSettings, SharedSettings};
pub use stream_monitor::{StreamMonitor, StreamMonitorConfig};
pub use token_broker::{TokenBroker, TokenBrokerConfig};
