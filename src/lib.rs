//! # Pulse Link
//!
//! Persistent push-channel client for live dashboards. A single WebSocket
//! multiplexes per-task progress, per-task logs and named data channels;
//! the session reconnects with exponential backoff and replays every
//! subscription on each new connection.
//!
//! ## Features
//!
//! - **Multiplexing**: Any number of subscriptions over one socket
//! - **Resilience**: Capped exponential backoff, heartbeat-based stale detection
//! - **Replay**: Subscriptions survive reconnects, re-announced exactly once
//! - **Isolation**: A failing frame or panicking callback never stops the stream
//!
//! ## Modules
//!
//! - [`session`]: Connection supervisor, registry, router and wire codec
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulse_link::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(SessionConfig::for_url("ws://localhost:8082/ws"))?;
//!
//!     let _logs = session.subscribe_logs("build-17", |entry| {
//!         println!("[{}] {}", entry.level, entry.content);
//!     });
//!     let _cpu = session.subscribe_data("cpu", |value| println!("cpu: {}", value));
//!
//!     session.connect()?;
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Graceful shutdown
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod session;

// Re-export top-level types for convenience
pub use session::{
    Channel, ConnectionState, LogEntry, OutboundCommand, Payload, ProgressUpdate, Session,
    SessionBuilder, SessionError, SessionEvent, SessionResult, SessionStats, SubscriptionHandle,
    TargetKey, TaskFailure,
};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig, SessionConfig};
