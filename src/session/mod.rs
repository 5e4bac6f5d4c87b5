//! Push-Channel Session
//!
//! One long-lived WebSocket carrying task progress, task logs and named
//! data channels, with automatic reconnect and subscription replay.
//!
//! ## Architecture
//!
//! - **Session / Supervisor**: Owns the connection lifecycle and reconnect policy
//! - **Registry**: Holds subscriptions across disconnects
//! - **Router**: Dispatches decoded frames to subscriber callbacks
//! - **Heartbeat**: Pings the server and flags silent connections
//! - **Codec**: Client and server frame formats
//!
//! ## Usage
//!
//! Channel keys address what to receive:
//! - `progress:{taskId}` - Progress updates for one task
//! - `log:{taskId}` - Log lines for one task
//! - `data:{name}` - A named data channel (e.g., `data:cpu`)
//! - `error:{taskId}` - Server-reported failures of one task (local only)
//! - anything else - Frames whose `type` equals the key
//!
//! ## Example
//!
//! ```rust,no_run
//! use pulse_link::{Session, SessionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new(SessionConfig::for_url("ws://localhost:8082/ws"))?;
//!
//! let _progress = session.subscribe_progress("task-42", |update| {
//!     println!("{}% {}", update.progress, update.status);
//! });
//!
//! session.connect()?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod registry;
pub mod router;
mod supervisor;
pub mod transport;
mod types;

pub use backoff::{Backoff, ReconnectState};
pub use codec::{InboundFrame, OutboundCommand};
pub use error::{CodecError, SessionError, SessionResult, TransportError};
pub use heartbeat::HeartbeatMonitor;
pub use registry::{Callback, Subscription, SubscriptionId, SubscriptionRegistry};
pub use router::{MessageRouter, RouteOutcome, RouterStats};
pub use supervisor::{
    ExhaustedFn, Session, SessionBuilder, SessionEvent, SessionStats, SubscriptionHandle,
};
pub use transport::{Connector, FrameSink, FrameSource, Link, TransportEvent, WebSocketConnector};
pub use types::{
    Channel, ConnectionState, LogEntry, Payload, ProgressUpdate, TargetKey, TaskFailure,
    ERROR_CHANNEL_PREFIX,
};
