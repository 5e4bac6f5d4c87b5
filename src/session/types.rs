//! Session data model
//!
//! Connection states, channel addressing and the typed payloads handed to
//! subscriber callbacks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the synthetic per-task error channel
pub const ERROR_CHANNEL_PREFIX: &str = "error:";

/// Lifecycle state of the push channel
///
/// Only the session task writes it; everyone else reads a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Logical message category multiplexed over the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Progress,
    Log,
    Data,
    Custom,
}

impl Channel {
    /// Name used for this channel on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Progress => "progress",
            Channel::Log => "log",
            Channel::Data => "data",
            Channel::Custom => "custom",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(channel, target)` address
///
/// The target is a task id for progress and log, a channel name for data,
/// and the full channel key for custom subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub channel: Channel,
    pub key: String,
}

impl TargetKey {
    pub fn new(channel: Channel, key: impl Into<String>) -> Self {
        Self {
            channel,
            key: key.into(),
        }
    }

    pub fn progress(task_id: impl Into<String>) -> Self {
        Self::new(Channel::Progress, task_id)
    }

    pub fn log(task_id: impl Into<String>) -> Self {
        Self::new(Channel::Log, task_id)
    }

    pub fn data(name: impl Into<String>) -> Self {
        Self::new(Channel::Data, name)
    }

    pub fn custom(key: impl Into<String>) -> Self {
        Self::new(Channel::Custom, key)
    }

    /// The synthetic `error:<taskId>` channel
    pub fn error(task_id: &str) -> Self {
        Self::custom(format!("{}{}", ERROR_CHANNEL_PREFIX, task_id))
    }

    /// Parse a channel key such as `progress:t1`, `data:cpu` or `error:t1`
    ///
    /// Keys without a recognised prefix (or with an empty target) address a
    /// custom channel named by the whole key.
    pub fn parse(channel_key: &str) -> Self {
        match channel_key.split_once(':') {
            Some((prefix, target)) if !target.is_empty() => match prefix {
                "progress" => Self::progress(target),
                "log" | "logs" => Self::log(target),
                "data" => Self::data(target),
                _ => Self::custom(channel_key),
            },
            _ => Self::custom(channel_key),
        }
    }

    /// Local-only subscriptions are never announced to the server
    pub fn is_local(&self) -> bool {
        self.channel == Channel::Custom && self.key.starts_with(ERROR_CHANNEL_PREFIX)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Channel::Custom => f.write_str(&self.key),
            channel => write!(f, "{}:{}", channel, self.key),
        }
    }
}

/// Task progress update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Completion percentage, 0-100
    pub progress: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One task log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub content: String,
    /// Timestamp in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Server-reported task failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// What a subscriber callback receives
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Progress(ProgressUpdate),
    Log(LogEntry),
    Data(serde_json::Value),
    Error(TaskFailure),
    Custom(serde_json::Value),
}
