//! Frame Codec
//!
//! Encodes outgoing commands into JSON text frames and decodes inbound
//! frames into [`InboundFrame`]. Stateless; every function is pure.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::error::CodecError;
use super::types::{Channel, LogEntry, ProgressUpdate, TargetKey, TaskFailure};

/// Commands sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    /// Start receiving frames for a target
    Subscribe(TargetKey),
    /// Stop receiving frames for a target
    Unsubscribe(TargetKey),
    /// Liveness ping
    Heartbeat {
        /// Timestamp in milliseconds
        timestamp: i64,
    },
    /// Caller-defined message; must carry its own string `type`
    Message(Map<String, Value>),
}

impl OutboundCommand {
    /// Heartbeat stamped with the current wall clock
    pub fn heartbeat_now() -> Self {
        OutboundCommand::Heartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A decoded server frame
///
/// Transient: parsed, routed and dropped within a single dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Heartbeat {
        timestamp: Option<i64>,
    },
    Progress {
        task_id: String,
        update: ProgressUpdate,
    },
    Log {
        task_id: String,
        entry: LogEntry,
    },
    Data {
        channel: String,
        data: Value,
    },
    Error {
        task_id: Option<String>,
        failure: TaskFailure,
    },
    /// Any other `type`; the body is the frame without its `type` field
    Custom {
        kind: String,
        body: Value,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressFrame {
    task_id: String,
    progress: f64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogFrame {
    task_id: String,
    #[serde(default = "default_log_level")]
    level: String,
    content: String,
    #[serde(default)]
    timestamp: Option<i64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Deserialize)]
struct DataFrame {
    channel: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorFrame {
    #[serde(default)]
    task_id: Option<String>,
    error: String,
    #[serde(default)]
    code: Option<i64>,
}

/// Encode a command to its wire text
pub fn encode(command: &OutboundCommand) -> Result<String, CodecError> {
    let value = match command {
        OutboundCommand::Subscribe(target) => target_command("subscribe", target),
        OutboundCommand::Unsubscribe(target) => target_command("unsubscribe", target),
        OutboundCommand::Heartbeat { timestamp } => json!({
            "type": "heartbeat",
            "timestamp": timestamp,
        }),
        OutboundCommand::Message(fields) => {
            if !matches!(fields.get("type"), Some(Value::String(_))) {
                return Err(CodecError::MissingType);
            }
            Value::Object(fields.clone())
        }
    };

    Ok(serde_json::to_string(&value)?)
}

fn target_command(kind: &str, target: &TargetKey) -> Value {
    match target.channel {
        Channel::Progress | Channel::Log => json!({
            "type": kind,
            "channel": target.channel.as_str(),
            "taskId": target.key,
        }),
        Channel::Data | Channel::Custom => json!({
            "type": kind,
            "channel": target.channel.as_str(),
            "target": target.key,
        }),
    }
}

/// Decode one inbound text frame
///
/// Unknown `type` values decode to [`InboundFrame::Custom`]; only
/// unparseable input, non-objects, a missing `type`, or a known type with
/// invalid fields are errors.
pub fn decode(text: &str) -> Result<InboundFrame, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(CodecError::Malformed)?;
    let Value::Object(mut fields) = value else {
        return Err(CodecError::NotAnObject);
    };

    let kind = match fields.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(CodecError::MissingType),
    };

    let frame = match kind.as_str() {
        "heartbeat" => InboundFrame::Heartbeat {
            timestamp: fields.get("timestamp").and_then(Value::as_i64),
        },
        "progress" => {
            let frame: ProgressFrame = typed(&kind, fields)?;
            InboundFrame::Progress {
                task_id: frame.task_id,
                update: ProgressUpdate {
                    progress: frame.progress,
                    status: frame.status,
                    detail: frame.detail,
                },
            }
        }
        "log" => {
            let frame: LogFrame = typed(&kind, fields)?;
            InboundFrame::Log {
                task_id: frame.task_id,
                entry: LogEntry {
                    level: frame.level,
                    content: frame.content,
                    timestamp: frame.timestamp,
                },
            }
        }
        "data" => {
            let frame: DataFrame = typed(&kind, fields)?;
            InboundFrame::Data {
                channel: frame.channel,
                data: frame.data,
            }
        }
        "error" => {
            let frame: ErrorFrame = typed(&kind, fields)?;
            InboundFrame::Error {
                task_id: frame.task_id,
                failure: TaskFailure {
                    error: frame.error,
                    code: frame.code,
                },
            }
        }
        _ => {
            fields.remove("type");
            InboundFrame::Custom {
                kind,
                body: Value::Object(fields),
            }
        }
    };

    Ok(frame)
}

fn typed<T: DeserializeOwned>(kind: &str, fields: Map<String, Value>) -> Result<T, CodecError> {
    serde_json::from_value(Value::Object(fields)).map_err(|source| CodecError::InvalidFrame {
        kind: kind.to_string(),
        source,
    })
}
