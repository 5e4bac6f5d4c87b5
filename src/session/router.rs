//! Message Router
//!
//! Maps each decoded frame to its `(channel, target)` and invokes the
//! registered callback synchronously. Frames are dispatched in arrival
//! order; nothing is buffered or reordered here.

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::codec::{self, InboundFrame};
use super::registry::{Callback, SubscriptionRegistry};
use super::types::{Payload, TargetKey};

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Heartbeat frame; liveness only, no subscriber dispatch
    Heartbeat,
    /// Delivered to a subscriber
    Dispatched,
    /// Delivered, but the subscriber panicked
    CallbackFailed,
    /// No subscriber registered for the frame's target
    Unmatched,
    /// Text could not be decoded
    Rejected,
}

/// Router counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub heartbeats: u64,
    pub dispatched: u64,
    pub unmatched: u64,
    pub decode_errors: u64,
    pub callback_failures: u64,
}

#[derive(Default)]
struct Counters {
    heartbeats: AtomicU64,
    dispatched: AtomicU64,
    unmatched: AtomicU64,
    decode_errors: AtomicU64,
    callback_failures: AtomicU64,
}

/// Dispatches frames to the callbacks held in a [`SubscriptionRegistry`]
pub struct MessageRouter {
    registry: Arc<SubscriptionRegistry>,
    counters: Counters,
}

impl MessageRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            counters: Counters::default(),
        }
    }

    /// Decode and route one text frame
    ///
    /// A decode failure is logged and counted; it never affects the
    /// connection or later frames.
    pub fn route_text(&self, text: &str) -> RouteOutcome {
        match codec::decode(text) {
            Ok(frame) => self.route(frame),
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, len = text.len(), "Dropping undecodable frame");
                RouteOutcome::Rejected
            }
        }
    }

    /// Route a decoded frame
    pub fn route(&self, frame: InboundFrame) -> RouteOutcome {
        let (target, payload) = match frame {
            InboundFrame::Heartbeat { .. } => {
                self.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
                return RouteOutcome::Heartbeat;
            }
            InboundFrame::Progress { task_id, update } => {
                (TargetKey::progress(task_id), Payload::Progress(update))
            }
            InboundFrame::Log { task_id, entry } => (TargetKey::log(task_id), Payload::Log(entry)),
            InboundFrame::Data { channel, data } => (TargetKey::data(channel), Payload::Data(data)),
            InboundFrame::Error { task_id, failure } => {
                // Type-keyed `error` subscribers first, then the task's error channel
                let mut targets = vec![TargetKey::custom("error")];
                match &task_id {
                    Some(task_id) => targets.push(TargetKey::error(task_id)),
                    None => tracing::debug!(error = %failure.error, code = ?failure.code, "Server error without task id"),
                }
                return self.dispatch_all(&targets, &Payload::Error(failure));
            }
            InboundFrame::Custom { kind, body } => (TargetKey::custom(kind), Payload::Custom(body)),
        };

        self.dispatch_all(std::slice::from_ref(&target), &payload)
    }

    /// Invoke every registered callback among `targets`, in order
    ///
    /// `Unmatched` only when none of them is registered; `CallbackFailed`
    /// when any invoked callback panicked.
    fn dispatch_all(&self, targets: &[TargetKey], payload: &Payload) -> RouteOutcome {
        let mut outcome = RouteOutcome::Unmatched;

        // The registry lock is released before each callback runs, so
        // callbacks may subscribe or unsubscribe freely.
        for target in targets {
            let Some(callback) = self.registry.dispatch_target(target) else {
                continue;
            };
            match self.invoke(target, &callback, payload) {
                RouteOutcome::CallbackFailed => outcome = RouteOutcome::CallbackFailed,
                _ if outcome == RouteOutcome::Unmatched => outcome = RouteOutcome::Dispatched,
                _ => {}
            }
        }

        if outcome == RouteOutcome::Unmatched {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = ?targets.last(), "No subscriber for frame");
        }
        outcome
    }

    fn invoke(&self, target: &TargetKey, callback: &Callback, payload: &Payload) -> RouteOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
            Ok(()) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %target, "Routed frame");
                RouteOutcome::Dispatched
            }
            Err(cause) => {
                self.counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %target,
                    cause = panic_message(cause.as_ref()),
                    "Subscriber callback panicked"
                );
                RouteOutcome::CallbackFailed
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            heartbeats: self.counters.heartbeats.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            callback_failures: self.counters.callback_failures.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
