//! Heartbeat Monitor
//!
//! Detects connections that died silently (NAT timeout, proxy black hole)
//! before the transport reports a close.
//!
//! Two independent timers run while the monitor is started:
//! - the *ping* timer emits a heartbeat command every `interval`;
//! - the *staleness* deadline is pushed forward by any inbound traffic,
//!   heartbeat replies or not.
//!
//! A connection that only ever receives data frames is therefore healthy.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::codec::OutboundCommand;

/// Callback used to emit heartbeat commands; returns false if nothing was sent
pub type SendFn = Arc<dyn Fn(OutboundCommand) -> bool + Send + Sync>;

/// Raised once when no inbound traffic arrived within the timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleConnection {
    /// Value returned by the [`HeartbeatMonitor::start`] call that raised it
    pub generation: u64,
    /// Time since the last inbound traffic
    pub silent_for: Duration,
}

struct Running {
    generation: u64,
    activity: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Periodic heartbeat sender plus inbound-silence detector
pub struct HeartbeatMonitor {
    stale_tx: mpsc::UnboundedSender<StaleConnection>,
    running: Option<Running>,
    next_generation: u64,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor reporting stale connections on `stale_tx`
    pub fn new(stale_tx: mpsc::UnboundedSender<StaleConnection>) -> Self {
        Self {
            stale_tx,
            running: None,
            next_generation: 1,
        }
    }

    /// Start pinging via `send` every `interval` and watching for `timeout` of silence
    ///
    /// Restarts the monitor if it is already running. Returns the generation
    /// tag carried by any [`StaleConnection`] this run raises.
    pub fn start(&mut self, send: SendFn, interval: Duration, timeout: Duration) -> u64 {
        self.stop();

        let generation = self.next_generation;
        self.next_generation += 1;

        let activity = Arc::new(Notify::new());
        let task = tokio::spawn(watch(
            generation,
            send,
            interval,
            timeout,
            Arc::clone(&activity),
            self.stale_tx.clone(),
        ));

        tracing::debug!(
            generation,
            interval_ms = interval.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "Heartbeat monitor started"
        );

        self.running = Some(Running {
            generation,
            activity,
            task,
        });
        generation
    }

    /// Liveness hook: any inbound message resets the staleness deadline
    pub fn record_activity(&self) {
        if let Some(running) = &self.running {
            running.activity.notify_one();
        }
    }

    /// Cancel both timers; calling it again is a no-op
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
            tracing::debug!(generation = running.generation, "Heartbeat monitor stopped");
        }
    }

    /// Generation of the current run, if any
    pub fn generation(&self) -> Option<u64> {
        self.running.as_ref().map(|r| r.generation)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch(
    generation: u64,
    send: SendFn,
    interval: Duration,
    timeout: Duration,
    activity: Arc<Notify>,
    stale_tx: mpsc::UnboundedSender<StaleConnection>,
) {
    let start = Instant::now();
    let mut ping = tokio::time::interval_at(start + interval, interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_seen = start;
    let deadline = tokio::time::sleep_until(start + timeout);
    tokio::pin!(deadline);
    let mut raised = false;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if !send(OutboundCommand::heartbeat_now()) {
                    tracing::trace!(generation, "Heartbeat not sent");
                }
            }
            _ = activity.notified() => {
                last_seen = Instant::now();
                deadline.as_mut().reset(last_seen + timeout);
                raised = false;
            }
            _ = &mut deadline, if !raised => {
                raised = true;
                let silent_for = last_seen.elapsed();
                tracing::warn!(
                    generation,
                    silent_ms = silent_for.as_millis() as u64,
                    "No inbound traffic within heartbeat timeout"
                );
                if stale_tx.send(StaleConnection { generation, silent_for }).is_err() {
                    return;
                }
            }
        }
    }
}
