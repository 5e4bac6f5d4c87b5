//! Connection Supervisor
//!
//! One background task owns the socket and drives the lifecycle
//! `Disconnected → Connecting → Connected → Reconnecting/Closing → ...`.
//! [`Session`] is a cloneable handle that sends commands to that task and
//! reads shared state (registry, counters, current state) directly.
//!
//! Every subscription in the registry is re-announced exactly once per
//! connection epoch, and always before the first inbound frame of that
//! epoch is routed.

use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Sleep;
use url::Url;

use super::backoff::{Backoff, ReconnectState};
use super::codec::{self, OutboundCommand};
use super::error::{SessionError, SessionResult, TransportError};
use super::heartbeat::{HeartbeatMonitor, SendFn, StaleConnection};
use super::registry::{Callback, Subscription, SubscriptionId, SubscriptionRegistry};
use super::router::{MessageRouter, RouterStats};
use super::transport::{
    Connector, Link, TransportEvent, WebSocketConnector, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use super::types::{ConnectionState, LogEntry, Payload, ProgressUpdate, TargetKey, TaskFailure};
use crate::config::SessionConfig;

/// Invoked once each time reconnect attempts run out, with the attempt count
pub type ExhaustedFn = Arc<dyn Fn(u32) + Send + Sync>;

/// Lifecycle notifications broadcast by the session task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected {
        epoch: u64,
    },
    Disconnected {
        epoch: u64,
        code: u16,
        reason: String,
    },
    StaleConnection {
        epoch: u64,
    },
    ReconnectScheduled {
        attempt: u32,
        #[serde(with = "millis")]
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(delay.as_millis() as u64)
    }
}

/// Point-in-time session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub state: ConnectionState,
    /// Epoch of the current or most recent connection; 0 before the first
    pub epoch: u64,
    pub frames_received: u64,
    pub reconnects_scheduled: u64,
    pub subscriptions: usize,
    #[serde(flatten)]
    pub router: RouterStats,
}

#[derive(Default)]
struct SessionCounters {
    epoch: AtomicU64,
    frames_received: AtomicU64,
    reconnects_scheduled: AtomicU64,
}

enum Command {
    Connect,
    Disconnect { done: Option<oneshot::Sender<()>> },
    /// Pre-encoded outbound frame
    Send(String),
    Announce(TargetKey),
    Retract(TargetKey),
    /// The last `Session` handle was dropped
    Shutdown,
}

struct Shared {
    registry: Arc<SubscriptionRegistry>,
    router: Arc<MessageRouter>,
    counters: Arc<SessionCounters>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Outstanding subscription handles must not keep the task alive
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Builder for a [`Session`] with a custom connector or exhaustion hook
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    on_exhausted: Option<ExhaustedFn>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connector: Arc::new(WebSocketConnector),
            on_exhausted: None,
        }
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn on_exhausted(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_exhausted = Some(Arc::new(callback));
        self
    }

    /// Validate the config and spawn the session task
    ///
    /// Must be called from within a tokio runtime. The session starts
    /// `Disconnected`; call [`Session::connect`] to open the channel.
    pub fn build(self) -> SessionResult<Session> {
        self.config.validate()?;
        let url = self.config.endpoint()?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry)));
        let counters = Arc::new(SessionCounters::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(self.config.event_capacity);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let (stale_tx, stale_rx) = mpsc::unbounded_channel();

        let backoff = self.config.backoff();
        let supervisor = Supervisor {
            url,
            heartbeat_interval: self.config.heartbeat_interval(),
            heartbeat_timeout: self.config.heartbeat_timeout(),
            connect_timeout: self.config.connect_timeout(),
            close_timeout: self.config.close_timeout(),
            write_timeout: self.config.write_timeout(),
            connector: self.connector,
            on_exhausted: self.on_exhausted,
            registry: Arc::clone(&registry),
            router: Arc::clone(&router),
            counters: Arc::clone(&counters),
            state: state_tx,
            events: events_tx.clone(),
            commands: cmd_rx,
            pings: ping_rx,
            ping_tx,
            stale: stale_rx,
            heartbeat: HeartbeatMonitor::new(stale_tx),
            backoff,
            reconnect: ReconnectState::new(&backoff),
            phase: Phase::Idle,
            epoch: 0,
            announced: HashSet::new(),
        };
        tokio::spawn(supervisor.run());

        Ok(Session {
            shared: Arc::new(Shared {
                registry,
                router,
                counters,
                state: state_rx,
                events: events_tx,
                commands: cmd_tx,
            }),
        })
    }
}

/// Handle to a managed push-channel connection
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Session over a real WebSocket
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        SessionBuilder::new(config).build()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Start connecting; a no-op while connecting or connected
    pub fn connect(&self) -> SessionResult<()> {
        self.command(Command::Connect)
    }

    /// Close the connection and stop reconnecting
    ///
    /// Subscriptions stay registered and are replayed on the next `connect`.
    pub fn disconnect(&self) -> SessionResult<()> {
        self.command(Command::Disconnect { done: None })
    }

    /// Like [`disconnect`](Self::disconnect), but waits until the session is `Disconnected`
    pub async fn shutdown(&self) -> SessionResult<()> {
        let (done, finished) = oneshot::channel();
        self.command(Command::Disconnect { done: Some(done) })?;
        finished.await.map_err(|_| SessionError::TaskGone)
    }

    /// Send a raw command; returns false if not connected or not encodable
    pub fn send(&self, command: OutboundCommand) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        match codec::encode(&command) {
            Ok(text) => self.shared.commands.send(Command::Send(text)).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Refusing to send unencodable command");
                false
            }
        }
    }

    /// Subscribe by channel key (`progress:<id>`, `log:<id>`, `data:<name>`,
    /// `error:<id>` or a custom key)
    pub fn subscribe<F>(&self, channel_key: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe_target(TargetKey::parse(channel_key), Arc::new(callback))
    }

    pub fn subscribe_progress<F>(&self, task_id: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.subscribe_target(
            TargetKey::progress(task_id),
            Arc::new(move |payload: &Payload| {
                if let Payload::Progress(update) = payload {
                    callback(update);
                }
            }),
        )
    }

    pub fn subscribe_logs<F>(&self, task_id: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.subscribe_target(
            TargetKey::log(task_id),
            Arc::new(move |payload: &Payload| {
                if let Payload::Log(entry) = payload {
                    callback(entry);
                }
            }),
        )
    }

    pub fn subscribe_data<F>(&self, channel: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.subscribe_target(
            TargetKey::data(channel),
            Arc::new(move |payload: &Payload| {
                if let Payload::Data(data) = payload {
                    callback(data);
                }
            }),
        )
    }

    /// Server-reported failures of one task; never announced to the server
    pub fn subscribe_errors<F>(&self, task_id: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        self.subscribe_target(
            TargetKey::error(task_id),
            Arc::new(move |payload: &Payload| {
                if let Payload::Error(failure) = payload {
                    callback(failure);
                }
            }),
        )
    }

    fn subscribe_target(&self, target: TargetKey, callback: Callback) -> SubscriptionHandle {
        let id = self.shared.registry.add(target.clone(), callback);
        if !target.is_local() {
            // Goes out now if connected, otherwise with the next replay
            let _ = self.shared.commands.send(Command::Announce(target.clone()));
        }
        SubscriptionHandle {
            id,
            target,
            registry: Arc::clone(&self.shared.registry),
            commands: self.shared.commands.clone(),
            attached: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry.all()
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.shared.counters;
        SessionStats {
            state: self.state(),
            epoch: counters.epoch.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            reconnects_scheduled: counters.reconnects_scheduled.load(Ordering::Relaxed),
            subscriptions: self.shared.registry.len(),
            router: self.shared.router.stats(),
        }
    }

    fn command(&self, command: Command) -> SessionResult<()> {
        self.shared.commands.send(command).map_err(|_| SessionError::TaskGone)
    }
}

/// Keeps a subscription alive; dropping it unsubscribes
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    target: TargetKey,
    registry: Arc<SubscriptionRegistry>,
    commands: mpsc::UnboundedSender<Command>,
    attached: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    /// False once unsubscribed or replaced by a newer subscription to the same key
    pub fn is_active(&self) -> bool {
        self.registry.contains(&self.id)
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the subscription for the lifetime of the session
    pub fn detach(mut self) {
        self.attached = false;
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.attached, false) {
            return;
        }
        if self.registry.remove(&self.id).is_some() && !self.target.is_local() {
            let _ = self.commands.send(Command::Retract(self.target.clone()));
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("attached", &self.attached)
            .finish()
    }
}

enum Phase {
    Idle,
    Connecting(BoxFuture<'static, Result<Link, TransportError>>),
    Open(Link),
    Waiting(Pin<Box<Sleep>>),
}

enum Event {
    Command(Command),
    HandlesDropped,
    Opened(Result<Link, TransportError>),
    BackoffElapsed,
    Transport(Option<Result<TransportEvent, TransportError>>),
    Ping(OutboundCommand),
    Stale(StaleConnection),
}

struct Supervisor {
    url: Url,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    connect_timeout: Duration,
    close_timeout: Duration,
    write_timeout: Duration,
    connector: Arc<dyn Connector>,
    on_exhausted: Option<ExhaustedFn>,

    registry: Arc<SubscriptionRegistry>,
    router: Arc<MessageRouter>,
    counters: Arc<SessionCounters>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,

    commands: mpsc::UnboundedReceiver<Command>,
    pings: mpsc::UnboundedReceiver<OutboundCommand>,
    ping_tx: mpsc::UnboundedSender<OutboundCommand>,
    stale: mpsc::UnboundedReceiver<StaleConnection>,
    heartbeat: HeartbeatMonitor,

    backoff: Backoff,
    reconnect: ReconnectState,
    phase: Phase,
    epoch: u64,
    /// Targets announced on the current epoch
    announced: HashSet<TargetKey>,
}

impl Supervisor {
    async fn run(mut self) {
        tracing::debug!(url = %self.url, "Session task started");

        loop {
            match self.next_event().await {
                Event::Command(Command::Shutdown) | Event::HandlesDropped => {
                    self.close(None).await;
                    break;
                }
                Event::Command(command) => self.handle_command(command).await,
                Event::Opened(result) => self.handle_opened(result).await,
                Event::BackoffElapsed => self.start_connect(),
                Event::Transport(event) => self.handle_transport(event).await,
                Event::Ping(command) => {
                    if let Ok(text) = codec::encode(&command) {
                        self.write(text).await;
                    }
                }
                Event::Stale(stale) => self.handle_stale(stale).await,
            }
        }

        tracing::debug!("Session task stopped");
    }

    async fn next_event(&mut self) -> Event {
        match &mut self.phase {
            Phase::Idle => match self.commands.recv().await {
                Some(command) => Event::Command(command),
                None => Event::HandlesDropped,
            },
            Phase::Connecting(attempt) => tokio::select! {
                biased;
                command = self.commands.recv() => command.map_or(Event::HandlesDropped, Event::Command),
                result = attempt => Event::Opened(result),
            },
            Phase::Waiting(delay) => tokio::select! {
                biased;
                command = self.commands.recv() => command.map_or(Event::HandlesDropped, Event::Command),
                _ = delay.as_mut() => Event::BackoffElapsed,
            },
            Phase::Open(link) => tokio::select! {
                biased;
                command = self.commands.recv() => command.map_or(Event::HandlesDropped, Event::Command),
                Some(stale) = self.stale.recv() => Event::Stale(stale),
                Some(ping) = self.pings.recv() => Event::Ping(ping),
                event = link.source.next_event() => Event::Transport(event),
            },
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => match self.phase {
                Phase::Idle => {
                    self.reconnect.reset(&self.backoff);
                    self.start_connect();
                }
                Phase::Waiting(_) => {
                    tracing::debug!(attempt = self.reconnect.attempt, "Connect requested; skipping backoff");
                    self.start_connect();
                }
                Phase::Connecting(_) | Phase::Open(_) => {
                    tracing::debug!(state = %self.current_state(), "Connect ignored; already active");
                }
            },
            Command::Disconnect { done } => self.close(done).await,
            Command::Send(text) => {
                if matches!(self.phase, Phase::Open(_)) {
                    self.write(text).await;
                } else {
                    tracing::debug!("Dropping outbound frame; not connected");
                }
            }
            Command::Announce(target) => {
                if matches!(self.phase, Phase::Open(_))
                    && self.registry.contains_target(&target)
                    && !self.announced.contains(&target)
                {
                    self.announce(target).await;
                }
            }
            Command::Retract(target) => {
                // Re-subscribed since; the server keeps the subscription
                if self.registry.contains_target(&target) {
                    return;
                }
                if self.announced.remove(&target) && matches!(self.phase, Phase::Open(_)) {
                    tracing::debug!(key = %target, epoch = self.epoch, "Unsubscribing");
                    if let Ok(text) = codec::encode(&OutboundCommand::Unsubscribe(target)) {
                        self.write(text).await;
                    }
                }
            }
            // Ends the run loop before reaching here
            Command::Shutdown => {}
        }
    }

    fn start_connect(&mut self) {
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let timeout = self.connect_timeout;

        tracing::info!(url = %url, attempt = self.reconnect.attempt, "Connecting");
        self.phase = Phase::Connecting(Box::pin(async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }));
        self.set_state(ConnectionState::Connecting);
    }

    async fn handle_opened(&mut self, result: Result<Link, TransportError>) {
        let link = match result {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Connection attempt failed");
                self.phase = Phase::Idle;
                self.schedule_reconnect();
                return;
            }
        };

        self.epoch += 1;
        self.counters.epoch.store(self.epoch, Ordering::Relaxed);
        self.phase = Phase::Open(link);
        self.reconnect.reset(&self.backoff);
        self.announced.clear();

        // Leftovers from the previous epoch
        while self.pings.try_recv().is_ok() {}
        while self.stale.try_recv().is_ok() {}

        self.set_state(ConnectionState::Connected);
        tracing::info!(epoch = self.epoch, url = %self.url, "Connected");
        self.emit(SessionEvent::Connected { epoch: self.epoch });

        let ping_tx = self.ping_tx.clone();
        let send: SendFn = Arc::new(move |command: OutboundCommand| ping_tx.send(command).is_ok());
        self.heartbeat
            .start(send, self.heartbeat_interval, self.heartbeat_timeout);

        self.replay().await;
    }

    /// Announce every registered target before any frame of this epoch is routed
    async fn replay(&mut self) {
        let epoch = self.epoch;
        let subscriptions = self.registry.all();
        tracing::debug!(epoch, count = subscriptions.len(), "Replaying subscriptions");

        for subscription in subscriptions {
            if subscription.target.is_local() || self.announced.contains(&subscription.target) {
                continue;
            }
            self.announce(subscription.target).await;
            // A failed write tears the epoch down
            if self.epoch != epoch || !matches!(self.phase, Phase::Open(_)) {
                return;
            }
        }
    }

    async fn announce(&mut self, target: TargetKey) {
        tracing::debug!(key = %target, epoch = self.epoch, "Subscribing");
        match codec::encode(&OutboundCommand::Subscribe(target.clone())) {
            Ok(text) => {
                self.announced.insert(target);
                self.write(text).await;
            }
            Err(e) => tracing::warn!(key = %target, error = %e, "Cannot encode subscribe"),
        }
    }

    /// Write to the open link; a failed write is treated as a lost connection
    async fn write(&mut self, text: String) {
        let Phase::Open(link) = &mut self.phase else {
            return;
        };
        let written = tokio::time::timeout(self.write_timeout, link.sink.send_text(text))
            .await
            .unwrap_or(Err(TransportError::Timeout(self.write_timeout)));
        if let Err(e) = written {
            tracing::warn!(epoch = self.epoch, error = %e, "Write failed");
            self.connection_lost(ABNORMAL_CLOSURE, e.to_string());
        }
    }

    async fn handle_transport(&mut self, event: Option<Result<TransportEvent, TransportError>>) {
        match event {
            Some(Ok(TransportEvent::Text(text))) => {
                self.heartbeat.record_activity();
                self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                self.router.route_text(&text);
            }
            Some(Ok(TransportEvent::Activity)) => self.heartbeat.record_activity(),
            Some(Ok(TransportEvent::Closed { code, reason })) if code == NORMAL_CLOSURE => {
                tracing::info!(epoch = self.epoch, reason = %reason, "Server closed the connection");
                self.teardown();
                self.emit(SessionEvent::Disconnected {
                    epoch: self.epoch,
                    code,
                    reason,
                });
                self.set_state(ConnectionState::Disconnected);
            }
            Some(Ok(TransportEvent::Closed { code, reason })) => self.connection_lost(code, reason),
            Some(Err(e)) => self.connection_lost(ABNORMAL_CLOSURE, e.to_string()),
            None => self.connection_lost(ABNORMAL_CLOSURE, "stream ended".to_string()),
        }
    }

    async fn handle_stale(&mut self, stale: StaleConnection) {
        if self.heartbeat.generation() != Some(stale.generation)
            || !matches!(self.phase, Phase::Open(_))
        {
            return;
        }

        tracing::warn!(
            epoch = self.epoch,
            silent_ms = stale.silent_for.as_millis() as u64,
            "Connection is stale; forcing reconnect"
        );
        self.emit(SessionEvent::StaleConnection { epoch: self.epoch });
        if let Phase::Open(link) = &mut self.phase {
            // A dead peer will not acknowledge
            let _ = tokio::time::timeout(self.close_timeout, link.sink.close()).await;
        }
        self.connection_lost(ABNORMAL_CLOSURE, "heartbeat timeout".to_string());
    }

    fn connection_lost(&mut self, code: u16, reason: String) {
        tracing::warn!(epoch = self.epoch, code, reason = %reason, "Connection lost");
        self.teardown();
        self.emit(SessionEvent::Disconnected {
            epoch: self.epoch,
            code,
            reason,
        });
        self.schedule_reconnect();
    }

    /// Drop the current link and everything tied to its epoch
    fn teardown(&mut self) {
        self.heartbeat.stop();
        self.announced.clear();
        self.phase = Phase::Idle;
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.record_failure(&self.backoff) {
            Some(delay) => {
                let attempt = self.reconnect.attempt;
                self.counters.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                self.phase = Phase::Waiting(Box::pin(tokio::time::sleep(delay)));
                self.set_state(ConnectionState::Reconnecting);
                self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
            }
            None => {
                let attempts = self.reconnect.attempt;
                tracing::warn!(attempts, "Reconnect attempts exhausted");
                self.phase = Phase::Idle;
                self.reconnect.reset(&self.backoff);
                self.emit(SessionEvent::ReconnectExhausted { attempts });
                if let Some(callback) = &self.on_exhausted {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(attempts))).is_err() {
                        tracing::warn!("Exhaustion callback panicked");
                    }
                }
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// Intentional close from any state; never schedules a reconnect
    async fn close(&mut self, done: Option<oneshot::Sender<()>>) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Open(mut link) => {
                self.set_state(ConnectionState::Closing);
                self.heartbeat.stop();
                self.announced.clear();

                let (code, reason) = drain_close(&mut link, self.close_timeout).await;
                drop(link);
                tracing::info!(epoch = self.epoch, code, "Disconnected");
                self.emit(SessionEvent::Disconnected {
                    epoch: self.epoch,
                    code,
                    reason,
                });
            }
            Phase::Connecting(_) => tracing::info!("Connection attempt cancelled"),
            Phase::Waiting(_) => tracing::info!(attempt = self.reconnect.attempt, "Reconnect cancelled"),
            Phase::Idle => {}
        }

        self.reconnect.reset(&self.backoff);
        self.set_state(ConnectionState::Disconnected);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(from = %from, to = %to, "Connection state changed");
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Send a normal close and wait for the peer's close frame, up to `close_timeout`
async fn drain_close(link: &mut Link, close_timeout: Duration) -> (u16, String) {
    match tokio::time::timeout(close_timeout, link.sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Close frame not sent");
            return (NORMAL_CLOSURE, "client disconnect".to_string());
        }
        Err(_) => {
            tracing::debug!("Close frame write timed out");
            return (NORMAL_CLOSURE, "client disconnect".to_string());
        }
    }

    let drained = tokio::time::timeout(close_timeout, async {
        loop {
            match link.source.next_event().await {
                Some(Ok(TransportEvent::Closed { code, reason })) => return (code, reason),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => {
                    return (NORMAL_CLOSURE, "client disconnect".to_string())
                }
            }
        }
    })
    .await;

    drained.unwrap_or_else(|_| {
        tracing::debug!("Close handshake timed out");
        (NORMAL_CLOSURE, "client disconnect".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transport::mock::{MockConnector, MockHandle, MockServer};
    use serde_json::json;
    use std::sync::Mutex;

    fn test_config() -> SessionConfig {
        SessionConfig {
            url: Some("ws://push.test/ws".to_string()),
            heartbeat_interval_ms: 3_600_000,
            heartbeat_timeout_ms: 7_200_000,
            ..SessionConfig::default()
        }
    }

    fn session_with(config: SessionConfig) -> (Session, MockHandle) {
        let (connector, handle) = MockConnector::new();
        let session = Session::builder(config).connector(connector).build().unwrap();
        (session, handle)
    }

    /// Let the session task process everything that is ready
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn wait_for_state(session: &Session, state: ConnectionState) {
        let mut changes = session.state_changes();
        tokio::time::timeout(Duration::from_secs(600), changes.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    async fn open(session: &Session, handle: &mut MockHandle) -> MockServer {
        session.connect().unwrap();
        let server = handle.next_request().await.accept();
        wait_for_state(session, ConnectionState::Connected).await;
        settle().await;
        server
    }

    fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn subscribe_frame(channel: &str, target: &str) -> serde_json::Value {
        let key = if channel == "progress" || channel == "log" { "taskId" } else { "target" };
        json!({"type": "subscribe", "channel": channel, key: target})
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replays_existing_subscriptions() {
        let (session, mut handle) = session_with(test_config());
        let _progress = session.subscribe_progress("t1", |_| {});
        let _data = session.subscribe_data("cpu", |_| {});
        let _errors = session.subscribe_errors("t1", |_| {});
        settle().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let mut server = open(&session, &mut handle).await;
        assert_eq!(
            server.received_json(),
            vec![subscribe_frame("progress", "t1"), subscribe_frame("data", "cpu")]
        );
        assert_eq!(session.stats().epoch, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (session, mut handle) = session_with(test_config());
        session.connect().unwrap();
        session.connect().unwrap();
        let _server = handle.next_request().await.accept();
        session.connect().unwrap();
        wait_for_state(&session, ConnectionState::Connected).await;
        settle().await;
        assert!(handle.try_request().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_while_connected_goes_out_immediately() {
        let (session, mut handle) = session_with(test_config());
        let mut server = open(&session, &mut handle).await;

        let logs = session.subscribe_logs("t9", |_| {});
        settle().await;
        assert_eq!(server.received_json(), vec![subscribe_frame("log", "t9")]);

        logs.unsubscribe();
        settle().await;
        assert_eq!(
            server.received_json(),
            vec![json!({"type": "unsubscribe", "channel": "log", "taskId": "t9"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_unsubscribes_but_detach_keeps_it() {
        let (session, mut handle) = session_with(test_config());
        let mut server = open(&session, &mut handle).await;

        {
            let _scoped = session.subscribe_data("tmp", |_| {});
            session.subscribe_data("keep", |_| {}).detach();
            settle().await;
        }
        settle().await;

        let frames = server.received_json();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], json!({"type": "unsubscribe", "channel": "data", "target": "tmp"}));
        assert_eq!(session.subscriptions().len(), 1);
        assert_eq!(session.subscriptions()[0].target, TargetKey::data("keep"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_same_key_replaces_without_duplicate_wire_traffic() {
        let (session, mut handle) = session_with(test_config());
        let mut server = open(&session, &mut handle).await;

        let first = session.subscribe_progress("t1", |_| {});
        let second = session.subscribe_progress("t1", |_| {});
        settle().await;
        assert!(!first.is_active());
        assert!(second.is_active());

        // The stale handle must not remove its replacement
        drop(first);
        settle().await;
        assert!(second.is_active());
        assert_eq!(server.received_json(), vec![subscribe_frame("progress", "t1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_frames_reach_typed_callback() {
        let (session, mut handle) = session_with(test_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = session.subscribe_progress("t1", move |update| {
            sink.lock().unwrap().push(update.clone());
        });
        let server = open(&session, &mut handle).await;

        server.push(r#"{"type":"progress","taskId":"t1","progress":42,"status":"running"}"#);
        server.push(r#"{"type":"progress","taskId":"t2","progress":10,"status":"running"}"#);
        server.push(r#"{"type":"progress","taskId":"t1","progress":100,"status":"done","detail":"ok"}"#);
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].progress, 42.0);
        assert_eq!(seen[0].detail, None);
        assert_eq!(seen[1].status, "done");
        assert_eq!(seen[1].detail.as_deref(), Some("ok"));

        let stats = session.stats();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.router.dispatched, 2);
        assert_eq!(stats.router.unmatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_keeps_connection_open() {
        let (session, mut handle) = session_with(test_config());
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let _sub = session.subscribe("alerts", move |_| *counter.lock().unwrap() += 1);
        let server = open(&session, &mut handle).await;

        server.push("not json");
        server.push(r#"{"type":"alerts","level":"high"}"#);
        settle().await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(session.stats().router.decode_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let (session, mut handle) = session_with(test_config());
        let mut message = serde_json::Map::new();
        message.insert("type".to_string(), json!("ping"));
        assert!(!session.send(OutboundCommand::Message(message.clone())));

        let mut server = open(&session, &mut handle).await;
        assert!(session.send(OutboundCommand::Message(message)));
        assert!(!session.send(OutboundCommand::Message(serde_json::Map::new())));
        settle().await;
        assert_eq!(server.received_json(), vec![json!({"type": "ping"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_exactly_once_before_routing() {
        let (session, mut handle) = session_with(test_config());
        let journal = Arc::clone(&handle.journal);
        let routed = Arc::clone(&journal);
        let _p = session.subscribe_progress("t1", move |update| {
            routed.lock().unwrap().push(format!("routed {}", update.progress));
        });
        let _d = session.subscribe_data("cpu", |_| {});

        let first = open(&session, &mut handle).await;
        first.close(1006);
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        journal.lock().unwrap().clear();

        // Subscribing again while reconnecting must not duplicate the replay
        let _d2 = session.subscribe_data("cpu", |_| {});

        let mut second = handle.next_request().await.accept();
        second.push(r#"{"type":"progress","taskId":"t1","progress":7}"#);
        wait_for_state(&session, ConnectionState::Connected).await;
        settle().await;

        let frames = second.received_json();
        assert_eq!(frames.len(), 2);
        assert!(frames.contains(&subscribe_frame("progress", "t1")));
        assert!(frames.contains(&subscribe_frame("data", "cpu")));

        let journal = journal.lock().unwrap();
        assert_eq!(journal.len(), 3);
        assert_eq!(journal[2], "routed 7");
        assert_eq!(session.stats().epoch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_reset() {
        let (session, mut handle) = session_with(test_config());
        let mut events = session.events();
        session.connect().unwrap();

        for _ in 0..7 {
            handle.next_request().await.reject("refused");
        }
        let server = handle.next_request().await.accept();
        wait_for_state(&session, ConnectionState::Connected).await;

        let delays: Vec<u64> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::ReconnectScheduled { delay, .. } => Some(delay.as_millis() as u64),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);

        server.fail("reset by peer");
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        let after_reset = drain(&mut events);
        assert!(after_reset.contains(&SessionEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_millis(1000),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_stops_and_notifies_once() {
        let config = SessionConfig {
            max_reconnect_attempts: 2,
            ..test_config()
        };
        let (connector, mut handle) = MockConnector::new();
        let exhausted = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&exhausted);
        let session = Session::builder(config)
            .connector(connector)
            .on_exhausted(move |attempts| record.lock().unwrap().push(attempts))
            .build()
            .unwrap();
        let mut events = session.events();

        session.connect().unwrap();
        for _ in 0..3 {
            handle.next_request().await.reject("refused");
        }
        wait_for_state(&session, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(handle.try_request().is_none());
        assert_eq!(*exhausted.lock().unwrap(), vec![2]);
        let exhaustions = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ReconnectExhausted { .. }))
            .count();
        assert_eq!(exhaustions, 1);

        // connect() starts over with a fresh schedule
        session.connect().unwrap();
        let _server = handle.next_request().await.accept();
        wait_for_state(&session, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_reconnecting_cancels_retry() {
        let (session, mut handle) = session_with(test_config());
        let server = open(&session, &mut handle).await;
        server.close(1011);
        wait_for_state(&session, ConnectionState::Reconnecting).await;

        session.disconnect().unwrap();
        wait_for_state(&session, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(handle.try_request().is_none());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_cleanly_and_keeps_subscriptions() {
        let (session, mut handle) = session_with(test_config());
        let _sub = session.subscribe_data("cpu", |_| {});
        let mut events = session.events();
        let mut server = open(&session, &mut handle).await;
        server.received();

        session.shutdown().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(server.client_closed());

        let transitions: Vec<ConnectionState> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closing,
                ConnectionState::Disconnected,
            ]
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(handle.try_request().is_none());
        assert_eq!(session.subscriptions().len(), 1);

        let mut server = open(&session, &mut handle).await;
        assert_eq!(server.received_json(), vec![subscribe_frame("data", "cpu")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_server_close_does_not_reconnect() {
        let (session, mut handle) = session_with(test_config());
        let server = open(&session, &mut handle).await;
        server.close(NORMAL_CLOSURE);
        wait_for_state(&session, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(handle.try_request().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_forces_reconnect() {
        let config = SessionConfig {
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            ..test_config()
        };
        let (session, mut handle) = session_with(config);
        let mut events = session.events();
        let mut server = open(&session, &mut handle).await;

        wait_for_state(&session, ConnectionState::Reconnecting).await;
        assert!(server.client_closed());

        let heartbeats = server
            .received_json()
            .into_iter()
            .filter(|frame| frame["type"] == "heartbeat")
            .count();
        assert!(heartbeats >= 2);
        assert!(drain(&mut events).contains(&SessionEvent::StaleConnection { epoch: 1 }));

        let _next = handle.next_request().await.accept();
        wait_for_state(&session, ConnectionState::Connected).await;
        assert_eq!(session.stats().epoch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_keeps_connection_fresh() {
        let config = SessionConfig {
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            ..test_config()
        };
        let (session, mut handle) = session_with(config);
        let server = open(&session, &mut handle).await;

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            server.push(r#"{"type":"data","channel":"cpu","data":1}"#);
        }
        settle().await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.stats().epoch, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_schedules_reconnect() {
        let config = SessionConfig {
            connect_timeout_ms: 500,
            ..test_config()
        };
        let (session, mut handle) = session_with(config);
        let mut events = session.events();
        session.connect().unwrap();

        // Never answered
        let _pending = handle.next_request().await;
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SessionEvent::ReconnectScheduled { attempt: 1, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_drops_connection() {
        let config = SessionConfig {
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            write_timeout_ms: 1500,
            ..test_config()
        };
        let (session, mut handle) = session_with(config);
        let mut events = session.events();
        session.connect().unwrap();
        let _server = handle.next_request().await.accept_stalled();
        wait_for_state(&session, ConnectionState::Connected).await;

        // The first heartbeat never finishes writing
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SessionEvent::Disconnected { epoch: 1, code: ABNORMAL_CLOSURE, .. }
        )));

        session.disconnect().unwrap();
        wait_for_state(&session, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(handle.try_request().is_none());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_replay_write_schedules_reconnect() {
        let config = SessionConfig {
            write_timeout_ms: 2000,
            ..test_config()
        };
        let (session, mut handle) = session_with(config);
        let _sub = session.subscribe_data("cpu", |_| {});
        session.connect().unwrap();
        let _stalled = handle.next_request().await.accept_stalled();
        wait_for_state(&session, ConnectionState::Reconnecting).await;

        let mut server = handle.next_request().await.accept();
        wait_for_state(&session, ConnectionState::Connected).await;
        settle().await;
        assert_eq!(server.received_json(), vec![subscribe_frame("data", "cpu")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_completes_when_close_stalls() {
        let (session, mut handle) = session_with(test_config());
        session.connect().unwrap();
        let server = handle.next_request().await.accept_stalled();
        wait_for_state(&session, ConnectionState::Connected).await;

        tokio::time::timeout(Duration::from_secs(60), session.shutdown())
            .await
            .expect("shutdown hung on close")
            .unwrap();
        assert!(server.client_closed());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting_ignores_late_answer() {
        let (session, mut handle) = session_with(test_config());
        session.connect().unwrap();
        let request = handle.next_request().await;
        assert_eq!(session.state(), ConnectionState::Connecting);

        session.disconnect().unwrap();
        wait_for_state(&session, ConnectionState::Disconnected).await;

        let _late = request.accept();
        settle().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(handle.try_request().is_none());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.stats().epoch, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_during_replay_reschedules() {
        let (session, mut handle) = session_with(test_config());
        let _p = session.subscribe_progress("t1", |_| {});
        let _d = session.subscribe_data("cpu", |_| {});
        let mut events = session.events();
        session.connect().unwrap();

        let mut broken = handle.next_request().await.accept_failing_after(1);
        wait_for_state(&session, ConnectionState::Reconnecting).await;
        assert_eq!(broken.received_json(), vec![subscribe_frame("progress", "t1")]);

        let seen = drain(&mut events);
        assert!(seen.iter().any(|e| matches!(
            e,
            SessionEvent::Disconnected { epoch: 1, code: ABNORMAL_CLOSURE, .. }
        )));
        assert!(seen.contains(&SessionEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_millis(1000),
        }));

        let mut server = handle.next_request().await.accept();
        wait_for_state(&session, ConnectionState::Connected).await;
        settle().await;
        assert_eq!(
            server.received_json(),
            vec![subscribe_frame("progress", "t1"), subscribe_frame("data", "cpu")]
        );
        assert_eq!(session.stats().epoch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_session_closes_despite_live_handles() {
        let (session, mut handle) = session_with(test_config());
        let sub = session.subscribe_data("cpu", |_| {});
        let mut events = session.events();
        let server = open(&session, &mut handle).await;

        drop(session);
        let stopped = tokio::time::timeout(Duration::from_secs(60), async {
            while events.recv().await.is_ok() {}
        })
        .await;
        assert!(stopped.is_ok());
        assert!(server.client_closed());

        // Unsubscribing after the task is gone is harmless
        drop(sub);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = SessionConfig {
            url: Some("http://wrong/ws".to_string()),
            ..SessionConfig::default()
        };
        assert!(matches!(Session::new(config), Err(SessionError::Endpoint(_))));
    }
}
