//! Connection manager.
//!
//! Tracks live client connections, their subscriptions and liveness, and
//! fans publications out to them without ever blocking the publisher.
//!
//! ```text
//!            publish()                      one task per connection
//! processor ───────────▶ topic index ──try_send──▶ queue ──▶ Transport
//!                                         │ full
//!                                         ▼
//!                              evict (slow_consumer + retry hint)
//! ```
//!
//! Lifecycle: `Connected → Degraded → Closed`, where `Closed` is terminal.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strata_core::{ConnectionState, MonitoringHook, Publication, PublishReport, PublishSink};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::topic::Topic;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write half of a client connection, owned by its delivery task.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, message: &ServerMessage) -> GatewayResult<()>;

    async fn close(&mut self) {}
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnect,
    SlowConsumer,
    HeartbeatTimeout,
    WriteTimeout,
    TransportError,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::WriteTimeout => "write_timeout",
            CloseReason::TransportError => "transport_error",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Evictions count towards the client's reconnect backoff.
    pub fn is_eviction(&self) -> bool {
        matches!(
            self,
            CloseReason::SlowConsumer | CloseReason::HeartbeatTimeout | CloseReason::WriteTimeout
        )
    }

    /// Final frame sent to the client, if any.
    fn farewell(&self) -> Option<(ErrorCode, &'static str)> {
        match self {
            CloseReason::SlowConsumer => Some((ErrorCode::SlowConsumer, "outbound queue is full")),
            CloseReason::HeartbeatTimeout => Some((ErrorCode::HeartbeatTimeout, "no heartbeat received")),
            CloseReason::WriteTimeout => Some((ErrorCode::WriteTimeout, "transport writes timed out")),
            CloseReason::Shutdown => Some((ErrorCode::ShuttingDown, "server is shutting down")),
            CloseReason::ClientDisconnect | CloseReason::TransportError => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Frame = Arc<ServerMessage>;

struct Connection {
    id: ConnectionId,
    client_key: String,
    state: Mutex<ConnectionState>,
    queue: mpsc::Sender<Frame>,
    subscriptions: Mutex<HashSet<String>>,
    last_heartbeat: Mutex<Instant>,
    cancel: CancellationToken,
    /// Written by the delivery task after cancellation, before closing.
    farewell: Mutex<Option<ServerMessage>>,
}

impl Connection {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn queue_depth(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }
}

/// Caller-side view of a registered connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn: Arc<Connection>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.conn.id
    }

    pub fn client_key(&self) -> &str {
        &self.conn.client_key
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn queue_depth(&self) -> usize {
        self.conn.queue_depth()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed for any reason.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.conn.cancel.cancelled()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.conn.id)
            .field("client_key", &self.conn.client_key)
            .field("state", &self.conn.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub connections: usize,
    pub degraded: usize,
    pub topics: usize,
    pub evicted_total: u64,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub degraded: usize,
    pub recovered: usize,
    pub closed: usize,
}

// ============================================================================
// Manager
// ============================================================================

pub struct ConnectionManager {
    config: GatewayConfig,
    monitor: Arc<dyn MonitoringHook>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Canonical topic -> subscribed connections.
    topics: DashMap<String, HashSet<ConnectionId>>,
    dedupe: moka::sync::Cache<String, ()>,
    /// Client key -> evictions inside the eviction memory window.
    evictions: moka::sync::Cache<String, u32>,
    /// Held while assigning a sequence number and enqueueing, so every
    /// connection sees sequences in increasing order.
    sequence: Mutex<u64>,
    next_id: AtomicU64,
    evicted_total: AtomicU64,
    shutting_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: GatewayConfig, monitor: Arc<dyn MonitoringHook>) -> Arc<Self> {
        let dedupe = moka::sync::Cache::builder()
            .max_capacity(config.dedupe_capacity)
            .time_to_live(config.dedupe_window())
            .build();
        let evictions = moka::sync::Cache::builder()
            .max_capacity(100_000)
            .time_to_live(config.eviction_memory())
            .build();

        Arc::new(Self {
            config,
            monitor,
            connections: DashMap::new(),
            topics: DashMap::new(),
            dedupe,
            evictions,
            sequence: Mutex::new(0),
            next_id: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Register a connection and spawn its delivery task. `client_key`
    /// identifies the client across reconnects for backoff hints.
    pub fn register<T: Transport>(
        self: &Arc<Self>,
        client_key: impl Into<String>,
        transport: T,
    ) -> GatewayResult<ConnectionHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(GatewayError::ShuttingDown);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(self.config.hard_queue_ceiling.max(1));
        let conn = Arc::new(Connection {
            id,
            client_key: client_key.into(),
            state: Mutex::new(ConnectionState::Connected),
            queue: tx,
            subscriptions: Mutex::new(HashSet::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            farewell: Mutex::new(None),
        });
        self.connections.insert(id, conn.clone());

        let task = DeliveryTask {
            manager: Arc::downgrade(self),
            conn: conn.clone(),
            queue: rx,
            transport,
            write_timeout: self.config.write_timeout(),
            hard_timeout: self.config.heartbeat_timeout(),
        };
        tokio::spawn(task.run());

        info!(connection = %id, client = %conn.client_key, "client connected");
        Ok(ConnectionHandle { conn })
    }

    fn connection(&self, id: ConnectionId) -> GatewayResult<Arc<Connection>> {
        self.connections
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(GatewayError::UnknownConnection(id))
    }

    // ------------------------------------------------------------------
    // Client messages
    // ------------------------------------------------------------------

    /// Subscribe to `topic`. Returns whether the subscription is new.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> GatewayResult<bool> {
        let key = Topic::parse(topic)?.to_string();
        let conn = self.connection(id)?;

        let mut subscriptions = conn.subscriptions.lock();
        if conn.state().is_terminal() {
            return Err(GatewayError::UnknownConnection(id));
        }
        let added = subscriptions.insert(key.clone());
        if added {
            self.topics.entry(key.clone()).or_default().insert(id);
            debug!(connection = %id, topic = %key, "subscribed");
        }
        Ok(added)
    }

    /// Unsubscribe from `topic`. Returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> GatewayResult<bool> {
        let key = Topic::parse(topic)?.to_string();
        let conn = self.connection(id)?;

        let removed = conn.subscriptions.lock().remove(&key);
        if removed {
            self.unindex(&key, id);
            debug!(connection = %id, topic = %key, "unsubscribed");
        }
        Ok(removed)
    }

    /// Record a heartbeat and acknowledge it.
    pub fn heartbeat(&self, id: ConnectionId) -> GatewayResult<()> {
        let conn = self.connection(id)?;
        *conn.last_heartbeat.lock() = Instant::now();
        if conn.state() == ConnectionState::Degraded && conn.queue_depth() < self.config.soft_queue_threshold {
            self.transition(&conn, ConnectionState::Connected, "heartbeat received");
        }
        self.enqueue(&conn, Arc::new(ServerMessage::HeartbeatAck));
        Ok(())
    }

    /// Apply a client message. Client mistakes are answered with an
    /// `error` frame rather than returned.
    pub fn handle_message(&self, id: ConnectionId, message: ClientMessage) -> GatewayResult<()> {
        let result = match message {
            ClientMessage::Subscribe { topic } => self.subscribe(id, &topic).map(|_| ()),
            ClientMessage::Unsubscribe { topic } => self.unsubscribe(id, &topic).map(|_| ()),
            ClientMessage::Heartbeat => self.heartbeat(id),
        };
        match result {
            Err(GatewayError::InvalidTopic(e)) => {
                self.reject(id, ErrorCode::InvalidTopic, e.to_string());
                Ok(())
            }
            other => other,
        }
    }

    /// Parse and apply a text frame.
    pub fn handle_text(&self, id: ConnectionId, text: &str) -> GatewayResult<()> {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(id, message),
            Err(e) => {
                self.reject(id, ErrorCode::BadRequest, e.to_string());
                Ok(())
            }
        }
    }

    /// Send an `error` frame without closing the connection.
    pub fn reject(&self, id: ConnectionId, code: ErrorCode, message: impl Into<String>) {
        if let Ok(conn) = self.connection(id) {
            self.enqueue(&conn, Arc::new(ServerMessage::error(code, message)));
        }
    }

    /// Close a connection at the client's request.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.connection(id) {
            Ok(conn) => self.close(&conn, CloseReason::ClientDisconnect),
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    fn enqueue(&self, conn: &Arc<Connection>, frame: Frame) -> bool {
        match conn.queue.try_send(frame) {
            Ok(()) => {
                if conn.queue_depth() > self.config.soft_queue_threshold
                    && conn.state() == ConnectionState::Connected
                {
                    self.transition(conn, ConnectionState::Degraded, "queue depth over soft threshold");
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                self.close(conn, CloseReason::SlowConsumer);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close(conn, CloseReason::TransportError);
                false
            }
        }
    }

    fn route(&self, publication: Publication) -> PublishReport {
        let mut report = PublishReport::default();
        let topic = match Topic::parse(&publication.topic) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(topic = %publication.topic, error = %e, "dropping publication with invalid topic");
                return report;
            }
        };

        if let Some(key) = publication.dedupe_key
            && !self.dedupe.entry(key).or_insert(()).is_fresh()
        {
            debug!(topic = %topic, "duplicate publication suppressed");
            report.duplicate = true;
            return report;
        }

        let mut targets: Vec<ConnectionId> = Vec::new();
        for key in topic.routing_keys() {
            if let Some(ids) = self.topics.get(&key) {
                targets.extend(ids.iter().copied());
            }
        }
        targets.sort_unstable();
        targets.dedup();
        report.matched = targets.len();
        if targets.is_empty() {
            return report;
        }

        let mut sequence = self.sequence.lock();
        *sequence += 1;
        let frame = Arc::new(ServerMessage::Update {
            topic: topic.to_string(),
            payload: publication.payload,
            sequence: *sequence,
        });
        for id in targets {
            let Some(conn) = self.connections.get(&id).map(|c| c.value().clone()) else {
                continue;
            };
            if self.enqueue(&conn, frame.clone()) {
                report.enqueued += 1;
            } else if conn.state().is_terminal() {
                report.evicted += 1;
            }
        }
        report
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn transition(&self, conn: &Connection, to: ConnectionState, why: &str) -> bool {
        let from = {
            let mut state = conn.state.lock();
            if !state.can_transition_to(to) {
                return false;
            }
            let from = *state;
            *state = to;
            from
        };
        self.monitor.connection_transition(from, to);
        debug!(connection = %conn.id, %from, %to, reason = why, "connection state changed");
        true
    }

    pub(crate) fn degrade(&self, conn: &Connection, why: &str) {
        if conn.state() == ConnectionState::Connected {
            self.transition(conn, ConnectionState::Degraded, why);
        }
    }

    fn close(&self, conn: &Arc<Connection>, reason: CloseReason) -> bool {
        if !self.transition(conn, ConnectionState::Closed, reason.as_str()) {
            return false;
        }

        if let Some((code, message)) = reason.farewell() {
            let retry_after = self.retry_after(&conn.client_key, reason);
            *conn.farewell.lock() = Some(ServerMessage::Error {
                code,
                message: message.to_string(),
                retry_after_ms: Some(retry_after.as_millis() as u64),
            });
        }
        conn.cancel.cancel();
        self.connections.remove(&conn.id);

        let subscriptions = std::mem::take(&mut *conn.subscriptions.lock());
        for key in subscriptions {
            self.unindex(&key, conn.id);
        }

        if reason.is_eviction() {
            self.evicted_total.fetch_add(1, Ordering::Relaxed);
            warn!(connection = %conn.id, client = %conn.client_key, %reason, "connection evicted");
        } else {
            info!(connection = %conn.id, client = %conn.client_key, %reason, "connection closed");
        }
        true
    }

    fn unindex(&self, key: &str, id: ConnectionId) {
        if let Some(mut ids) = self.topics.get_mut(key) {
            ids.remove(&id);
        }
        self.topics.remove_if(key, |_, ids| ids.is_empty());
    }

    /// Reconnect delay for `client_key`. Evictions grow it exponentially.
    fn retry_after(&self, client_key: &str, reason: CloseReason) -> Duration {
        let backoff = &self.config.reconnect_backoff;
        if !reason.is_eviction() {
            return backoff.delay(1);
        }
        let count = self
            .evictions
            .entry(client_key.to_string())
            .and_upsert_with(|existing| existing.map_or(1, |e| e.into_value().saturating_add(1)))
            .into_value();
        backoff.delay(count)
    }

    /// Evictions of `client_key` still inside the eviction memory window.
    pub fn recent_evictions(&self, client_key: &str) -> u32 {
        self.evictions.get(client_key).unwrap_or(0)
    }

    /// Enforce the heartbeat rules as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let interval = self.config.heartbeat_interval();
        let timeout = self.config.heartbeat_timeout();
        let mut report = SweepReport::default();

        let conns: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        for conn in conns {
            let silent = now.saturating_duration_since(*conn.last_heartbeat.lock());
            let state = conn.state();

            if state == ConnectionState::Connected && silent > interval {
                if self.transition(&conn, ConnectionState::Degraded, "heartbeat overdue") {
                    report.degraded += 1;
                }
            } else if state == ConnectionState::Degraded
                && silent <= interval
                && conn.queue_depth() < self.config.soft_queue_threshold
                && self.transition(&conn, ConnectionState::Connected, "recovered")
            {
                report.recovered += 1;
            }

            if silent > timeout && self.close(&conn, CloseReason::HeartbeatTimeout) {
                report.closed += 1;
            }
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_ms` until `shutdown`
    /// is cancelled or the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let report = manager.sweep(Instant::now());
                if report != SweepReport::default() {
                    debug!(?report, "liveness sweep");
                }
            }
        })
    }

    /// Close every connection and refuse new ones.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let conns: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        let closed = conns
            .iter()
            .filter(|conn| self.close(conn, CloseReason::Shutdown))
            .count();
        info!(closed, "connection manager shut down");
        closed
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        Topic::parse(topic)
            .ok()
            .and_then(|t| self.topics.get(&t.to_string()).map(|ids| ids.len()))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections: self.connections.len(),
            degraded: self
                .connections
                .iter()
                .filter(|c| c.state() == ConnectionState::Degraded)
                .count(),
            topics: self.topics.len(),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            last_sequence: *self.sequence.lock(),
        }
    }
}

impl PublishSink for ConnectionManager {
    fn publish(&self, publication: Publication) -> PublishReport {
        self.route(publication)
    }
}

// ============================================================================
// Delivery
// ============================================================================

enum WriteOutcome {
    Written,
    Cancelled,
    Failed(CloseReason),
}

struct DeliveryTask<T> {
    manager: Weak<ConnectionManager>,
    conn: Arc<Connection>,
    queue: mpsc::Receiver<Frame>,
    transport: T,
    write_timeout: Duration,
    /// A single write running past this closes the connection.
    hard_timeout: Duration,
}

impl<T: Transport> DeliveryTask<T> {
    async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                biased;

                _ = self.conn.cancel.cancelled() => break,
                frame = self.queue.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            match self.write(&frame).await {
                WriteOutcome::Written => {}
                WriteOutcome::Cancelled => break,
                WriteOutcome::Failed(reason) => {
                    if let Some(manager) = self.manager.upgrade() {
                        manager.close(&self.conn, reason);
                    }
                    break;
                }
            }
        }

        // Release queued frames before the farewell write.
        self.queue.close();
        let farewell = self.conn.farewell.lock().take();
        if let Some(frame) = farewell
            && !matches!(
                tokio::time::timeout(self.write_timeout, self.transport.send(&frame)).await,
                Ok(Ok(()))
            )
        {
            debug!(connection = %self.conn.id, "farewell frame not delivered");
        }
        self.transport.close().await;
        self.conn.cancel.cancel();
        debug!(connection = %self.conn.id, "delivery task stopped");
    }

    async fn write(&mut self, frame: &ServerMessage) -> WriteOutcome {
        let cancel = self.conn.cancel.clone();
        let send = self.transport.send(frame);
        tokio::pin!(send);

        let first = tokio::select! {
            biased;

            _ = cancel.cancelled() => return WriteOutcome::Cancelled,
            result = tokio::time::timeout(self.write_timeout, &mut send) => result,
        };
        let result = match first {
            Ok(result) => result,
            Err(_) => {
                warn!(connection = %self.conn.id, "transport write exceeded write timeout");
                if let Some(manager) = self.manager.upgrade() {
                    manager.degrade(&self.conn, "slow transport write");
                }
                let remaining = self.hard_timeout.saturating_sub(self.write_timeout);
                let second = tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return WriteOutcome::Cancelled,
                    result = tokio::time::timeout(remaining, &mut send) => result,
                };
                match second {
                    Ok(result) => result,
                    Err(_) => return WriteOutcome::Failed(CloseReason::WriteTimeout),
                }
            }
        };

        match result {
            Ok(()) => WriteOutcome::Written,
            Err(e) => {
                debug!(connection = %self.conn.id, error = %e, "transport write failed");
                WriteOutcome::Failed(CloseReason::TransportError)
            }
        }
    }
}
