//! Protocol engine: the message lifecycle of one agent.
//!
//! Outbound messages are completed from a [`MessageDraft`], optionally signed,
//! handed to the handler the registry resolves for their protocol and retried
//! with exponential backoff. Inbound messages from every active handler are
//! merged into one stream and verified before they reach the consumer.

mod connection;
mod metrics;

pub use connection::ConnectionInfo;
pub use metrics::{EngineMetrics, MetricsSnapshot};

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::events::{EventBus, ProtocolEvent};
use crate::protocol::{
    merge_streams, message_types, A2AMessage, AgentIdentifier, MessageDraft, MessageStream, Payload,
    ProtocolHandler,
};
use crate::registry::{ProtocolRegistry, DEFAULT_PROTOCOL};
use crate::routing::MessageSender;
use crate::security::SecurityManager;
use async_trait::async_trait;
use connection::{Connection, ConnectionTable};
use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub agent_id: String,
    /// Sign outbound and verify inbound messages
    pub enable_encryption: bool,
    pub enable_metrics: bool,
    /// Upper bound on a single handler send
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    pub default_protocol: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            enable_encryption: false,
            enable_metrics: true,
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            heartbeat_interval: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(1000),
            default_protocol: DEFAULT_PROTOCOL.to_string(),
        }
    }
}

/// Per-recipient results of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// `(recipient id, message id)`
    pub delivered: Vec<(String, String)>,
    pub failed: Vec<(String, Error)>,
}

impl BroadcastReport {
    pub fn delivered_ids(&self) -> Vec<String> {
        self.delivered.iter().map(|(_, id)| id.clone()).collect()
    }
}

pub struct ProtocolEngine {
    config: EngineConfig,
    identity: AgentIdentifier,
    registry: Arc<ProtocolRegistry>,
    security: Arc<SecurityManager>,
    events: EventBus,
    connections: RwLock<ConnectionTable>,
    metrics: EngineMetrics,
    shutdown: CancellationToken,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolEngine {
    pub fn new(
        config: EngineConfig,
        identity: AgentIdentifier,
        registry: Arc<ProtocolRegistry>,
        security: Arc<SecurityManager>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            identity,
            registry,
            security,
            events,
            connections: RwLock::new(ConnectionTable::default()),
            metrics: EngineMetrics::new(),
            shutdown: CancellationToken::new(),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &AgentIdentifier {
        &self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Completes and sends the draft, retrying transport failures. Returns the message id.
    pub async fn send(&self, draft: MessageDraft) -> Result<String> {
        self.send_with_cancellation(draft, &CancellationToken::new()).await
    }

    /// Like [`send`](Self::send), but `cancel` aborts any pending retry.
    pub async fn send_with_cancellation(&self, draft: MessageDraft, cancel: &CancellationToken) -> Result<String> {
        let mut message = draft.build(&self.identity, &self.config.default_protocol)?;
        let connection = self
            .establish_connection(&message.destination, Some(message.routing.protocol.as_str()))
            .await?;
        let handler = self.handler_for(&connection).await?;

        loop {
            let outcome = match self.prepare(message.clone()).await {
                Ok(outbound) => self.dispatch(&handler, &outbound).await.map(|()| outbound.id),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(id) => return Ok(id),
                Err(e) if e.is_retryable() && message.metadata.retry_count < self.config.max_retries => {
                    let delay = self
                        .config
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(message.metadata.retry_count));
                    message.metadata.retry_count += 1;
                    if self.config.enable_metrics {
                        self.metrics.record_retry();
                    }
                    warn!(
                        message_id = %message.id,
                        retry = message.metadata.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if self.config.enable_metrics {
                        self.metrics.record_failure();
                    }
                    error!(message_id = %message.id, retries = message.metadata.retry_count, error = %e, "Send failed");
                    return Err(e);
                }
            }
        }
    }

    /// Sends the draft to every recipient concurrently. One failure never aborts the others.
    pub async fn broadcast(&self, draft: MessageDraft, recipients: &[AgentIdentifier]) -> BroadcastReport {
        let sends = recipients.iter().map(|recipient| {
            let draft = draft.with_destination(recipient.clone());
            async move { (recipient.id.clone(), self.send(draft).await) }
        });

        let mut report = BroadcastReport::default();
        for (recipient, result) in join_all(sends).await {
            match result {
                Ok(message_id) => report.delivered.push((recipient, message_id)),
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "Broadcast recipient failed");
                    report.failed.push((recipient, e));
                }
            }
        }
        report
    }

    /// Verified inbound messages from every handler active when the stream is first polled.
    pub fn receive(self: &Arc<Self>) -> MessageStream {
        let engine = Arc::clone(self);
        Box::pin(async_stream::stream! {
            let handlers = engine.registry.active_handlers().await;
            let mut inbound = merge_streams(handlers.iter().map(|h| h.receive()).collect());
            while let Some(message) = inbound.next().await {
                if let Some(message) = engine.accept(message).await {
                    yield message;
                }
            }
        })
    }

    /// Returns the connection to `target` over `protocol`, opening it on first use.
    pub async fn establish_connection(
        &self,
        target: &AgentIdentifier,
        protocol: Option<&str>,
    ) -> Result<ConnectionInfo> {
        let protocol = protocol
            .filter(|p| !p.is_empty())
            .unwrap_or(self.config.default_protocol.as_str());

        if let Some(existing) = self.connections.read().await.get(&target.id, protocol) {
            return Ok(existing.info());
        }

        let handler = self.registry.get_handler(protocol, Some(target)).await?;
        let mut connections = self.connections.write().await;
        // Another task may have connected while the handler was resolved.
        if let Some(existing) = connections.get(&target.id, protocol) {
            return Ok(existing.info());
        }

        let connection = Connection::new(target.clone(), protocol, handler);
        let info = connection.info();
        connections.insert(connection);
        drop(connections);

        info!(connection_id = %info.id, target = %target.id, protocol, "Connection established");
        self.events.emit(ProtocolEvent::ConnectionEstablished {
            connection_id: info.id.clone(),
            target_id: target.id.clone(),
            protocol: protocol.to_string(),
        });
        Ok(info)
    }

    /// Closes the connection. Closing an unknown id is a no-op.
    pub async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let removed = self.connections.write().await.remove_by_id(connection_id);
        if let Some(connection) = removed {
            info!(connection_id, target = %connection.target.id, "Connection closed");
            self.events.emit(ProtocolEvent::ConnectionClosed {
                connection_id: connection_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn active_connections(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.infos()
    }

    /// Emits one liveness signal per connection. Returns how many were signalled.
    pub async fn send_heartbeats(&self) -> usize {
        let targets: Vec<(String, AgentIdentifier, String, Arc<dyn ProtocolHandler>)> = {
            let mut connections = self.connections.write().await;
            connections
                .iter_mut()
                .map(|c| {
                    c.update_heartbeat();
                    (c.id.clone(), c.target.clone(), c.protocol.clone(), c.handler.clone())
                })
                .collect()
        };

        for (connection_id, target, protocol, handler) in &targets {
            self.events.emit(ProtocolEvent::Heartbeat {
                connection_id: connection_id.clone(),
            });

            let mut beat = A2AMessage::new(
                self.identity.clone(),
                target.clone(),
                message_types::HEARTBEAT,
                Payload::text(connection_id.clone()),
                protocol.clone(),
            );
            beat.metadata.ttl = Some(self.config.heartbeat_interval.as_millis() as u64);

            let sent = match self.prepare(beat).await {
                Ok(beat) => self.dispatch(handler, &beat).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                debug!(connection_id = %connection_id, error = %e, "Heartbeat not delivered");
            }
        }
        targets.len()
    }

    /// Starts the heartbeat loop. Calling it again is a no-op, and a zero interval disables it.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let period = self.config.heartbeat_interval;
        if period.is_zero() {
            warn!(agent_id = %self.identity.id, "Heartbeat interval is zero, heartbeat disabled");
            return;
        }
        let Ok(mut task) = self.heartbeat_task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let engine = Arc::clone(self);
        let token = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let count = engine.send_heartbeats().await;
                        debug!(connections = count, "Heartbeat tick");
                    }
                }
            }
        }));
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cancels the heartbeat and pending retries and closes every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.heartbeat_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            task.abort();
        }

        let closed = self.connections.write().await.drain();
        for connection in closed {
            self.events.emit(ProtocolEvent::ConnectionClosed {
                connection_id: connection.id,
            });
        }
        info!(agent_id = %self.identity.id, "Protocol engine shut down");
    }

    async fn handler_for(&self, info: &ConnectionInfo) -> Result<Arc<dyn ProtocolHandler>> {
        self.connections
            .read()
            .await
            .get(&info.target_id, &info.protocol)
            .map(|c| c.handler.clone())
            .ok_or_else(|| Error::transport(format!("Connection {} closed", info.id)))
    }

    /// Signs the message when signing is on.
    async fn prepare(&self, message: A2AMessage) -> Result<A2AMessage> {
        if self.config.enable_encryption {
            self.security.sign_message(message).await
        } else {
            Ok(message)
        }
    }

    /// One attempt through `handler`, bounded by the default timeout.
    async fn dispatch(&self, handler: &Arc<dyn ProtocolHandler>, message: &A2AMessage) -> Result<()> {
        if !handler.can_handle(message) {
            return Err(Error::no_handler(format!(
                "Handler {}:{} cannot carry message {}",
                handler.name(),
                handler.version(),
                message.id
            )));
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.default_timeout, handler.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.default_timeout)),
        };
        let latency = started.elapsed();

        self.registry
            .record_performance(handler.name(), handler.version(), latency, result.is_ok())
            .await;

        if result.is_ok() {
            let bytes = message.to_bytes().map(|b| b.len()).unwrap_or(0);
            if self.config.enable_metrics {
                self.metrics.record_sent(bytes, latency);
            }
            debug!(message_id = %message.id, destination = %message.destination.id, latency_ms = latency.as_millis() as u64, "Message sent");
            self.events.emit(ProtocolEvent::MessageSent {
                message_id: message.id.clone(),
                destination_id: message.destination.id.clone(),
                protocol: message.routing.protocol.clone(),
                latency_ms: latency.as_millis() as u64,
                bytes,
            });
        }
        result
    }

    /// Gatekeeper for inbound messages.
    async fn accept(&self, message: A2AMessage) -> Option<A2AMessage> {
        let rejection = if message.is_expired() {
            Some("expired")
        } else if message.validate().is_err() {
            Some("invalid")
        } else if self.config.enable_encryption && !self.security.verify_message(&message).await {
            Some("verification failed")
        } else {
            None
        };

        if let Some(reason) = rejection {
            warn!(message_id = %message.id, source = %message.source.id, reason, "Dropped inbound message");
            if self.config.enable_metrics {
                self.metrics.record_dropped();
            }
            return None;
        }

        if self.config.enable_metrics {
            self.metrics.record_received();
        }
        self.events.emit(ProtocolEvent::MessageReceived {
            message_id: message.id.clone(),
            source_id: message.source.id.clone(),
        });
        Some(message)
    }
}

#[async_trait]
impl MessageSender for ProtocolEngine {
    /// Single attempt; the router owns retry for routed messages.
    async fn send_message(&self, message: A2AMessage) -> Result<String> {
        message.validate()?;
        let connection = self
            .establish_connection(&message.destination, Some(message.routing.protocol.as_str()))
            .await?;
        let handler = self.handler_for(&connection).await?;
        let outbound = self.prepare(message).await?;
        self.dispatch(&handler, &outbound).await?;
        Ok(outbound.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventCategory;
    use crate::protocol::{AgentRole, HandlerProfile};
    use crate::security::{SecurityConfig, SecurityLevel};
    use crate::transport::MemoryHandler;
    use std::collections::BTreeSet;

    fn agent(id: &str) -> AgentIdentifier {
        AgentIdentifier::new(id, AgentRole::Drone, format!("mem://{}", id))
    }

    struct Fixture {
        engine: Arc<ProtocolEngine>,
        http: Arc<MemoryHandler>,
        security: Arc<SecurityManager>,
        events: EventBus,
    }

    async fn fixture_with(config: EngineConfig, http: MemoryHandler) -> Fixture {
        let events = EventBus::default();
        let registry = Arc::new(ProtocolRegistry::new());
        let http = Arc::new(http);
        registry.register(http.clone()).await.unwrap();

        let security = Arc::new(SecurityManager::new(SecurityConfig::default(), events.clone()));
        security.register_agent("queen", SecurityLevel::High).await.unwrap();
        security.register_agent("drone-1", SecurityLevel::Standard).await.unwrap();

        let identity = AgentIdentifier::new("queen", AgentRole::Queen, "mem://queen");
        let engine = Arc::new(ProtocolEngine::new(
            config,
            identity,
            registry,
            security.clone(),
            events.clone(),
        ));
        Fixture {
            engine,
            http,
            security,
            events,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(EngineConfig::default(), MemoryHandler::new("http", "1.1")).await
    }

    fn task(to: &str) -> MessageDraft {
        MessageDraft::to(agent(to)).payload(Payload::text("collect samples"))
    }

    #[tokio::test]
    async fn test_send_fills_defaults_and_records_metrics() {
        let f = fixture().await;
        let id = f.engine.send(task("drone-1")).await.unwrap();

        let attempts = f.http.attempts().await;
        assert_eq!(attempts.len(), 1);
        let sent = &attempts[0];
        assert_eq!(sent.id, id);
        assert_eq!(sent.source.id, "queen");
        assert_eq!(sent.message_type, message_types::TASK);
        assert_eq!(sent.routing.protocol, "http");
        assert_eq!(sent.metadata.retry_count, 0);

        let metrics = f.engine.metrics();
        assert_eq!(metrics.messages_sent, 1);
        assert!(metrics.bytes_sent > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_tracks_failures_with_backoff() {
        let f = fixture().await;
        f.http.fail_next(2);

        let started = Instant::now();
        f.engine.send(task("drone-1")).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1000 + 2000));
        let counts: Vec<u32> = f
            .http
            .attempts()
            .await
            .iter()
            .map(|m| m.metadata.retry_count)
            .collect();
        assert_eq!(counts, vec![0, 1, 2]);
        assert_eq!(f.engine.metrics().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_at_max() {
        let f = fixture().await;
        f.http.set_failing(true);

        let err = f.engine.send(task("drone-1")).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        let attempts = f.http.attempts().await;
        assert_eq!(attempts.len(), 4);
        assert_eq!(attempts.last().map(|m| m.metadata.retry_count), Some(3));
        assert_eq!(f.engine.metrics().send_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_protocol_fails_without_retry() {
        let f = fixture().await;
        let err = f.engine.send(task("drone-1").protocol("grpc")).await.unwrap_err();

        assert!(matches!(err, Error::NoHandler(_)));
        assert_eq!(f.http.attempt_count().await, 0);
        assert_eq!(f.engine.metrics().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_is_retryable() {
        let f = fixture_with(
            EngineConfig {
                default_timeout: Duration::from_millis(100),
                max_retries: 1,
                ..Default::default()
            },
            MemoryHandler::new("http", "1.1"),
        )
        .await;
        f.http.set_latency(Some(Duration::from_secs(1)));

        let err = f.engine.send(task("drone-1")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(f.engine.metrics().retries, 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_retry() {
        let f = fixture().await;
        f.http.set_failing(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .engine
            .send_with_cancellation(task("drone-1"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(f.http.attempt_count().await, 1);
    }

    #[tokio::test]
    async fn test_signing_when_encryption_enabled() {
        let f = fixture_with(
            EngineConfig {
                enable_encryption: true,
                ..Default::default()
            },
            MemoryHandler::new("http", "1.1"),
        )
        .await;
        f.engine.send(task("drone-1")).await.unwrap();

        let sent = f.http.attempts().await.remove(0);
        assert!(sent.security.is_signed());
        assert!(f.security.verify_message(&sent).await);
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failing_recipients() {
        let profile = HandlerProfile {
            required_capabilities: BTreeSet::from(["mesh".to_string()]),
            ..Default::default()
        };
        let f = fixture_with(
            EngineConfig::default(),
            MemoryHandler::new("http", "1.1").with_profile(profile),
        )
        .await;
        let reachable = agent("d1").with_capability("mesh");
        let unreachable = agent("d2");

        let report = f
            .engine
            .broadcast(task("unused"), &[reachable, unreachable])
            .await;

        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.delivered[0].0, "d1");
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, Error::NoHandler(_)));
    }

    #[tokio::test]
    async fn test_connections_are_reused_and_closed() {
        let f = fixture().await;
        let mut events = f.events.subscribe(EventCategory::Connection);

        let first = f.engine.establish_connection(&agent("drone-1"), None).await.unwrap();
        let second = f.engine.establish_connection(&agent("drone-1"), Some("http")).await.unwrap();
        assert_eq!(first.id, second.id);
        f.engine.send(task("drone-1")).await.unwrap();
        assert_eq!(f.engine.active_connections().await.len(), 1);

        f.engine.close_connection(&first.id).await.unwrap();
        f.engine.close_connection(&first.id).await.unwrap();
        assert!(f.engine.active_connections().await.is_empty());

        assert!(matches!(events.try_recv(), Some(ProtocolEvent::ConnectionEstablished { .. })));
        assert!(matches!(events.try_recv(), Some(ProtocolEvent::ConnectionClosed { .. })));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_receive_drops_unverified_and_expired_messages() {
        let f = fixture_with(
            EngineConfig {
                enable_encryption: true,
                ..Default::default()
            },
            MemoryHandler::new("http", "1.1"),
        )
        .await;
        let incoming = |payload: &str| {
            A2AMessage::new(
                AgentIdentifier::new("drone-1", AgentRole::Drone, "mem://drone-1"),
                AgentIdentifier::new("queen", AgentRole::Queen, "mem://queen"),
                "response",
                Payload::text(payload),
                "http",
            )
        };

        let mut stale = f.security.sign_message(incoming("stale")).await.unwrap();
        stale.timestamp -= 10_000;
        stale.metadata.ttl = Some(1);
        let good = f.security.sign_message(incoming("done")).await.unwrap();

        f.http.inject(incoming("unsigned")).unwrap();
        f.http.inject(stale).unwrap();
        f.http.inject(good.clone()).unwrap();

        let mut stream = f.engine.receive();
        let received = stream.next().await.unwrap();
        assert_eq!(received.id, good.id);

        let metrics = f.engine.metrics();
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.messages_dropped, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_signals_each_connection() {
        let f = fixture().await;
        f.engine.establish_connection(&agent("drone-1"), None).await.unwrap();
        let mut events = f.events.subscribe(EventCategory::Connection);

        assert_eq!(f.engine.send_heartbeats().await, 1);

        assert!(matches!(events.try_recv(), Some(ProtocolEvent::Heartbeat { .. })));
        let beat = f.http.attempts().await.remove(0);
        assert_eq!(beat.message_type, message_types::HEARTBEAT);
        assert!(f.engine.active_connections().await[0].last_heartbeat.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_stops_on_shutdown() {
        let f = fixture_with(
            EngineConfig {
                heartbeat_interval: Duration::from_secs(5),
                ..Default::default()
            },
            MemoryHandler::new("http", "1.1"),
        )
        .await;
        f.engine.establish_connection(&agent("drone-1"), None).await.unwrap();

        f.engine.start_heartbeat();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(f.http.attempt_count().await, 2);

        f.engine.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.http.attempt_count().await, 2);
        assert!(f.engine.active_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_signing_failure_counts_as_failed_send() {
        let f = fixture_with(
            EngineConfig {
                enable_encryption: true,
                ..Default::default()
            },
            MemoryHandler::new("http", "1.1"),
        )
        .await;
        let key_id = f.security.context("queen").await.unwrap().active_key_id;
        f.security.revoke_key(&key_id, "compromised").await;

        let err = f.engine.send(task("drone-1")).await.unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert_eq!(f.http.attempt_count().await, 0);
        let metrics = f.engine.metrics();
        assert_eq!(metrics.send_failures, 1);
        assert_eq!(metrics.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_disables_the_loop() {
        let f = fixture_with(
            EngineConfig {
                heartbeat_interval: Duration::ZERO,
                ..Default::default()
            },
            MemoryHandler::new("http", "1.1"),
        )
        .await;
        f.engine.establish_connection(&agent("drone-1"), None).await.unwrap();

        f.engine.start_heartbeat();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(f.engine.heartbeat_task.lock().unwrap().is_none());
        assert_eq!(f.http.attempt_count().await, 0);
        // Manual heartbeats still work.
        assert_eq!(f.engine.send_heartbeats().await, 1);
    }

    #[tokio::test]
    async fn test_engine_is_a_message_sender() {
        let f = fixture().await;
        let sender: Arc<dyn MessageSender> = f.engine.clone();
        let message = A2AMessage::new(
            f.engine.identity().clone(),
            agent("drone-1"),
            "task",
            Payload::text("hop"),
            "http",
        );

        let id = sender.send_message(message.clone()).await.unwrap();
        assert_eq!(id, message.id);
        f.http.set_failing(true);
        assert!(sender.send_message(message).await.is_err());
        assert_eq!(f.http.attempt_count().await, 2);
    }
}
