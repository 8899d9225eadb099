//! Message routing between agents.
//!
//! The router sits above the engine. For every message it:
//! - evaluates routing rules (highest priority first, first match wins)
//! - resolves and caches the best known path
//! - gates delivery with a per-route circuit breaker
//! - forwards hop by hop with bounded, exponentially backed-off retry

mod balancer;
mod circuit;
mod path;
mod rules;

pub use balancer::{BalanceStrategy, PathBalancer, SCORE_MARGIN};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Transition};
pub use path::{RoutingPath, DIRECT_COST, DIRECT_LATENCY_MS, DIRECT_RELIABILITY};
pub use rules::{MessagePredicate, MessageTransform, RoutingRule, RuleAction, RuleCondition};

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::events::{EventBus, ProtocolEvent};
use crate::protocol::{A2AMessage, AgentIdentifier};
use crate::registry::ProtocolRegistry;
use async_trait::async_trait;
use futures::future::join_all;
use path::{route_key, PathTable, RouteKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Anything that can put a fully built message on the wire.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// One delivery attempt. Returns the message id.
    async fn send_message(&self, message: A2AMessage) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub enable_load_balancing: bool,
    pub enable_circuit_breaker: bool,
    pub enable_caching: bool,
    /// Longest accepted path, endpoints included
    pub max_hops: usize,
    pub retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    pub balance_strategy: BalanceStrategy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_load_balancing: false,
            enable_circuit_breaker: true,
            enable_caching: true,
            max_hops: 10,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            balance_strategy: BalanceStrategy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// What happened to a routed message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Delivered {
        message_id: String,
        /// Agent ids along the path taken
        path: Vec<String>,
    },
    Broadcast {
        delivered: Vec<String>,
        failed: Vec<(String, String)>,
    },
    Queued {
        destination_id: String,
        depth: usize,
    },
    Dropped {
        rule_id: String,
    },
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(String, RouteOutcome)>,
    pub failures: Vec<(String, Error)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub routed: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub queued: u64,
    pub circuit_rejections: u64,
    pub cached_paths: usize,
}

#[derive(Debug, Default)]
struct RouterCounters {
    routed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    queued: AtomicU64,
    circuit_rejections: AtomicU64,
}

impl RouterCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MessageRouter {
    config: RouterConfig,
    sender: Arc<dyn MessageSender>,
    registry: Arc<ProtocolRegistry>,
    events: EventBus,
    /// Sorted by descending priority
    rules: RwLock<Vec<RoutingRule>>,
    paths: RwLock<PathTable>,
    breakers: RwLock<HashMap<RouteKey, CircuitBreaker>>,
    queues: RwLock<HashMap<String, VecDeque<A2AMessage>>>,
    balancer: PathBalancer,
    counters: RouterCounters,
    shutdown: CancellationToken,
}

impl MessageRouter {
    pub fn new(
        config: RouterConfig,
        sender: Arc<dyn MessageSender>,
        registry: Arc<ProtocolRegistry>,
        events: EventBus,
    ) -> Self {
        let balancer = PathBalancer::new(config.balance_strategy);
        Self {
            config,
            sender,
            registry,
            events,
            rules: RwLock::new(Vec::new()),
            paths: RwLock::new(PathTable::default()),
            breakers: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            balancer,
            counters: RouterCounters::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Routes one message according to the rules.
    pub async fn route(&self, mut message: A2AMessage) -> Result<RouteOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if message.routing.protocol.is_empty() {
            message.routing.protocol = self
                .registry
                .optimize_protocol_selection(&message.message_type, &message.destination)
                .await;
        }
        message.validate()?;
        RouterCounters::bump(&self.counters.routed);

        let matched = {
            let rules = self.rules.read().await;
            rules::first_match(&rules, &message).map(|r| (r.id.clone(), r.action.clone()))
        };
        let action = match matched {
            Some((rule_id, action)) => {
                debug!(rule_id = %rule_id, message_id = %message.id, action = action.name(), "Routing rule matched");
                self.events.emit(ProtocolEvent::RoutingRuleMatched {
                    rule_id: rule_id.clone(),
                    message_id: message.id.clone(),
                });
                if let RuleAction::Drop = action {
                    RouterCounters::bump(&self.counters.dropped);
                    return Ok(RouteOutcome::Dropped { rule_id });
                }
                action
            }
            None => RuleAction::Forward,
        };

        match action {
            RuleAction::Forward | RuleAction::Drop => self.forward(message).await,
            RuleAction::Transform(transform) => self.forward(transform(message)).await,
            RuleAction::Queue => Ok(self.enqueue(message).await),
            RuleAction::Broadcast(recipients) => Ok(self.fan_out(message, recipients).await),
        }
    }

    /// Routes a batch, grouped by destination. Order is kept within a destination.
    pub async fn route_batch(&self, messages: Vec<A2AMessage>) -> BatchReport {
        let mut groups: Vec<(String, Vec<A2AMessage>)> = Vec::new();
        for message in messages {
            match groups.iter().position(|(dest, _)| dest == &message.destination.id) {
                Some(index) => groups[index].1.push(message),
                None => groups.push((message.destination.id.clone(), vec![message])),
            }
        }

        let results = join_all(groups.into_iter().map(|(_, group)| async move {
            let mut results = Vec::with_capacity(group.len());
            for message in group {
                let id = message.id.clone();
                results.push((id, self.route(message).await));
            }
            results
        }))
        .await;

        let mut report = BatchReport::default();
        for (id, result) in results.into_iter().flatten() {
            match result {
                Ok(outcome) => report.outcomes.push((id, outcome)),
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Batch message failed");
                    report.failures.push((id, e));
                }
            }
        }
        report
    }

    /// Best path from `source` to `destination`, from cache, known paths, or a direct fallback.
    pub async fn find_optimal_path(&self, source: &AgentIdentifier, destination: &AgentIdentifier) -> RoutingPath {
        let key = route_key(source, destination);
        let use_cache = self.config.enable_caching && !self.config.enable_load_balancing;

        if use_cache {
            if let Some(path) = self.paths.read().await.cached(&key) {
                return path.clone();
            }
        }

        let candidates = self.paths.read().await.candidates(&key).to_vec();
        let path = if candidates.is_empty() {
            RoutingPath::direct(source.clone(), destination.clone())
        } else if self.config.enable_load_balancing {
            let near = balancer::near_best(candidates);
            match self.balancer.choose(&near).await {
                Some(path) => path,
                None => RoutingPath::direct(source.clone(), destination.clone()),
            }
        } else {
            candidates
                .into_iter()
                .max_by(path::by_score)
                .unwrap_or_else(|| RoutingPath::direct(source.clone(), destination.clone()))
        };

        if use_cache {
            self.paths.write().await.cache(key, path.clone());
        }
        path
    }

    /// Registers a measured path as a routing candidate.
    pub async fn add_known_path(&self, path: RoutingPath) -> Result<()> {
        if path.hops.len() < 2 {
            return Err(Error::validation("A path needs at least a source and a destination"));
        }
        if path.hop_count() > self.config.max_hops {
            return Err(Error::validation(format!(
                "Path has {} hops, limit is {}",
                path.hop_count(),
                self.config.max_hops
            )));
        }
        self.paths.write().await.add_known(path);
        Ok(())
    }

    /// Clears the path cache so the next lookups rescore. Returns how many entries were dropped.
    pub async fn optimize_routes(&self) -> usize {
        let cleared = self.paths.write().await.clear_cache();
        info!(cleared, "Cleared routing path cache");
        cleared
    }

    pub async fn add_rule(&self, rule: RoutingRule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(Error::routing(format!("Rule {} already exists", rule.id)));
        }
        // Insert after every rule of equal or higher priority to keep insertion order among equals.
        let at = rules.partition_point(|r| r.priority >= rule.priority);
        rules.insert(at, rule);
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        rules.len() != before
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| Error::routing(format!("Unknown rule {}", rule_id)))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().await.clone()
    }

    pub async fn queued(&self, destination_id: &str) -> usize {
        self.queues.read().await.get(destination_id).map_or(0, VecDeque::len)
    }

    /// Forwards every message queued for the destination, in arrival order.
    pub async fn flush_queue(&self, destination_id: &str) -> BatchReport {
        let pending: Vec<A2AMessage> = self
            .queues
            .write()
            .await
            .remove(destination_id)
            .map(Vec::from)
            .unwrap_or_default();

        let mut report = BatchReport::default();
        for message in pending {
            let id = message.id.clone();
            match self.forward(message).await {
                Ok(outcome) => report.outcomes.push((id, outcome)),
                Err(e) => report.failures.push((id, e)),
            }
        }
        report
    }

    pub async fn circuit_state(&self, source_id: &str, destination_id: &str) -> CircuitState {
        self.breakers
            .read()
            .await
            .get(&(source_id.to_string(), destination_id.to_string()))
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    pub async fn circuit_failures(&self, source_id: &str, destination_id: &str) -> u32 {
        self.breakers
            .read()
            .await
            .get(&(source_id.to_string(), destination_id.to_string()))
            .map_or(0, CircuitBreaker::failure_count)
    }

    /// Forgets the breaker for the route; it starts closed on next use.
    pub async fn reset_circuit(&self, source_id: &str, destination_id: &str) {
        let key = (source_id.to_string(), destination_id.to_string());
        let removed = self.breakers.write().await.remove(&key);
        if let Some(breaker) = removed {
            if breaker.state() != CircuitState::Closed {
                info!(source_id, destination_id, "Circuit reset");
                self.publish(
                    &key,
                    Some(Transition {
                        from: breaker.state(),
                        to: CircuitState::Closed,
                    }),
                );
            }
        }
    }

    pub async fn stats(&self) -> RouterStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RouterStats {
            routed: load(&self.counters.routed),
            delivered: load(&self.counters.delivered),
            failed: load(&self.counters.failed),
            retried: load(&self.counters.retried),
            dropped: load(&self.counters.dropped),
            queued: load(&self.counters.queued),
            circuit_rejections: load(&self.counters.circuit_rejections),
            cached_paths: self.paths.read().await.cache_len(),
        }
    }

    /// Cancels pending retries; later routes fail with `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn enqueue(&self, message: A2AMessage) -> RouteOutcome {
        let destination_id = message.destination.id.clone();
        let mut queues = self.queues.write().await;
        let queue = queues.entry(destination_id.clone()).or_default();
        queue.push_back(message);
        RouterCounters::bump(&self.counters.queued);
        debug!(destination_id = %destination_id, depth = queue.len(), "Message queued");
        RouteOutcome::Queued {
            depth: queue.len(),
            destination_id,
        }
    }

    async fn fan_out(&self, message: A2AMessage, recipients: Vec<AgentIdentifier>) -> RouteOutcome {
        let copies = recipients.into_iter().map(|recipient| {
            let mut copy = message.clone();
            copy.id = Uuid::new_v4().to_string();
            copy.destination = recipient;
            copy
        });

        let results = join_all(copies.map(|copy| async move {
            let recipient = copy.destination.id.clone();
            (recipient, self.forward(copy).await)
        }))
        .await;

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (recipient, result) in results {
            match result {
                Ok(_) => delivered.push(recipient),
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "Broadcast recipient failed");
                    failed.push((recipient, e.to_string()));
                }
            }
        }
        RouteOutcome::Broadcast { delivered, failed }
    }

    /// Path resolution plus breaker-gated delivery with bounded retry.
    async fn forward(&self, message: A2AMessage) -> Result<RouteOutcome> {
        let path = self.find_optimal_path(&message.source, &message.destination).await;
        if path.hop_count() > self.config.max_hops {
            return Err(Error::validation(format!(
                "Path to {} has {} hops, limit is {}",
                message.destination.id,
                path.hop_count(),
                self.config.max_hops
            )));
        }
        let key = route_key(&message.source, &message.destination);

        let mut attempt: u32 = 0;
        loop {
            self.acquire(&key).await?;

            match self.deliver(&message, &path).await {
                Ok(()) => {
                    self.settle(&key, true).await;
                    RouterCounters::bump(&self.counters.delivered);
                    return Ok(RouteOutcome::Delivered {
                        message_id: message.id.clone(),
                        path: path.hops.iter().map(|h| h.id.clone()).collect(),
                    });
                }
                Err(e) => {
                    self.settle(&key, false).await;
                    if !e.is_retryable() || attempt >= self.config.retry_attempts {
                        RouterCounters::bump(&self.counters.failed);
                        warn!(message_id = %message.id, attempt, error = %e, "Routing failed");
                        return Err(e);
                    }

                    let delay = self.config.retry_base_delay.saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    RouterCounters::bump(&self.counters.retried);
                    debug!(message_id = %message.id, attempt, delay_ms = delay.as_millis() as u64, "Retrying route");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Sends along every segment of the path in order.
    async fn deliver(&self, message: &A2AMessage, path: &RoutingPath) -> Result<()> {
        if path.is_direct() {
            let mut hop = message.clone();
            hop.routing.protocol = path.protocol_for(0, &message.routing.protocol).to_string();
            self.sender.send_message(hop).await?;
            return Ok(());
        }

        for (segment, next) in path.hops.iter().enumerate().skip(1) {
            let mut hop = message.clone();
            hop.destination = next.clone();
            hop.routing.path = path.hops.clone();
            hop.routing.protocol = path.protocol_for(segment - 1, &message.routing.protocol).to_string();
            self.sender.send_message(hop).await.map_err(|e| {
                warn!(message_id = %message.id, hop = %next.id, error = %e, "Hop failed");
                e
            })?;
        }
        Ok(())
    }

    async fn acquire(&self, key: &RouteKey) -> Result<()> {
        if !self.config.enable_circuit_breaker {
            return Ok(());
        }
        let (allowed, transition) = {
            let mut breakers = self.breakers.write().await;
            let breaker = breakers
                .entry(key.clone())
                .or_insert_with(|| CircuitBreaker::new(self.config.circuit_breaker.clone()));
            breaker.try_acquire(Instant::now())
        };
        self.publish(key, transition);

        if allowed {
            Ok(())
        } else {
            RouterCounters::bump(&self.counters.circuit_rejections);
            Err(Error::circuit_open(&key.0, &key.1))
        }
    }

    async fn settle(&self, key: &RouteKey, success: bool) {
        if !self.config.enable_circuit_breaker {
            return;
        }
        let transition = {
            let mut breakers = self.breakers.write().await;
            let Some(breaker) = breakers.get_mut(key) else {
                return;
            };
            if success {
                breaker.record_success()
            } else {
                breaker.record_failure(Instant::now())
            }
        };
        self.publish(key, transition);
    }

    fn publish(&self, key: &RouteKey, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            info!(source_id = %key.0, destination_id = %key.1, ?from, ?to, "Circuit state changed");
            self.events.emit(ProtocolEvent::CircuitStateChanged {
                source_id: key.0.clone(),
                destination_id: key.1.clone(),
                from,
                to,
            });
        }
    }
}
