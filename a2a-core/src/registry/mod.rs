//! Protocol registry: which transport handlers exist and which one to use.
//!
//! Handlers are keyed by `name:version`. Resolution prefers the newest
//! version, optionally constrained by the target agent's capabilities, and
//! protocol selection scores every active registration for a message type.

mod bridge;
mod version;

pub use bridge::{CompatibilityMatrix, ProtocolBridge};
pub use version::compare_versions;

use crate::error::{Error, Result};
use crate::protocol::{message_types, AgentIdentifier, PerformanceMetrics, ProtocolHandler};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Protocol chosen when nothing scores.
pub const DEFAULT_PROTOCOL: &str = "http";

const TYPE_SUPPORT_BONUS: f64 = 10.0;
const CAPABILITY_BONUS: f64 = 5.0;
const RELIABILITY_WEIGHT: f64 = 10.0;
const LATENCY_WEIGHT: f64 = 5.0;
const THROUGHPUT_WEIGHT: f64 = 2.0;
/// Smoothing factor for observed performance
const METRICS_ALPHA: f64 = 0.2;
/// Floor on the latency a throughput sample is computed from
const MIN_SAMPLE_LATENCY: Duration = Duration::from_micros(100);

/// Capability descriptor derived for each registered handler version.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolDescriptor {
    pub name: String,
    pub version: String,
    pub supported_message_types: Vec<String>,
    pub required_capabilities: BTreeSet<String>,
    pub performance_metrics: PerformanceMetrics,
}

impl ProtocolDescriptor {
    fn from_handler(handler: &dyn ProtocolHandler) -> Self {
        let profile = handler.profile().unwrap_or_default();
        let supported_message_types = if profile.supported_message_types.is_empty() {
            vec![message_types::WILDCARD.to_string()]
        } else {
            profile.supported_message_types
        };
        Self {
            name: handler.name().to_string(),
            version: handler.version().to_string(),
            supported_message_types,
            required_capabilities: profile.required_capabilities,
            performance_metrics: profile.performance,
        }
    }

    pub fn key(&self) -> String {
        registry_key(&self.name, &self.version)
    }

    pub fn supports(&self, message_type: &str) -> bool {
        self.supported_message_types
            .iter()
            .any(|t| t == message_types::WILDCARD || t == message_type)
    }

    /// A descriptor without requirements accepts every target.
    pub fn accepts(&self, target: &AgentIdentifier) -> bool {
        self.required_capabilities.is_empty() || target.shares_capability(&self.required_capabilities)
    }

    fn score(&self, message_type: &str, target: &AgentIdentifier) -> Option<f64> {
        if !self.supports(message_type) {
            return None;
        }
        let metrics = &self.performance_metrics;
        let mut score = TYPE_SUPPORT_BONUS;
        if target.shares_capability(&self.required_capabilities) {
            score += CAPABILITY_BONUS;
        }
        score += metrics.reliability.clamp(0.0, 1.0) * RELIABILITY_WEIGHT;
        score += LATENCY_WEIGHT * 100.0 / (100.0 + metrics.avg_latency.max(0.0));
        score += THROUGHPUT_WEIGHT * (metrics.throughput.max(0.0) / 1000.0).min(1.0);
        Some(score)
    }
}

fn registry_key(name: &str, version: &str) -> String {
    format!("{}:{}", name, version)
}

struct Registration {
    handler: Arc<dyn ProtocolHandler>,
    descriptor: ProtocolDescriptor,
    active: bool,
}

pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<String, Registration>>,
    compatibility: RwLock<CompatibilityMatrix>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            protocols: RwLock::new(HashMap::new()),
            compatibility: RwLock::new(CompatibilityMatrix::with_defaults()),
        }
    }

    /// Registers a handler under `name:version`. Duplicates are rejected.
    pub async fn register(&self, handler: Arc<dyn ProtocolHandler>) -> Result<ProtocolDescriptor> {
        let descriptor = ProtocolDescriptor::from_handler(handler.as_ref());
        let key = descriptor.key();

        let mut protocols = self.protocols.write().await;
        if protocols.contains_key(&key) {
            return Err(Error::registry(format!("Protocol {} already registered", key)));
        }

        protocols.insert(
            key.clone(),
            Registration {
                handler,
                descriptor: descriptor.clone(),
                active: true,
            },
        );
        info!(protocol = %key, "Registered protocol handler");
        Ok(descriptor)
    }

    /// Removes a registration and disconnects its handler.
    pub async fn unregister(&self, name: &str, version: &str) -> Result<()> {
        let key = registry_key(name, version);
        let removed = self.protocols.write().await.remove(&key);
        let registration =
            removed.ok_or_else(|| Error::registry(format!("Protocol {} is not registered", key)))?;

        if let Err(e) = registration.handler.disconnect().await {
            warn!(protocol = %key, error = %e, "Handler disconnect failed during unregister");
        }
        info!(protocol = %key, "Unregistered protocol handler");
        Ok(())
    }

    pub async fn set_active(&self, name: &str, version: &str, active: bool) -> Result<()> {
        let key = registry_key(name, version);
        let mut protocols = self.protocols.write().await;
        let registration = protocols
            .get_mut(&key)
            .ok_or_else(|| Error::registry(format!("Protocol {} is not registered", key)))?;
        registration.active = active;
        Ok(())
    }

    pub async fn is_registered(&self, name: &str, version: &str) -> bool {
        self.protocols.read().await.contains_key(&registry_key(name, version))
    }

    /// Newest active version of `name`; with a target, the newest one whose
    /// requirements the target satisfies.
    pub async fn get_handler(
        &self,
        name: &str,
        target: Option<&AgentIdentifier>,
    ) -> Result<Arc<dyn ProtocolHandler>> {
        let protocols = self.protocols.read().await;
        let mut candidates: Vec<&Registration> = protocols
            .values()
            .filter(|r| r.active && r.descriptor.name == name)
            .collect();

        if candidates.is_empty() {
            return Err(Error::no_handler(format!("No handler registered for protocol {}", name)));
        }

        candidates.sort_by(|a, b| compare_versions(&b.descriptor.version, &a.descriptor.version));

        let chosen = match target {
            None => candidates.first(),
            Some(target) => candidates.iter().find(|r| r.descriptor.accepts(target)),
        };

        match chosen {
            Some(registration) => {
                debug!(protocol = %registration.descriptor.key(), "Resolved protocol handler");
                Ok(registration.handler.clone())
            }
            None => Err(Error::no_handler(format!(
                "No compatible handler for protocol {} and target {}",
                name,
                target.map(|t| t.id.as_str()).unwrap_or_default()
            ))),
        }
    }

    pub async fn descriptor(&self, name: &str, version: &str) -> Option<ProtocolDescriptor> {
        self.protocols
            .read()
            .await
            .get(&registry_key(name, version))
            .map(|r| r.descriptor.clone())
    }

    pub async fn descriptors(&self) -> Vec<ProtocolDescriptor> {
        let mut descriptors: Vec<_> = self
            .protocols
            .read()
            .await
            .values()
            .map(|r| r.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| compare_versions(&a.version, &b.version))
        });
        descriptors
    }

    pub async fn active_handlers(&self) -> Vec<Arc<dyn ProtocolHandler>> {
        self.protocols
            .read()
            .await
            .values()
            .filter(|r| r.active)
            .map(|r| r.handler.clone())
            .collect()
    }

    pub async fn add_compatibility(&self, a: &str, b: &str) {
        self.compatibility.write().await.add(a, b);
    }

    pub async fn remove_compatibility(&self, a: &str, b: &str) {
        self.compatibility.write().await.remove(a, b);
    }

    pub async fn find_bridge_protocol(&self, source: &str, target: &str) -> Option<ProtocolBridge> {
        self.compatibility.read().await.find_bridge(source, target)
    }

    /// Highest scoring active protocol for the message type and target.
    pub async fn optimize_protocol_selection(
        &self,
        message_type: &str,
        target: &AgentIdentifier,
    ) -> String {
        let protocols = self.protocols.read().await;
        let best = protocols
            .values()
            .filter(|r| r.active)
            .filter_map(|r| r.descriptor.score(message_type, target).map(|s| (s, &r.descriptor)))
            .max_by(|(sa, a), (sb, b)| {
                sa.partial_cmp(sb)
                    .unwrap_or(Ordering::Equal)
                    // Deterministic tie-break: earlier name, then newer version wins.
                    .then_with(|| b.name.cmp(&a.name))
                    .then_with(|| compare_versions(&a.version, &b.version))
            });

        match best {
            Some((score, descriptor)) => {
                debug!(protocol = %descriptor.key(), score, message_type, "Selected protocol");
                descriptor.name.clone()
            }
            None => DEFAULT_PROTOCOL.to_string(),
        }
    }

    /// Feeds an observed send outcome into the registration's performance metrics.
    pub async fn record_performance(&self, name: &str, version: &str, latency: Duration, success: bool) {
        let mut protocols = self.protocols.write().await;
        if let Some(registration) = protocols.get_mut(&registry_key(name, version)) {
            let metrics = &mut registration.descriptor.performance_metrics;
            let observed = if success { 1.0 } else { 0.0 };
            metrics.reliability = (1.0 - METRICS_ALPHA) * metrics.reliability + METRICS_ALPHA * observed;
            if success {
                let ms = latency.as_secs_f64() * 1000.0;
                metrics.avg_latency = (1.0 - METRICS_ALPHA) * metrics.avg_latency + METRICS_ALPHA * ms;
                // Sends per second one caller achieves at this latency.
                let per_second = 1.0 / latency.max(MIN_SAMPLE_LATENCY).as_secs_f64();
                metrics.throughput = (1.0 - METRICS_ALPHA) * metrics.throughput + METRICS_ALPHA * per_second;
            }
        }
    }

    /// Replaces `name:from` with the already registered `name:to`.
    ///
    /// In-flight connections are not migrated.
    pub async fn upgrade_protocol(&self, name: &str, from: &str, to: &str) -> Result<()> {
        if !self.is_registered(name, to).await {
            return Err(Error::registry(format!(
                "Cannot upgrade {} to {}: target version is not registered",
                name, to
            )));
        }
        if from == to {
            return Ok(());
        }
        self.unregister(name, from).await?;
        info!(protocol = name, from, to, "Upgraded protocol");
        Ok(())
    }

    /// Disconnects and drops every handler.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.protocols.write().await.drain().collect();
        for (key, registration) in drained {
            if let Err(e) = registration.handler.disconnect().await {
                warn!(protocol = %key, error = %e, "Handler disconnect failed during shutdown");
            }
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
