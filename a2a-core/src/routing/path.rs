//! Routing paths, their scoring and the per-route path table.

use crate::protocol::AgentIdentifier;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Latency assumed for a direct path nobody has measured
pub const DIRECT_LATENCY_MS: f64 = 100.0;
pub const DIRECT_RELIABILITY: f64 = 0.95;
pub const DIRECT_COST: f64 = 1.0;

pub(crate) type RouteKey = (String, String);

pub(crate) fn route_key(source: &AgentIdentifier, destination: &AgentIdentifier) -> RouteKey {
    (source.id.clone(), destination.id.clone())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPath {
    pub source: AgentIdentifier,
    pub destination: AgentIdentifier,
    /// Every agent on the path, both endpoints included
    pub hops: Vec<AgentIdentifier>,
    /// Protocol per segment; a missing entry falls back to the message's protocol
    pub protocols: Vec<String>,
    pub estimated_latency_ms: f64,
    pub reliability: f64,
    pub cost: f64,
}

impl RoutingPath {
    pub fn direct(source: AgentIdentifier, destination: AgentIdentifier) -> Self {
        Self {
            hops: vec![source.clone(), destination.clone()],
            source,
            destination,
            protocols: Vec::new(),
            estimated_latency_ms: DIRECT_LATENCY_MS,
            reliability: DIRECT_RELIABILITY,
            cost: DIRECT_COST,
        }
    }

    /// A path through `via`, in order, with measured characteristics.
    pub fn through(
        source: AgentIdentifier,
        via: Vec<AgentIdentifier>,
        destination: AgentIdentifier,
        estimated_latency_ms: f64,
        reliability: f64,
        cost: f64,
    ) -> Self {
        let mut hops = Vec::with_capacity(via.len() + 2);
        hops.push(source.clone());
        hops.extend(via);
        hops.push(destination.clone());
        Self {
            source,
            destination,
            hops,
            protocols: Vec::new(),
            estimated_latency_ms,
            reliability,
            cost,
        }
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn is_direct(&self) -> bool {
        self.hops.len() <= 2
    }

    /// Protocol for the segment leaving `hops[segment]`.
    pub fn protocol_for<'a>(&'a self, segment: usize, fallback: &'a str) -> &'a str {
        self.protocols
            .get(segment)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or(fallback)
    }

    /// `(1000 - latency)/1000 + reliability*100 + (100 - cost)/100 + (10 - hops)/10`
    pub fn score(&self) -> f64 {
        (1000.0 - self.estimated_latency_ms) / 1000.0
            + self.reliability * 100.0
            + (100.0 - self.cost) / 100.0
            + (10.0 - self.hop_count() as f64) / 10.0
    }

    /// Stable identity used for load accounting.
    pub fn signature(&self) -> String {
        self.hops.iter().map(|h| h.id.as_str()).collect::<Vec<_>>().join(">")
    }
}

pub(crate) fn by_score(a: &RoutingPath, b: &RoutingPath) -> Ordering {
    a.score().partial_cmp(&b.score()).unwrap_or(Ordering::Equal)
}

/// Known candidate paths plus the cache of selected ones.
#[derive(Debug, Default)]
pub(crate) struct PathTable {
    known: HashMap<RouteKey, Vec<RoutingPath>>,
    cache: HashMap<RouteKey, RoutingPath>,
}

impl PathTable {
    pub fn add_known(&mut self, path: RoutingPath) {
        let key = route_key(&path.source, &path.destination);
        self.cache.remove(&key);
        let candidates = self.known.entry(key).or_default();
        candidates.retain(|p| p.signature() != path.signature());
        candidates.push(path);
    }

    pub fn candidates(&self, key: &RouteKey) -> &[RoutingPath] {
        self.known.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn cached(&self, key: &RouteKey) -> Option<&RoutingPath> {
        self.cache.get(key)
    }

    pub fn cache(&mut self, key: RouteKey, path: RoutingPath) {
        self.cache.insert(key, path);
    }

    pub fn clear_cache(&mut self) -> usize {
        let cleared = self.cache.len();
        self.cache.clear();
        cleared
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
