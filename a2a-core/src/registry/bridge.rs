//! Compatibility matrix between protocol families and one-hop bridge search.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// How a message in one protocol family reaches another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolBridge {
    /// The two families interoperate without an intermediate
    Direct,
    /// Translate through this intermediate protocol
    Via(String),
}

/// Symmetric compatibility relation between protocol names.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityMatrix {
    entries: HashMap<String, BTreeSet<String>>,
}

impl CompatibilityMatrix {
    /// Matrix seeded with the families every deployment speaks.
    pub fn with_defaults() -> Self {
        let mut matrix = Self::default();
        matrix.add("http", "https");
        matrix.add("http", "websocket");
        matrix.add("websocket", "wss");
        matrix
    }

    pub fn add(&mut self, a: &str, b: &str) {
        self.entries.entry(a.to_string()).or_default().insert(b.to_string());
        self.entries.entry(b.to_string()).or_default().insert(a.to_string());
    }

    pub fn remove(&mut self, a: &str, b: &str) {
        if let Some(set) = self.entries.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = self.entries.get_mut(b) {
            set.remove(a);
        }
    }

    pub fn is_compatible(&self, a: &str, b: &str) -> bool {
        a == b || self.entries.get(a).map_or(false, |set| set.contains(b))
    }

    pub fn compatible_with(&self, protocol: &str) -> BTreeSet<String> {
        self.entries.get(protocol).cloned().unwrap_or_default()
    }

    /// Direct compatibility first, then a single intermediate. Chains of two
    /// or more intermediates are never searched.
    pub fn find_bridge(&self, source: &str, target: &str) -> Option<ProtocolBridge> {
        if self.is_compatible(source, target) {
            return Some(ProtocolBridge::Direct);
        }

        self.entries.get(source)?.iter().find_map(|candidate| {
            (candidate != target && self.is_compatible(candidate, target))
                .then(|| ProtocolBridge::Via(candidate.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_entries_are_symmetric() {
        let matrix = CompatibilityMatrix::with_defaults();
        assert_eq!(matrix.find_bridge("https", "http"), Some(ProtocolBridge::Direct));
        assert_eq!(matrix.find_bridge("grpc", "grpc"), Some(ProtocolBridge::Direct));
    }

    #[test]
    fn test_single_intermediate_is_found() {
        let matrix = CompatibilityMatrix::with_defaults();
        assert_eq!(
            matrix.find_bridge("https", "websocket"),
            Some(ProtocolBridge::Via("http".to_string()))
        );
    }

    #[test]
    fn test_two_intermediates_are_not_searched() {
        let matrix = CompatibilityMatrix::with_defaults();
        // https -> http -> websocket -> wss would need two intermediates
        assert_eq!(matrix.find_bridge("https", "wss"), None);
    }

    #[test]
    fn test_removed_entries_stop_bridging() {
        let mut matrix = CompatibilityMatrix::with_defaults();
        matrix.remove("http", "websocket");
        assert_eq!(matrix.find_bridge("http", "websocket"), None);
    }
}
