mod stream;
mod types;

pub use stream::{channel_stream, merge_streams, MessageStream};
pub use types::*;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Observed or declared performance of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Average send latency in milliseconds
    pub avg_latency: f64,
    /// Messages per second
    pub throughput: f64,
    /// Fraction of successful sends in [0, 1]
    pub reliability: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            avg_latency: 100.0,
            throughput: 100.0,
            reliability: 0.95,
        }
    }
}

/// What a handler declares about itself at registration time.
#[derive(Debug, Clone, Default)]
pub struct HandlerProfile {
    /// Empty means every message type
    pub supported_message_types: Vec<String>,
    /// Empty means no requirement on the target
    pub required_capabilities: BTreeSet<String>,
    pub performance: PerformanceMetrics,
}

/// Contract every transport must satisfy.
///
/// The engine and router only ever talk to transports through this trait.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Protocol family, e.g. `http`
    fn name(&self) -> &str;

    /// Dot-separated numeric version, e.g. `1.2`
    fn version(&self) -> &str;

    /// Optional self-description; the registry falls back to wildcard support
    fn profile(&self) -> Option<HandlerProfile> {
        None
    }

    /// Whether this handler can carry the given message
    fn can_handle(&self, message: &A2AMessage) -> bool;

    /// Transport-level send
    async fn send(&self, message: &A2AMessage) -> Result<()>;

    /// Lazy sequence of inbound messages
    fn receive(&self) -> MessageStream;

    /// Releases transport resources
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    struct NullHandler;

    #[async_trait]
    impl ProtocolHandler for NullHandler {
        fn name(&self) -> &str {
            "null"
        }

        fn version(&self) -> &str {
            "1.0"
        }

        fn can_handle(&self, _message: &A2AMessage) -> bool {
            true
        }

        async fn send(&self, _message: &A2AMessage) -> Result<()> {
            Ok(())
        }

        fn receive(&self) -> MessageStream {
            Box::pin(stream::empty())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_profile_is_absent() {
        let handler = NullHandler;
        assert!(handler.profile().is_none());
        assert_eq!(handler.receive().count().await, 0);
    }
}
