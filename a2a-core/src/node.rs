//! One agent's assembled protocol stack.

use crate::config::A2aConfig;
use crate::engine::ProtocolEngine;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::protocol::{AgentIdentifier, AgentRole, ProtocolHandler};
use crate::registry::{ProtocolDescriptor, ProtocolRegistry};
use crate::routing::MessageRouter;
use crate::security::{PublicKeyInfo, SecurityLevel, SecurityManager};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Offline,
    Online,
    Stopped,
}

/// Security level an agent gets by its place in the hierarchy.
pub fn default_security_level(role: AgentRole) -> SecurityLevel {
    match role {
        AgentRole::Queen => SecurityLevel::High,
        AgentRole::Princess => SecurityLevel::Standard,
        AgentRole::Drone => SecurityLevel::Standard,
    }
}

pub struct AgentNode {
    identity: AgentIdentifier,
    config: A2aConfig,
    events: EventBus,
    security: Arc<SecurityManager>,
    registry: Arc<ProtocolRegistry>,
    engine: Arc<ProtocolEngine>,
    router: Arc<MessageRouter>,
    status: RwLock<NodeStatus>,
}

impl AgentNode {
    /// Builds a node with its own security manager.
    pub async fn new(identity: AgentIdentifier, config: A2aConfig) -> Result<Self> {
        let events = EventBus::default();
        let security = Arc::new(SecurityManager::new(config.security.clone(), events.clone()));
        Self::assemble(identity, config, security, events).await
    }

    /// Builds a node whose keys live in a manager shared with other in-process nodes.
    pub async fn with_security(
        identity: AgentIdentifier,
        config: A2aConfig,
        security: Arc<SecurityManager>,
    ) -> Result<Self> {
        Self::assemble(identity, config, security, EventBus::default()).await
    }

    async fn assemble(
        identity: AgentIdentifier,
        mut config: A2aConfig,
        security: Arc<SecurityManager>,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        if config.engine.agent_id.is_empty() {
            config.engine.agent_id = identity.id.clone();
        } else if config.engine.agent_id != identity.id {
            return Err(Error::validation(format!(
                "Configured agent id {} does not match identity {}",
                config.engine.agent_id, identity.id
            )));
        }

        security
            .register_agent(&identity.id, default_security_level(identity.role))
            .await?;

        let registry = Arc::new(ProtocolRegistry::new());
        let engine = Arc::new(ProtocolEngine::new(
            config.engine.clone(),
            identity.clone(),
            registry.clone(),
            security.clone(),
            events.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            config.router.clone(),
            engine.clone(),
            registry.clone(),
            events.clone(),
        ));

        Ok(Self {
            identity,
            config,
            events,
            security,
            registry,
            engine,
            router,
            status: RwLock::new(NodeStatus::Offline),
        })
    }

    pub async fn register_protocol(&self, handler: Arc<dyn ProtocolHandler>) -> Result<ProtocolDescriptor> {
        self.registry.register(handler).await
    }

    /// Starts the heartbeat and key rotation loops.
    pub async fn start(&self) -> Result<()> {
        let mut status = self.status.write().await;
        if *status == NodeStatus::Stopped {
            return Err(Error::validation(format!("Node {} was shut down", self.identity.id)));
        }
        self.engine.start_heartbeat();
        self.security.start_key_rotation();
        *status = NodeStatus::Online;
        info!(agent_id = %self.identity.id, role = ?self.identity.role, "Agent node online");
        Ok(())
    }

    /// Stops every component. A shared security manager is left running.
    pub async fn shutdown(&self, shutdown_security: bool) {
        self.router.shutdown();
        self.engine.shutdown().await;
        self.registry.shutdown().await;
        if shutdown_security {
            self.security.shutdown().await;
        }
        *self.status.write().await = NodeStatus::Stopped;
        info!(agent_id = %self.identity.id, "Agent node stopped");
    }

    pub async fn status(&self) -> NodeStatus {
        *self.status.read().await
    }

    pub fn identity(&self) -> &AgentIdentifier {
        &self.identity
    }

    pub fn config(&self) -> &A2aConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    /// The key peers import to verify this node's messages.
    pub async fn public_key(&self) -> Option<PublicKeyInfo> {
        self.security.public_key(&self.identity.id).await
    }

    /// Imports a peer's published key and adds the peer to this node's trusted senders.
    ///
    /// Once a node trusts any peer, messages from agents it does not trust fail verification.
    pub async fn trust_peer(&self, key: PublicKeyInfo) -> Result<()> {
        let context = self.security.import_peer_key(key).await?;
        self.security.trust_agent(&self.identity.id, &context.agent_id).await?;
        info!(agent_id = %self.identity.id, peer = %context.agent_id, "Trusting peer");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageDraft, Payload};
    use crate::transport::MemoryHandler;

    fn queen() -> AgentIdentifier {
        AgentIdentifier::new("queen", AgentRole::Queen, "mem://queen")
    }

    #[tokio::test]
    async fn test_node_lifecycle() {
        let node = AgentNode::new(queen(), A2aConfig::default()).await.unwrap();
        assert_eq!(node.config().engine.agent_id, "queen");
        assert_eq!(node.status().await, NodeStatus::Offline);
        assert_eq!(
            node.security().context("queen").await.map(|c| c.security_level),
            Some(SecurityLevel::High)
        );

        let http = Arc::new(MemoryHandler::new("http", "1.1"));
        node.register_protocol(http.clone()).await.unwrap();
        node.start().await.unwrap();
        assert_eq!(node.status().await, NodeStatus::Online);

        let drone = AgentIdentifier::new("drone-1", AgentRole::Drone, "mem://drone-1");
        node.engine()
            .send(MessageDraft::to(drone).payload(Payload::text("report")))
            .await
            .unwrap();
        assert_eq!(http.attempt_count().await, 1);

        node.shutdown(true).await;
        assert_eq!(node.status().await, NodeStatus::Stopped);
        assert!(http.is_disconnected());
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_zero_interval_config_is_rejected() {
        let mut config = A2aConfig::default();
        config.engine.heartbeat_interval = std::time::Duration::ZERO;
        assert!(matches!(
            AgentNode::new(queen(), config).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_trust_peer_imports_and_trusts() {
        let node = AgentNode::new(queen(), A2aConfig::default()).await.unwrap();
        let drone_id = AgentIdentifier::new("drone-1", AgentRole::Drone, "mem://drone-1");
        let drone = AgentNode::new(drone_id, A2aConfig::default()).await.unwrap();

        node.trust_peer(drone.public_key().await.unwrap()).await.unwrap();

        let peer = node.security().context("drone-1").await.unwrap();
        assert!(peer.imported);
        let own = node.security().context("queen").await.unwrap();
        assert!(own.trusted_agents.contains("drone-1"));
    }

    #[tokio::test]
    async fn test_mismatched_agent_id_is_rejected() {
        let mut config = A2aConfig::default();
        config.engine.agent_id = "princess".into();
        assert!(matches!(
            AgentNode::new(queen(), config).await,
            Err(Error::Validation(_))
        ));
    }
}
