//! Protocol types module containing the message envelope and identity types.
//!
//! Everything here is plain data. Field names serialize in camelCase and are
//! part of the contract between agents regardless of transport.

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Well-known message types used by the core itself.
pub mod message_types {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const TASK: &str = "task";
    pub const RESPONSE: &str = "response";
    pub const EVENT: &str = "event";
    /// Matches every message type in protocol descriptors.
    pub const WILDCARD: &str = "*";
}

/// Position of an agent in the Queen/Princess/Drone hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Queen,
    Princess,
    Drone,
}

/// Identifies any party in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentifier {
    pub id: String,
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub endpoint: String,
}

impl AgentIdentifier {
    pub fn new(id: impl Into<String>, role: AgentRole, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            domain: None,
            capabilities: BTreeSet::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// True if the two capability sets share at least one entry.
    pub fn shares_capability(&self, other: &BTreeSet<String>) -> bool {
        !self.capabilities.is_disjoint(other)
    }
}

/// How `Payload::data` should be interpreted by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Json,
    Text,
    Binary,
}

/// Opaque message body. Decoding is the consumer's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub encoding: PayloadEncoding,
}

impl Payload {
    /// Serializes `value` as a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            data: serde_json::to_vec(value)?,
            schema: None,
            encoding: PayloadEncoding::Json,
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: text.into().into_bytes(),
            schema: None,
            encoding: PayloadEncoding::Text,
        }
    }

    pub fn binary(data: Vec<u8>) -> Self {
        Self {
            data,
            schema: None,
            encoding: PayloadEncoding::Binary,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub priority: Priority,
    /// Time to live in milliseconds, relative to the message timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    pub retry_count: u32,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Signature block filled in by `SecurityManager::sign_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl SecurityEnvelope {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoutingInfo {
    #[serde(default)]
    pub path: Vec<AgentIdentifier>,
    pub protocol: String,
    #[serde(default)]
    pub flags: BTreeSet<String>,
}

/// Core message envelope exchanged between agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2AMessage {
    /// Unique message identifier
    pub id: String,
    /// Creation time in Unix milliseconds
    pub timestamp: i64,
    pub source: AgentIdentifier,
    pub destination: AgentIdentifier,
    pub message_type: String,
    pub payload: Payload,
    pub metadata: MessageMetadata,
    #[serde(default)]
    pub security: SecurityEnvelope,
    pub routing: RoutingInfo,
}

impl A2AMessage {
    /// Creates a message with a fresh id and timestamp and default metadata.
    pub fn new(
        source: AgentIdentifier,
        destination: AgentIdentifier,
        message_type: impl Into<String>,
        payload: Payload,
        protocol: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            metadata: MessageMetadata {
                priority: Priority::Normal,
                ttl: None,
                retry_count: 0,
                correlation_id: id.clone(),
                conversation_id: None,
            },
            id,
            timestamp: Utc::now().timestamp_millis(),
            source,
            destination,
            message_type: message_type.into(),
            payload,
            security: SecurityEnvelope::default(),
            routing: RoutingInfo {
                path: Vec::new(),
                protocol: protocol.into(),
                flags: BTreeSet::new(),
            },
        }
    }

    /// True once `ttl` milliseconds have passed since `timestamp`.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        match self.metadata.ttl {
            Some(ttl) => now_millis.saturating_sub(self.timestamp) > i64::try_from(ttl).unwrap_or(i64::MAX),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    /// Structural checks every outbound message must pass.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("Message id cannot be empty"));
        }
        if self.source.id.is_empty() {
            return Err(Error::validation("Message source cannot be empty"));
        }
        if self.destination.id.is_empty() {
            return Err(Error::validation("Message destination cannot be empty"));
        }
        if self.message_type.is_empty() {
            return Err(Error::validation("Message type cannot be empty"));
        }
        if self.routing.protocol.is_empty() {
            return Err(Error::validation("Message protocol cannot be empty"));
        }
        if self.is_expired() {
            return Err(Error::validation(format!("Message {} expired", self.id)));
        }
        Ok(())
    }

    /// Serialized form used for signing: the message with its security block cleared.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.security = SecurityEnvelope::default();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The partially filled message accepted by `ProtocolEngine::send`.
///
/// Only the destination is mandatory; the engine fills in the rest.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub id: Option<String>,
    pub source: Option<AgentIdentifier>,
    pub destination: Option<AgentIdentifier>,
    pub message_type: Option<String>,
    pub payload: Payload,
    pub priority: Option<Priority>,
    pub ttl: Option<u64>,
    pub correlation_id: Option<String>,
    pub conversation_id: Option<String>,
    pub protocol: Option<String>,
    pub path: Vec<AgentIdentifier>,
    pub flags: BTreeSet<String>,
}

impl MessageDraft {
    pub fn to(destination: AgentIdentifier) -> Self {
        Self {
            destination: Some(destination),
            ..Default::default()
        }
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn ttl(mut self, ttl_millis: u64) -> Self {
        self.ttl = Some(ttl_millis);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    /// Re-targets the draft, used when fanning one draft out to many recipients.
    pub fn with_destination(&self, destination: AgentIdentifier) -> Self {
        let mut draft = self.clone();
        draft.destination = Some(destination);
        draft.id = None;
        draft
    }

    /// Materializes the draft, filling id, timestamp and defaults.
    pub fn build(self, default_source: &AgentIdentifier, default_protocol: &str) -> Result<A2AMessage> {
        let destination = self
            .destination
            .ok_or_else(|| Error::validation("Message destination is required"))?;
        let source = self.source.unwrap_or_else(|| default_source.clone());
        let protocol = self
            .protocol
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| default_protocol.to_string());
        let message_type = self
            .message_type
            .unwrap_or_else(|| message_types::TASK.to_string());

        let mut message = A2AMessage::new(source, destination, message_type, self.payload, protocol);
        if let Some(id) = self.id {
            message.id = id;
        }
        message.metadata.correlation_id = self.correlation_id.unwrap_or_else(|| message.id.clone());
        message.metadata.priority = self.priority.unwrap_or_default();
        message.metadata.ttl = self.ttl;
        message.metadata.conversation_id = self.conversation_id;
        message.routing.path = self.path;
        message.routing.flags = self.flags;
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queen() -> AgentIdentifier {
        AgentIdentifier::new("queen", AgentRole::Queen, "mem://queen")
    }

    fn drone() -> AgentIdentifier {
        AgentIdentifier::new("drone-1", AgentRole::Drone, "mem://drone-1")
            .with_domain("research")
            .with_capability("search")
    }

    #[test]
    fn test_draft_fills_defaults() {
        let msg = MessageDraft::to(drone())
            .payload(Payload::text("hello"))
            .build(&queen(), "http")
            .unwrap();

        assert_eq!(msg.source.id, "queen");
        assert_eq!(msg.destination.id, "drone-1");
        assert_eq!(msg.message_type, message_types::TASK);
        assert_eq!(msg.routing.protocol, "http");
        assert_eq!(msg.metadata.retry_count, 0);
        assert_eq!(msg.metadata.correlation_id, msg.id);
        assert!(!msg.security.is_signed());
    }

    #[test]
    fn test_draft_without_destination_is_rejected() {
        let err = MessageDraft::default().build(&queen(), "http").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = A2AMessage::new(queen(), drone(), "task", Payload::default(), "http");
        let b = A2AMessage::new(queen(), drone(), "task", Payload::default(), "http");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut msg = A2AMessage::new(queen(), drone(), "task", Payload::default(), "http");
        msg.metadata.ttl = Some(1_000);
        assert!(!msg.is_expired_at(msg.timestamp + 500));
        assert!(msg.is_expired_at(msg.timestamp + 1_001));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let mut msg = A2AMessage::new(queen(), drone(), "task", Payload::default(), "http");
        msg.metadata.ttl = Some(u64::MAX);
        assert!(!msg.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let msg = A2AMessage::new(queen(), drone(), "task", Payload::text("x"), "http");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("messageType").is_some());
        assert!(json["metadata"].get("retryCount").is_some());
        assert!(json["metadata"].get("correlationId").is_some());
        assert_eq!(json["destination"]["role"], "drone");
    }

    #[test]
    fn test_canonical_bytes_ignore_security_block() {
        let mut msg = A2AMessage::new(queen(), drone(), "task", Payload::text("x"), "http");
        let before = msg.canonical_bytes().unwrap();
        msg.security.signature = Some("sig".into());
        msg.security.nonce = Some("nonce".into());
        assert_eq!(before, msg.canonical_bytes().unwrap());
    }
}
