//! Logical connections from this agent to its peers.

use crate::protocol::{AgentIdentifier, ProtocolHandler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Connections are unique per target agent and protocol.
type ConnectionKey = (String, String);

fn connection_key(target_id: &str, protocol: &str) -> ConnectionKey {
    (target_id.to_string(), protocol.to_string())
}

/// Represents a connection to one peer over one protocol.
pub(crate) struct Connection {
    pub id: String,
    pub target: AgentIdentifier,
    pub protocol: String,
    pub handler: Arc<dyn ProtocolHandler>,
    pub established_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn new(target: AgentIdentifier, protocol: &str, handler: Arc<dyn ProtocolHandler>) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            target,
            protocol: protocol.to_string(),
            handler,
            established_at: Utc::now(),
            last_heartbeat: None,
        }
    }

    /// Updates the heartbeat timestamp.
    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            target_id: self.target.id.clone(),
            protocol: self.protocol.clone(),
            handler_version: self.handler.version().to_string(),
            established_at: self.established_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub target_id: String,
    pub protocol: String,
    pub handler_version: String,
    pub established_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Connections indexed by `(target, protocol)`.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    by_key: HashMap<ConnectionKey, Connection>,
}

impl ConnectionTable {
    pub fn get(&self, target_id: &str, protocol: &str) -> Option<&Connection> {
        self.by_key.get(&connection_key(target_id, protocol))
    }

    pub fn insert(&mut self, connection: Connection) {
        self.by_key
            .insert(connection_key(&connection.target.id, &connection.protocol), connection);
    }

    pub fn remove_by_id(&mut self, id: &str) -> Option<Connection> {
        let key = self
            .by_key
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(k, _)| k.clone())?;
        self.by_key.remove(&key)
    }

    pub fn drain(&mut self) -> Vec<Connection> {
        self.by_key.drain().map(|(_, c)| c).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.by_key.values_mut()
    }

    pub fn infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.by_key.values().map(Connection::info).collect();
        infos.sort_by(|a, b| a.target_id.cmp(&b.target_id).then_with(|| a.protocol.cmp(&b.protocol)));
        infos
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }
}
