//! A2A Core Protocol Implementation
//! Provides agent-to-agent messaging for a Queen/Princess/Drone agent hierarchy:
//! the protocol engine, message router, protocol registry and communication security.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod security;
pub mod transport;

// Re-export commonly used types
pub use config::A2aConfig;
pub use engine::{BroadcastReport, EngineConfig, ProtocolEngine};
pub use error::{Error, Result};
pub use events::{EventBus, EventCategory, ProtocolEvent};
pub use node::AgentNode;
pub use protocol::{A2AMessage, AgentIdentifier, AgentRole, MessageDraft, Payload, ProtocolHandler};
pub use registry::ProtocolRegistry;
pub use routing::{MessageRouter, MessageSender, RouteOutcome, RouterConfig};
pub use security::{SecurityConfig, SecurityManager};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: &str = "1.0.0";
