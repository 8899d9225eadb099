//! Error handling for the A2A protocol core.
//!
//! This module provides a centralized error type and result alias for all
//! engine, router, registry and security operations. The variants follow the
//! failure taxonomy the core reacts to: validation and security failures are
//! hard rejections, transport failures and timeouts are retried, and an open
//! circuit fails fast without touching a handler.
//!
//! # Examples
//!
//! ```rust
//! use a2a_core::error::{Error, Result};
//!
//! fn validate_agent_id(id: &str) -> Result<()> {
//!     if id.is_empty() {
//!         return Err(Error::validation("Agent ID cannot be empty"));
//!     }
//!     Ok(())
//! }
//! ```

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for A2A operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed message, missing destination, expired ttl
    #[error("Validation error: {0}")]
    Validation(String),

    /// The registry could not resolve a transport handler
    #[error("No handler: {0}")]
    NoHandler(String),

    /// The handler rejected the send
    #[error("Transport error: {0}")]
    Transport(String),

    /// A handler call did not complete within the configured timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker for the route is open
    #[error("Circuit open: {source_id} -> {destination_id}")]
    CircuitOpen {
        source_id: String,
        destination_id: String,
    },

    /// Signature, key or decryption failures
    #[error("Security error: {0}")]
    Security(String),

    /// Registration conflicts and unknown protocol versions
    #[error("Registry error: {0}")]
    Registry(String),

    /// Path resolution and forwarding failures
    #[error("Routing error: {0}")]
    Routing(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration loading errors
    #[error("Config error: {0}")]
    Config(String),

    /// I/O operation failures
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The operation was cancelled by the caller or by shutdown
    #[error("Operation cancelled")]
    Cancelled,
}

/// Convenience type alias for Results with A2A errors.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new validation error with the given message.
    ///
    /// # Examples
    /// ```
    /// use a2a_core::error::Error;
    ///
    /// let err = Error::validation("Missing destination");
    /// ```
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Creates a new no-handler error with the given message.
    pub fn no_handler(msg: impl Into<String>) -> Self {
        Error::NoHandler(msg.into())
    }

    /// Creates a new transport error with the given message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new security error with the given message.
    ///
    /// # Examples
    /// ```
    /// use a2a_core::error::Error;
    ///
    /// let err = Error::security("Key revoked");
    /// ```
    pub fn security(msg: impl Into<String>) -> Self {
        Error::Security(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Error::Registry(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Error::Routing(msg.into())
    }

    pub fn circuit_open(source_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        Error::CircuitOpen {
            source_id: source_id.into(),
            destination_id: destination_id.into(),
        }
    }

    /// Whether a retry with backoff may succeed where this attempt failed.
    ///
    /// Only transport failures and timeouts qualify; everything else is a
    /// property of the message or route and would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
