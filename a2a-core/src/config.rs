//! Aggregated configuration for one agent's protocol stack.
//!
//! Each component owns its config struct; this module ties them together and
//! loads them from TOML. Durations are written as milliseconds.
//!
//! ```toml
//! [engine]
//! agent_id = "queen"
//! max_retries = 3
//! heartbeat_interval = 30000
//!
//! [router.circuit_breaker]
//! failure_threshold = 5
//!
//! [security]
//! enable_perfect_forward_secrecy = true
//! ```

use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::routing::RouterConfig;
use crate::security::SecurityConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct A2aConfig {
    pub engine: EngineConfig,
    pub router: RouterConfig,
    pub security: SecurityConfig,
}

impl A2aConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Rejects periods the background loops and send timeouts cannot run with.
    pub fn validate(&self) -> Result<()> {
        non_zero("engine.heartbeat_interval", self.engine.heartbeat_interval)?;
        non_zero("engine.default_timeout", self.engine.default_timeout)?;
        non_zero("security.key_rotation_interval", self.security.key_rotation_interval)?;
        Ok(())
    }
}

fn non_zero(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::Config(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

/// Serde adapter reading and writing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = A2aConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.router.retry_attempts, 3);
        assert_eq!(config.router.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.security.max_key_age, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_partial_sections_override_defaults() {
        let config = A2aConfig::from_toml_str(
            r#"
            [engine]
            agent_id = "queen"
            enable_encryption = true
            heartbeat_interval = 5000

            [router]
            max_hops = 4

            [router.circuit_breaker]
            recovery_timeout = 1000

            [security]
            enable_perfect_forward_secrecy = true
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.agent_id, "queen");
        assert!(config.engine.enable_encryption);
        assert_eq!(config.engine.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.router.max_hops, 4);
        assert_eq!(config.router.circuit_breaker.recovery_timeout, Duration::from_secs(1));
        assert_eq!(config.router.circuit_breaker.half_open_max_requests, 3);
        assert!(config.security.enable_perfect_forward_secrecy);
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let err = A2aConfig::from_toml_str("[engine\nmax_retries = ").unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }

    #[test]
    fn test_zero_periods_are_rejected() {
        for source in [
            "[engine]\nheartbeat_interval = 0\n",
            "[engine]\ndefault_timeout = 0\n",
            "[security]\nkey_rotation_interval = 0\n",
        ] {
            let err = A2aConfig::from_toml_str(source).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{source}");
        }
        assert!(A2aConfig::default().validate().is_ok());
    }
}
