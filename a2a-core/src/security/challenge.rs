//! Single-use authentication challenges.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use super::keys::SIGNING_ALGORITHM;

pub const CHALLENGE_LEN: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationChallenge {
    pub id: String,
    /// Agent expected to answer
    pub agent_id: String,
    pub challenge: Vec<u8>,
    pub algorithm: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthenticationChallenge {
    pub fn generate(agent_id: &str, ttl: Duration, rng: &SystemRandom) -> Result<Self> {
        let mut challenge = vec![0u8; CHALLENGE_LEN];
        rng.fill(&mut challenge)
            .map_err(|_| Error::security("Failed to generate challenge"))?;

        let timestamp = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::security(format!("Invalid challenge ttl: {}", e)))?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            challenge,
            algorithm: SIGNING_ALGORITHM.to_string(),
            timestamp,
            expires_at: timestamp + ttl,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
