//! Security module provides identity, integrity and confidentiality for A2A.
//!
//! This module handles:
//! - Agent registration and key issuance
//! - Message signing and verification
//! - Payload encryption/decryption
//! - Challenge-response authentication
//! - Peer key import and trust
//! - Key rotation and revocation
//! - The security audit trail

mod audit;
mod challenge;
mod cipher;
mod keys;

pub use audit::{AuditAction, AuditEntry, AuditLog, Severity, DEFAULT_AUDIT_CAPACITY};
pub use challenge::AuthenticationChallenge;
pub use cipher::{EncryptedPayload, SealedBox, CIPHER_ALGORITHM};
pub use keys::{verify_signature, KeyPair, PublicKeyInfo, AGREEMENT_ALGORITHM, SIGNING_ALGORITHM};

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::events::{EventBus, ProtocolEvent};
use crate::protocol::{A2AMessage, Payload};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NONCE_LEN: usize = 16;

/// Security configuration for an agent's stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_encryption: bool,
    pub enable_signatures: bool,
    #[serde(with = "duration_ms")]
    pub key_rotation_interval: Duration,
    #[serde(with = "duration_ms")]
    pub max_key_age: Duration,
    pub enable_perfect_forward_secrecy: bool,
    /// Require senders to have completed the challenge flow before their messages verify
    pub enable_mutual_authentication: bool,
    /// Revoke the old key when rotating; otherwise it keeps verifying until revoked
    pub revoke_on_rotation: bool,
    #[serde(with = "duration_ms")]
    pub challenge_ttl: Duration,
    pub audit_capacity: usize,
    /// How long a revoked key is remembered before it is forgotten entirely
    #[serde(with = "duration_ms")]
    pub revoked_key_retention: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_encryption: true,
            enable_signatures: true,
            key_rotation_interval: Duration::from_secs(60 * 60),
            max_key_age: Duration::from_secs(24 * 60 * 60),
            enable_perfect_forward_secrecy: false,
            enable_mutual_authentication: false,
            revoke_on_rotation: true,
            challenge_ttl: Duration::from_secs(5 * 60),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            revoked_key_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Standard,
    High,
}

/// Per-agent security state. Holds key ids only; key material stays in the manager.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub agent_id: String,
    pub session_id: String,
    pub active_key_id: String,
    /// Keys this manager still holds for the agent, oldest first
    pub keys: Vec<String>,
    /// Senders this agent accepts messages from. Empty accepts any known sender.
    pub trusted_agents: BTreeSet<String>,
    pub security_level: SecurityLevel,
    /// Built from a peer's published key; verify and encrypt only
    pub imported: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revocation {
    pub key_id: String,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotation {
    pub agent_id: String,
    pub old_key_id: String,
    pub new_key_id: String,
}

#[derive(Default)]
struct KeyStore {
    contexts: HashMap<String, SecurityContext>,
    keys: HashMap<String, KeyPair>,
    revoked: HashMap<String, Revocation>,
}

impl KeyStore {
    fn active_key(&self, agent_id: &str) -> Option<&KeyPair> {
        let context = self.contexts.get(agent_id)?;
        self.keys.get(&context.active_key_id)
    }

    fn is_revoked(&self, key_id: &str) -> bool {
        self.revoked.contains_key(key_id)
    }
}

/// Outcome of a verification, kept separate so auditing happens once per check.
enum Verdict {
    Valid { key_id: String },
    Rejected { reason: String, severity: Severity, key_id: Option<String> },
}

/// Manages identity and cryptographic operations for every agent registered with it.
pub struct SecurityManager {
    config: SecurityConfig,
    rng: SystemRandom,
    store: RwLock<KeyStore>,
    challenges: RwLock<HashMap<String, AuthenticationChallenge>>,
    authenticated: RwLock<HashSet<String>>,
    audit: RwLock<AuditLog>,
    events: EventBus,
    shutdown: CancellationToken,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl SecurityManager {
    /// Creates a new security manager with the given configuration.
    pub fn new(config: SecurityConfig, events: EventBus) -> Self {
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            config,
            rng: SystemRandom::new(),
            store: RwLock::new(KeyStore::default()),
            challenges: RwLock::new(HashMap::new()),
            authenticated: RwLock::new(HashSet::new()),
            audit: RwLock::new(audit),
            events,
            shutdown: CancellationToken::new(),
            rotation_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Creates the agent's security context and its first key pair.
    ///
    /// Registering an agent twice returns the existing context.
    pub async fn register_agent(&self, agent_id: &str, level: SecurityLevel) -> Result<SecurityContext> {
        if agent_id.is_empty() {
            return Err(Error::validation("Agent ID cannot be empty"));
        }

        let context = {
            let mut store = self.store.write().await;
            if let Some(existing) = store.contexts.get(agent_id) {
                if existing.imported {
                    return Err(Error::security(format!("Agent {} is a known peer, not a local agent", agent_id)));
                }
                debug!(agent_id, "Agent already registered");
                return Ok(existing.clone());
            }

            let key = KeyPair::generate(agent_id, self.config.max_key_age, &self.rng)?;
            let context = SecurityContext {
                agent_id: agent_id.to_string(),
                session_id: Uuid::new_v4().to_string(),
                active_key_id: key.id.clone(),
                keys: vec![key.id.clone()],
                trusted_agents: BTreeSet::new(),
                security_level: level,
                imported: false,
            };
            store.keys.insert(key.id.clone(), key);
            store.contexts.insert(agent_id.to_string(), context.clone());
            context
        };

        info!(agent_id, key_id = %context.active_key_id, "Registered agent security context");
        self.record(
            AuditEntry::new(AuditAction::Registration, Severity::Info, true, "agent registered")
                .agent(agent_id)
                .key(&context.active_key_id),
        )
        .await;
        Ok(context)
    }

    /// Revokes every key of the agent and forgets its context.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let context = self
            .store
            .read()
            .await
            .contexts
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::security(format!("Agent {} is not registered", agent_id)))?;

        for key_id in &context.keys {
            self.revoke_key(key_id, "agent unregistered").await;
        }
        self.store.write().await.contexts.remove(agent_id);
        self.authenticated.write().await.remove(agent_id);
        Ok(())
    }

    pub async fn context(&self, agent_id: &str) -> Option<SecurityContext> {
        self.store.read().await.contexts.get(agent_id).cloned()
    }

    pub async fn public_key(&self, agent_id: &str) -> Option<PublicKeyInfo> {
        self.store.read().await.active_key(agent_id).map(KeyPair::public_info)
    }

    pub async fn trust_agent(&self, agent_id: &str, peer_id: &str) -> Result<()> {
        let mut store = self.store.write().await;
        let context = store
            .contexts
            .get_mut(agent_id)
            .ok_or_else(|| Error::security(format!("Agent {} is not registered", agent_id)))?;
        context.trusted_agents.insert(peer_id.to_string());
        Ok(())
    }

    /// Imports a key another manager published so its owner's messages verify here.
    ///
    /// The owner gets a verify-only context. A newer key becomes its active key,
    /// older keys are kept to verify messages signed before a rotation.
    pub async fn import_peer_key(&self, info: PublicKeyInfo) -> Result<SecurityContext> {
        let key = KeyPair::from_public(&info)?;
        let key_id = key.id.clone();
        let owner = key.owner.clone();

        let context = {
            let mut store = self.store.write().await;
            if store.is_revoked(&key_id) {
                return Err(Error::security(format!("Key {} is revoked", key_id)));
            }
            if let Some(existing) = store.keys.get(&key_id) {
                if existing.owner != owner
                    || existing.public_key != key.public_key
                    || existing.agreement_public_key != key.agreement_public_key
                {
                    return Err(Error::security(format!("Key {} is already known with other material", key_id)));
                }
            }
            if store.contexts.get(&owner).is_some_and(|c| !c.imported) {
                return Err(Error::security(format!("Agent {} is registered locally", owner)));
            }

            let replaces_active = store
                .active_key(&owner)
                .map_or(true, |active| key.created_at > active.created_at);
            let context = store.contexts.entry(owner.clone()).or_insert_with(|| SecurityContext {
                agent_id: owner.clone(),
                session_id: Uuid::new_v4().to_string(),
                active_key_id: key_id.clone(),
                keys: Vec::new(),
                trusted_agents: BTreeSet::new(),
                security_level: SecurityLevel::Standard,
                imported: true,
            });
            if !context.keys.contains(&key_id) {
                context.keys.push(key_id.clone());
            }
            if replaces_active {
                context.active_key_id = key_id.clone();
            }
            let context = context.clone();
            store.keys.insert(key_id.clone(), key);
            context
        };

        info!(agent_id = %owner, key_id = %key_id, "Imported peer key");
        self.record(
            AuditEntry::new(AuditAction::Registration, Severity::Info, true, "peer key imported")
                .agent(&owner)
                .key(&key_id),
        )
        .await;
        Ok(context)
    }

    /// Signs the message with its source agent's active key.
    ///
    /// The signature covers the canonical message, a fresh nonce and the
    /// signing timestamp.
    pub async fn sign_message(&self, mut message: A2AMessage) -> Result<A2AMessage> {
        if !self.config.enable_signatures {
            return Ok(message);
        }

        let agent_id = message.source.id.clone();
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| Error::security("Failed to generate nonce"))?;
        let nonce = BASE64.encode(nonce);
        let timestamp = Utc::now().timestamp_millis();

        let signed = {
            let store = self.store.read().await;
            let key = store
                .active_key(&agent_id)
                .ok_or_else(|| Error::security(format!("No security context for agent {}", agent_id)))?;
            if store.is_revoked(&key.id) {
                Err(Error::security(format!("Active key {} is revoked", key.id)))
            } else if key.is_expired_at(Utc::now()) {
                Err(Error::security(format!("Active key {} has expired", key.id)))
            } else {
                let data = signing_input(&message, &nonce, timestamp)?;
                key.sign(&data).map(|signature| (key.id.clone(), key.algorithm.clone(), signature))
            }
        };

        match signed {
            Ok((key_id, algorithm, signature)) => {
                message.security.signature = Some(BASE64.encode(signature));
                message.security.key_id = Some(key_id.clone());
                message.security.algorithm = Some(algorithm);
                message.security.timestamp = Some(timestamp);
                message.security.nonce = Some(nonce);
                self.record(
                    AuditEntry::new(AuditAction::Sign, Severity::Info, true, format!("signed {}", message.id))
                        .agent(&agent_id)
                        .key(key_id),
                )
                .await;
                Ok(message)
            }
            Err(e) => {
                self.record(
                    AuditEntry::new(AuditAction::Sign, Severity::Warning, false, e.to_string()).agent(&agent_id),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Checks the message signature. Never errors; every outcome is audited.
    pub async fn verify_message(&self, message: &A2AMessage) -> bool {
        if !self.config.enable_signatures {
            return true;
        }

        let verdict = self.judge(message).await;
        let agent_id = message.source.id.clone();
        match verdict {
            Verdict::Valid { key_id } => {
                self.record(
                    AuditEntry::new(AuditAction::Verify, Severity::Info, true, format!("verified {}", message.id))
                        .agent(agent_id)
                        .key(key_id),
                )
                .await;
                true
            }
            Verdict::Rejected { reason, severity, key_id } => {
                warn!(message_id = %message.id, agent_id = %agent_id, reason = %reason, "Message verification failed");
                let mut entry = AuditEntry::new(AuditAction::Verify, severity, false, reason).agent(agent_id);
                if let Some(key_id) = key_id {
                    entry = entry.key(key_id);
                }
                self.record(entry).await;
                false
            }
        }
    }

    async fn judge(&self, message: &A2AMessage) -> Verdict {
        let rejected = |reason: &str, severity: Severity, key_id: Option<String>| Verdict::Rejected {
            reason: reason.to_string(),
            severity,
            key_id,
        };

        let security = &message.security;
        let (signature, key_id, nonce, timestamp) = match (
            security.signature.as_deref(),
            security.key_id.as_deref(),
            security.nonce.as_deref(),
            security.timestamp,
        ) {
            (Some(s), Some(k), Some(n), Some(t)) => (s, k, n, t),
            _ => return rejected("signature missing", Severity::Warning, None),
        };
        let key_id_owned = Some(key_id.to_string());

        if self.config.enable_mutual_authentication
            && !self.authenticated.read().await.contains(&message.source.id)
        {
            return rejected("sender has not authenticated", Severity::Warning, key_id_owned);
        }

        let store = self.store.read().await;
        if !store.contexts.contains_key(&message.source.id) {
            return rejected("sender has no security context", Severity::Warning, key_id_owned);
        }
        if let Some(recipient) = store.contexts.get(&message.destination.id) {
            if !recipient.trusted_agents.is_empty() && !recipient.trusted_agents.contains(&message.source.id) {
                return rejected("sender not trusted by recipient", Severity::Warning, key_id_owned);
            }
        }
        if store.is_revoked(key_id) {
            return rejected("key revoked", Severity::Critical, key_id_owned);
        }
        let key = match store.keys.get(key_id) {
            Some(key) => key,
            None => return rejected("unknown key", Severity::Warning, key_id_owned),
        };
        if key.owner != message.source.id {
            return rejected("key not owned by sender", Severity::Critical, key_id_owned);
        }
        if key.is_expired_at(Utc::now()) {
            return rejected("key expired", Severity::Warning, key_id_owned);
        }

        let signature = match BASE64.decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return rejected("malformed signature", Severity::Warning, key_id_owned),
        };
        let data = match signing_input(message, nonce, timestamp) {
            Ok(data) => data,
            Err(_) => return rejected("message not serializable", Severity::Warning, key_id_owned),
        };

        if key.verify(&data, &signature) {
            Verdict::Valid {
                key_id: key_id.to_string(),
            }
        } else {
            rejected("signature mismatch", Severity::Critical, key_id_owned)
        }
    }

    /// Encrypts the message payload for its destination agent.
    pub async fn encrypt_message(&self, message: &A2AMessage) -> Result<EncryptedPayload> {
        let recipient = message.destination.id.clone();
        let result = self.seal_payload(message).await;
        match &result {
            Ok(encrypted) => {
                self.record(
                    AuditEntry::new(
                        AuditAction::Encrypt,
                        Severity::Info,
                        true,
                        format!("encrypted {} (pfs: {})", message.id, encrypted.is_forward_secret()),
                    )
                    .agent(recipient)
                    .key(&encrypted.key_id),
                )
                .await
            }
            Err(e) => {
                self.record(
                    AuditEntry::new(AuditAction::Encrypt, Severity::Warning, false, e.to_string()).agent(recipient),
                )
                .await
            }
        }
        result
    }

    async fn seal_payload(&self, message: &A2AMessage) -> Result<EncryptedPayload> {
        if !self.config.enable_encryption {
            return Err(Error::security("Encryption is disabled"));
        }
        let plaintext = serde_json::to_vec(&message.payload)?;
        let aad = message.id.as_bytes();

        let store = self.store.read().await;
        let key = store.active_key(&message.destination.id).ok_or_else(|| {
            Error::security(format!("No security context for agent {}", message.destination.id))
        })?;
        if store.is_revoked(&key.id) {
            return Err(Error::security(format!("Key {} is revoked", key.id)));
        }
        if key.is_expired_at(Utc::now()) {
            return Err(Error::security(format!("Key {} has expired", key.id)));
        }

        let (content_key, ephemeral_public_key) = if self.config.enable_perfect_forward_secrecy {
            let (content_key, ephemeral) = cipher::ephemeral_content_key(key, &self.rng)?;
            (content_key, Some(ephemeral))
        } else {
            (cipher::static_content_key(key)?, None)
        };
        let sealed = cipher::seal(&content_key, &self.rng, aad, &plaintext)?;

        Ok(EncryptedPayload {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            tag: sealed.tag,
            key_id: key.id.clone(),
            algorithm: CIPHER_ALGORITHM.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            message_id: message.id.clone(),
            ephemeral_public_key,
        })
    }

    /// Recovers the payload. Fails on unknown or revoked keys and on any authentication failure.
    pub async fn decrypt_message(&self, encrypted: &EncryptedPayload) -> Result<Payload> {
        let result = self.open_payload(encrypted).await;
        let entry = match &result {
            Ok(_) => AuditEntry::new(
                AuditAction::Decrypt,
                Severity::Info,
                true,
                format!("decrypted {}", encrypted.message_id),
            ),
            Err(e) => AuditEntry::new(AuditAction::Decrypt, Severity::Critical, false, e.to_string()),
        };
        self.record(entry.key(&encrypted.key_id)).await;
        result
    }

    async fn open_payload(&self, encrypted: &EncryptedPayload) -> Result<Payload> {
        if encrypted.algorithm != CIPHER_ALGORITHM {
            return Err(Error::security(format!("Unsupported algorithm {}", encrypted.algorithm)));
        }

        let store = self.store.read().await;
        if store.is_revoked(&encrypted.key_id) {
            return Err(Error::security(format!("Key {} is revoked", encrypted.key_id)));
        }
        let key = store
            .keys
            .get(&encrypted.key_id)
            .ok_or_else(|| Error::security(format!("Unknown key {}", encrypted.key_id)))?;
        if !key.has_secrets() {
            return Err(Error::security(format!("Key {} is not held by this manager", key.id)));
        }

        let content_key = match &encrypted.ephemeral_public_key {
            Some(ephemeral) => cipher::recipient_content_key(key, ephemeral)?,
            None => cipher::static_content_key(key)?,
        };

        let plaintext = cipher::open(
            &content_key,
            encrypted.message_id.as_bytes(),
            &encrypted.ciphertext,
            &encrypted.iv,
            &encrypted.tag,
        )?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::security(format!("Decrypted payload is malformed: {}", e)))
    }

    /// Issues a single-use challenge for the agent.
    pub async fn generate_challenge(&self, agent_id: &str) -> Result<AuthenticationChallenge> {
        if !self.store.read().await.contexts.contains_key(agent_id) {
            return Err(Error::security(format!("Agent {} is not registered", agent_id)));
        }

        let challenge = AuthenticationChallenge::generate(agent_id, self.config.challenge_ttl, &self.rng)?;
        self.challenges
            .write()
            .await
            .insert(challenge.id.clone(), challenge.clone());
        self.record(
            AuditEntry::new(AuditAction::Challenge, Severity::Info, true, format!("issued {}", challenge.id))
                .agent(agent_id),
        )
        .await;
        Ok(challenge)
    }

    /// Answers a challenge with the agent's active key. Returns the base64 signature.
    pub async fn sign_challenge(&self, agent_id: &str, challenge: &[u8]) -> Result<String> {
        let store = self.store.read().await;
        let key = store
            .active_key(agent_id)
            .ok_or_else(|| Error::security(format!("No security context for agent {}", agent_id)))?;
        Ok(BASE64.encode(key.sign(challenge)?))
    }

    /// Verifies a challenge response. A successful answer consumes the challenge.
    pub async fn authenticate_agent(&self, agent_id: &str, challenge_id: &str, signature: &str) -> bool {
        let outcome = self.check_challenge(agent_id, challenge_id, signature).await;
        match outcome {
            Ok(()) => {
                self.challenges.write().await.remove(challenge_id);
                self.authenticated.write().await.insert(agent_id.to_string());
                info!(agent_id, "Agent authenticated");
                self.record(
                    AuditEntry::new(AuditAction::Authentication, Severity::Info, true, "challenge answered")
                        .agent(agent_id),
                )
                .await;
                self.events.emit(ProtocolEvent::AuthenticationSucceeded {
                    agent_id: agent_id.to_string(),
                });
                true
            }
            Err(reason) => {
                warn!(agent_id, reason = %reason, "Agent authentication failed");
                self.record(
                    AuditEntry::new(AuditAction::Authentication, Severity::Warning, false, reason.clone())
                        .agent(agent_id),
                )
                .await;
                self.events.emit(ProtocolEvent::AuthenticationFailed {
                    agent_id: agent_id.to_string(),
                    reason,
                });
                false
            }
        }
    }

    async fn check_challenge(
        &self,
        agent_id: &str,
        challenge_id: &str,
        signature: &str,
    ) -> std::result::Result<(), String> {
        let challenge = self
            .challenges
            .read()
            .await
            .get(challenge_id)
            .cloned()
            .ok_or_else(|| "unknown or already used challenge".to_string())?;

        if challenge.agent_id != agent_id {
            return Err("challenge issued to another agent".to_string());
        }
        if challenge.is_expired_at(Utc::now()) {
            self.challenges.write().await.remove(challenge_id);
            return Err("challenge expired".to_string());
        }

        let signature = BASE64
            .decode(signature)
            .map_err(|_| "malformed signature".to_string())?;
        let store = self.store.read().await;
        let key = store
            .active_key(agent_id)
            .ok_or_else(|| "agent has no security context".to_string())?;
        if store.is_revoked(&key.id) {
            return Err("agent key revoked".to_string());
        }
        if !key.verify(&challenge.challenge, &signature) {
            return Err("signature mismatch".to_string());
        }
        Ok(())
    }

    pub async fn is_authenticated(&self, agent_id: &str) -> bool {
        self.authenticated.read().await.contains(agent_id)
    }

    /// Adds the key id to the global revocation set and drops its private material. Idempotent.
    pub async fn revoke_key(&self, key_id: &str, reason: &str) {
        {
            let mut store = self.store.write().await;
            if store.is_revoked(key_id) {
                return;
            }
            if let Some(key) = store.keys.get_mut(key_id) {
                key.discard_secrets();
            }
            store.revoked.insert(
                key_id.to_string(),
                Revocation {
                    key_id: key_id.to_string(),
                    reason: reason.to_string(),
                    revoked_at: Utc::now(),
                },
            );
        }

        warn!(key_id, reason, "Key revoked");
        self.record(AuditEntry::new(AuditAction::Revoke, Severity::Warning, true, reason).key(key_id))
            .await;
        self.events.emit(ProtocolEvent::KeyRevoked {
            key_id: key_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub async fn is_revoked(&self, key_id: &str) -> bool {
        self.store.read().await.is_revoked(key_id)
    }

    pub async fn revocations(&self) -> Vec<Revocation> {
        self.store.read().await.revoked.values().cloned().collect()
    }

    /// Forgets keys revoked longer than `revoked_key_retention` ago. Active keys are kept.
    ///
    /// A forgotten key is unknown afterwards, so its signatures still fail.
    pub async fn prune_revoked_keys(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.config.revoked_key_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let mut store = self.store.write().await;
        let active: HashSet<String> = store.contexts.values().map(|c| c.active_key_id.clone()).collect();
        let expired: Vec<String> = store
            .revoked
            .values()
            .filter(|r| r.revoked_at <= cutoff && !active.contains(&r.key_id))
            .map(|r| r.key_id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        for key_id in &expired {
            store.keys.remove(key_id);
            store.revoked.remove(key_id);
        }
        for context in store.contexts.values_mut() {
            context.keys.retain(|id| !expired.contains(id));
        }
        debug!(pruned = expired.len(), "Pruned revoked keys");
        expired.len()
    }

    /// Issues a new active key for a local agent. Peers rotate their own keys.
    pub async fn rotate_agent_key(&self, agent_id: &str) -> Result<KeyRotation> {
        let new_key = KeyPair::generate(agent_id, self.config.max_key_age, &self.rng)?;
        let rotation = {
            let mut store = self.store.write().await;
            let context = store
                .contexts
                .get_mut(agent_id)
                .ok_or_else(|| Error::security(format!("Agent {} is not registered", agent_id)))?;
            if context.imported {
                return Err(Error::security(format!("Agent {} is a peer; only its owner can rotate it", agent_id)));
            }

            let old_key_id = std::mem::replace(&mut context.active_key_id, new_key.id.clone());
            context.keys.push(new_key.id.clone());
            let rotation = KeyRotation {
                agent_id: agent_id.to_string(),
                old_key_id,
                new_key_id: new_key.id.clone(),
            };
            store.keys.insert(new_key.id.clone(), new_key);
            rotation
        };

        if self.config.revoke_on_rotation {
            self.revoke_key(&rotation.old_key_id, "rotated").await;
        }

        info!(agent_id, old_key = %rotation.old_key_id, new_key = %rotation.new_key_id, "Rotated agent key");
        self.record(
            AuditEntry::new(AuditAction::Rotate, Severity::Info, true, "key rotated")
                .agent(agent_id)
                .key(&rotation.new_key_id),
        )
        .await;
        self.events.emit(ProtocolEvent::KeyRotated {
            agent_id: rotation.agent_id.clone(),
            old_key_id: rotation.old_key_id.clone(),
            new_key_id: rotation.new_key_id.clone(),
        });
        Ok(rotation)
    }

    /// Rotates every local agent's key. One agent failing does not stop the others.
    pub async fn rotate_keys(&self) -> Vec<KeyRotation> {
        let agents: Vec<String> = self
            .store
            .read()
            .await
            .contexts
            .values()
            .filter(|c| !c.imported)
            .map(|c| c.agent_id.clone())
            .collect();
        let mut rotations = Vec::with_capacity(agents.len());
        for agent_id in agents {
            match self.rotate_agent_key(&agent_id).await {
                Ok(rotation) => rotations.push(rotation),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Key rotation failed"),
            }
        }
        rotations
    }

    /// Drops expired challenges.
    pub async fn purge_expired_challenges(&self) -> usize {
        let now = Utc::now();
        let mut challenges = self.challenges.write().await;
        let before = challenges.len();
        challenges.retain(|_, challenge| !challenge.is_expired_at(now));
        before - challenges.len()
    }

    /// Starts the periodic rotation task. Calling it again is a no-op, and a zero interval disables it.
    pub fn start_key_rotation(self: &Arc<Self>) {
        let period = self.config.key_rotation_interval;
        if period.is_zero() {
            warn!("Key rotation interval is zero, periodic rotation disabled");
            return;
        }
        let Ok(mut task) = self.rotation_task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let rotated = manager.rotate_keys().await;
                        let purged = manager.purge_expired_challenges().await;
                        let pruned = manager.prune_revoked_keys().await;
                        debug!(rotated = rotated.len(), purged, pruned, "Key rotation tick");
                    }
                }
            }
        }));
    }

    /// Cancels the rotation task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.rotation_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Up to `limit` most recent audit entries, oldest first.
    pub async fn audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.read().await.recent(limit)
    }

    pub async fn audit_entries(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.audit.read().await.filter(action)
    }

    async fn record(&self, entry: AuditEntry) {
        self.audit.write().await.record(entry);
    }
}

/// `canonical || nonce || timestamp`
fn signing_input(message: &A2AMessage, nonce: &str, timestamp: i64) -> Result<Vec<u8>> {
    let mut data = message.canonical_bytes()?;
    data.extend_from_slice(nonce.as_bytes());
    data.extend_from_slice(timestamp.to_string().as_bytes());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventCategory;
    use crate::protocol::{AgentIdentifier, AgentRole};

    fn manager(config: SecurityConfig) -> SecurityManager {
        SecurityManager::new(config, EventBus::default())
    }

    async fn registered(config: SecurityConfig) -> SecurityManager {
        let security = manager(config);
        security.register_agent("queen", SecurityLevel::High).await.unwrap();
        security.register_agent("drone-1", SecurityLevel::Standard).await.unwrap();
        security
    }

    fn message() -> A2AMessage {
        let queen = AgentIdentifier::new("queen", AgentRole::Queen, "mem://queen");
        let drone = AgentIdentifier::new("drone-1", AgentRole::Drone, "mem://drone-1");
        A2AMessage::new(queen, drone, "task", Payload::text("scan sector 7"), "http")
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let security = manager(SecurityConfig::default());
        let first = security.register_agent("queen", SecurityLevel::High).await.unwrap();
        let second = security.register_agent("queen", SecurityLevel::Low).await.unwrap();

        assert_eq!(first.active_key_id, second.active_key_id);
        assert_eq!(second.security_level, SecurityLevel::High);
        let key = security.public_key("queen").await.unwrap();
        assert_eq!(key.algorithm, SIGNING_ALGORITHM);
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let security = registered(SecurityConfig::default()).await;
        let signed = security.sign_message(message()).await.unwrap();

        assert!(signed.security.is_signed());
        assert_eq!(signed.security.algorithm.as_deref(), Some(SIGNING_ALGORITHM));
        assert!(security.verify_message(&signed).await);
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_verification() {
        let security = registered(SecurityConfig::default()).await;
        let mut signed = security.sign_message(message()).await.unwrap();
        signed.payload.data[0] ^= 0x01;

        assert!(!security.verify_message(&signed).await);
    }

    #[tokio::test]
    async fn test_unsigned_and_unknown_senders_fail_verification() {
        let security = registered(SecurityConfig::default()).await;
        assert!(!security.verify_message(&message()).await);

        let mut stranger = security.sign_message(message()).await.unwrap();
        stranger.source.id = "stranger".into();
        assert!(!security.verify_message(&stranger).await);
    }

    #[tokio::test]
    async fn test_key_of_another_agent_is_rejected() {
        let security = registered(SecurityConfig::default()).await;
        let mut forged = message();
        forged.source.id = "drone-1".into();
        let mut signed = security.sign_message(forged).await.unwrap();
        // Claim the queen sent it while keeping the drone's key id.
        signed.source.id = "queen".into();
        assert!(!security.verify_message(&signed).await);
    }

    #[tokio::test]
    async fn test_revocation_invalidates_earlier_signatures() {
        let security = registered(SecurityConfig::default()).await;
        let signed = security.sign_message(message()).await.unwrap();
        let key_id = signed.security.key_id.clone().unwrap();
        assert!(security.verify_message(&signed).await);

        security.revoke_key(&key_id, "compromised").await;

        assert!(security.is_revoked(&key_id).await);
        assert!(!security.verify_message(&signed).await);
        let critical = security
            .audit_entries(AuditAction::Verify)
            .await
            .into_iter()
            .filter(|e| !e.success && e.severity == Severity::Critical)
            .count();
        assert_eq!(critical, 1);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_static_key() {
        let security = registered(SecurityConfig::default()).await;
        let msg = message();
        let encrypted = security.encrypt_message(&msg).await.unwrap();

        assert!(!encrypted.is_forward_secret());
        assert_eq!(encrypted.algorithm, CIPHER_ALGORITHM);
        assert_ne!(encrypted.ciphertext, serde_json::to_vec(&msg.payload).unwrap());
        assert_eq!(security.decrypt_message(&encrypted).await.unwrap(), msg.payload);
    }

    #[tokio::test]
    async fn test_forward_secret_encryption_is_recoverable() {
        let security = registered(SecurityConfig {
            enable_perfect_forward_secrecy: true,
            ..Default::default()
        })
        .await;
        let msg = message();

        let first = security.encrypt_message(&msg).await.unwrap();
        let second = security.encrypt_message(&msg).await.unwrap();
        assert!(first.is_forward_secret());
        assert_ne!(first.ephemeral_public_key, second.ephemeral_public_key);

        assert_eq!(security.decrypt_message(&first).await.unwrap(), msg.payload);
        assert_eq!(security.decrypt_message(&second).await.unwrap(), msg.payload);
    }

    #[tokio::test]
    async fn test_decrypt_with_revoked_key_fails() {
        let security = registered(SecurityConfig::default()).await;
        let encrypted = security.encrypt_message(&message()).await.unwrap();
        security.revoke_key(&encrypted.key_id, "rotated out").await;

        let err = security.decrypt_message(&encrypted).await.unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_is_a_typed_error() {
        let security = registered(SecurityConfig::default()).await;
        let mut encrypted = security.encrypt_message(&message()).await.unwrap();
        encrypted.tag[0] ^= 0xff;

        assert!(matches!(
            security.decrypt_message(&encrypted).await,
            Err(Error::Security(_))
        ));
    }

    #[tokio::test]
    async fn test_challenge_is_single_use() {
        let security = registered(SecurityConfig::default()).await;
        let mut events = security.events.subscribe(EventCategory::Security);

        let challenge = security.generate_challenge("drone-1").await.unwrap();
        let signature = security.sign_challenge("drone-1", &challenge.challenge).await.unwrap();

        assert!(security.authenticate_agent("drone-1", &challenge.id, &signature).await);
        assert!(security.is_authenticated("drone-1").await);
        assert!(!security.authenticate_agent("drone-1", &challenge.id, &signature).await);

        assert_eq!(
            events.try_recv(),
            Some(ProtocolEvent::AuthenticationSucceeded {
                agent_id: "drone-1".into()
            })
        );
    }

    #[tokio::test]
    async fn test_challenge_answered_by_wrong_key_fails() {
        let security = registered(SecurityConfig::default()).await;
        let challenge = security.generate_challenge("drone-1").await.unwrap();
        let signature = security.sign_challenge("queen", &challenge.challenge).await.unwrap();

        assert!(!security.authenticate_agent("drone-1", &challenge.id, &signature).await);
        assert!(!security.is_authenticated("drone-1").await);
    }

    #[tokio::test]
    async fn test_expired_challenge_fails() {
        let security = registered(SecurityConfig {
            challenge_ttl: Duration::ZERO,
            ..Default::default()
        })
        .await;
        let challenge = security.generate_challenge("drone-1").await.unwrap();
        let signature = security.sign_challenge("drone-1", &challenge.challenge).await.unwrap();

        assert!(!security.authenticate_agent("drone-1", &challenge.id, &signature).await);
    }

    #[tokio::test]
    async fn test_mutual_authentication_gates_verification() {
        let security = registered(SecurityConfig {
            enable_mutual_authentication: true,
            ..Default::default()
        })
        .await;
        let signed = security.sign_message(message()).await.unwrap();
        assert!(!security.verify_message(&signed).await);

        let challenge = security.generate_challenge("queen").await.unwrap();
        let signature = security.sign_challenge("queen", &challenge.challenge).await.unwrap();
        assert!(security.authenticate_agent("queen", &challenge.id, &signature).await);

        assert!(security.verify_message(&signed).await);
    }

    #[tokio::test]
    async fn test_rotation_revokes_old_key() {
        let security = registered(SecurityConfig::default()).await;
        let before = security.sign_message(message()).await.unwrap();

        let rotation = security.rotate_agent_key("queen").await.unwrap();

        assert_ne!(rotation.old_key_id, rotation.new_key_id);
        assert!(security.is_revoked(&rotation.old_key_id).await);
        assert!(!security.verify_message(&before).await);

        let after = security.sign_message(message()).await.unwrap();
        assert_eq!(after.security.key_id.as_deref(), Some(rotation.new_key_id.as_str()));
        assert!(security.verify_message(&after).await);

        let context = security.context("queen").await.unwrap();
        assert_eq!(context.keys.len(), 2);
        assert_eq!(context.active_key_id, rotation.new_key_id);
    }

    #[tokio::test]
    async fn test_rotation_without_revocation_keeps_old_signatures_valid() {
        let security = registered(SecurityConfig {
            revoke_on_rotation: false,
            ..Default::default()
        })
        .await;
        let before = security.sign_message(message()).await.unwrap();
        let rotation = security.rotate_agent_key("queen").await.unwrap();

        assert!(security.verify_message(&before).await);

        security.revoke_key(&rotation.old_key_id, "retired").await;
        assert!(!security.verify_message(&before).await);
    }

    #[tokio::test]
    async fn test_rotate_keys_covers_every_agent() {
        let security = registered(SecurityConfig::default()).await;
        let rotations = security.rotate_keys().await;
        assert_eq!(rotations.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_task_runs_on_interval_and_stops_on_shutdown() {
        let security = Arc::new(
            registered(SecurityConfig {
                key_rotation_interval: Duration::from_secs(60),
                ..Default::default()
            })
            .await,
        );
        let initial = security.context("queen").await.unwrap().active_key_id;

        security.start_key_rotation();
        tokio::time::sleep(Duration::from_secs(61)).await;
        let rotated = security.context("queen").await.unwrap().active_key_id;
        assert_ne!(initial, rotated);

        security.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(security.context("queen").await.unwrap().active_key_id, rotated);
    }

    #[tokio::test]
    async fn test_signatures_disabled_skips_checks() {
        let security = registered(SecurityConfig {
            enable_signatures: false,
            ..Default::default()
        })
        .await;
        let msg = security.sign_message(message()).await.unwrap();
        assert!(!msg.security.is_signed());
        assert!(security.verify_message(&msg).await);
    }

    async fn peers() -> (SecurityManager, SecurityManager) {
        let queen_side = manager(SecurityConfig::default());
        queen_side.register_agent("queen", SecurityLevel::High).await.unwrap();
        let drone_side = manager(SecurityConfig::default());
        drone_side.register_agent("drone-1", SecurityLevel::Standard).await.unwrap();
        (queen_side, drone_side)
    }

    #[tokio::test]
    async fn test_imported_peer_key_verifies_but_cannot_sign() {
        let (queen_side, drone_side) = peers().await;
        let signed = queen_side.sign_message(message()).await.unwrap();
        assert!(!drone_side.verify_message(&signed).await);

        let info = queen_side.public_key("queen").await.unwrap();
        let context = drone_side.import_peer_key(info).await.unwrap();

        assert!(context.imported);
        assert!(drone_side.verify_message(&signed).await);
        assert!(matches!(
            drone_side.sign_message(message()).await,
            Err(Error::Security(_))
        ));
    }

    #[tokio::test]
    async fn test_import_cannot_shadow_a_local_agent() {
        let (queen_side, drone_side) = peers().await;
        let own = queen_side.public_key("queen").await.unwrap();
        assert!(queen_side.import_peer_key(own).await.is_err());

        let peer = queen_side.public_key("queen").await.unwrap();
        drone_side.import_peer_key(peer).await.unwrap();
        assert!(drone_side.register_agent("queen", SecurityLevel::High).await.is_err());
    }

    #[tokio::test]
    async fn test_newer_peer_key_becomes_active() {
        let security = SecurityManager::new(
            SecurityConfig {
                revoke_on_rotation: false,
                ..Default::default()
            },
            EventBus::default(),
        );
        security.register_agent("queen", SecurityLevel::High).await.unwrap();
        let (_, drone_side) = peers().await;

        let old = security.public_key("queen").await.unwrap();
        let rotation = security.rotate_agent_key("queen").await.unwrap();
        let new = security.public_key("queen").await.unwrap();

        drone_side.import_peer_key(new).await.unwrap();
        let context = drone_side.import_peer_key(old).await.unwrap();
        assert_eq!(context.active_key_id, rotation.new_key_id);
        assert_eq!(context.keys.len(), 2);
    }

    #[tokio::test]
    async fn test_rotation_skips_peer_contexts() {
        let (queen_side, drone_side) = peers().await;
        let info = queen_side.public_key("queen").await.unwrap();
        drone_side.import_peer_key(info).await.unwrap();

        let rotations = drone_side.rotate_keys().await;
        assert_eq!(rotations.len(), 1);
        assert_eq!(rotations[0].agent_id, "drone-1");
        assert!(drone_side.rotate_agent_key("queen").await.is_err());
    }

    #[tokio::test]
    async fn test_trusted_agents_gate_verification() {
        let security = registered(SecurityConfig::default()).await;
        let signed = security.sign_message(message()).await.unwrap();
        assert!(security.verify_message(&signed).await);

        security.trust_agent("drone-1", "princess-a").await.unwrap();
        assert!(!security.verify_message(&signed).await);

        security.trust_agent("drone-1", "queen").await.unwrap();
        assert!(security.verify_message(&signed).await);
    }

    #[tokio::test]
    async fn test_forward_secret_sender_holds_only_the_public_key() {
        let sender = manager(SecurityConfig {
            enable_perfect_forward_secrecy: true,
            ..Default::default()
        });
        sender.register_agent("queen", SecurityLevel::High).await.unwrap();
        let (_, drone_side) = peers().await;
        let info = drone_side.public_key("drone-1").await.unwrap();
        sender.import_peer_key(info).await.unwrap();

        let msg = message();
        let encrypted = sender.encrypt_message(&msg).await.unwrap();

        assert!(encrypted.is_forward_secret());
        assert!(matches!(
            sender.decrypt_message(&encrypted).await,
            Err(Error::Security(_))
        ));
        assert_eq!(drone_side.decrypt_message(&encrypted).await.unwrap(), msg.payload);
    }

    #[tokio::test]
    async fn test_revocation_discards_private_material() {
        let security = registered(SecurityConfig::default()).await;
        let key_id = security.context("queen").await.unwrap().active_key_id;

        security.revoke_key(&key_id, "compromised").await;

        assert!(!security.store.read().await.keys[&key_id].has_secrets());
        assert!(security.sign_challenge("queen", b"challenge").await.is_err());
    }

    #[tokio::test]
    async fn test_pruning_forgets_old_revoked_keys() {
        let security = registered(SecurityConfig {
            revoked_key_retention: Duration::ZERO,
            ..Default::default()
        })
        .await;
        let before = security.sign_message(message()).await.unwrap();
        security.rotate_agent_key("queen").await.unwrap();
        let drone_key = security.context("drone-1").await.unwrap().active_key_id;
        security.revoke_key(&drone_key, "compromised").await;

        // The drone's revoked key is still its active key and stays.
        assert_eq!(security.prune_revoked_keys().await, 1);

        assert_eq!(security.context("queen").await.unwrap().keys.len(), 1);
        assert_eq!(security.revocations().await.len(), 1);
        assert!(!security.verify_message(&before).await);
        assert_eq!(security.prune_revoked_keys().await, 0);
    }

    #[tokio::test]
    async fn test_recent_revocations_are_retained() {
        let security = registered(SecurityConfig::default()).await;
        let rotation = security.rotate_agent_key("queen").await.unwrap();

        assert_eq!(security.prune_revoked_keys().await, 0);
        assert!(security.is_revoked(&rotation.old_key_id).await);
    }

    #[tokio::test]
    async fn test_every_operation_is_audited() {
        let security = registered(SecurityConfig::default()).await;
        let signed = security.sign_message(message()).await.unwrap();
        security.verify_message(&signed).await;

        let actions: Vec<_> = security.audit_log(100).await.into_iter().map(|e| e.action).collect();
        assert!(actions.contains(&AuditAction::Registration));
        assert!(actions.contains(&AuditAction::Sign));
        assert!(actions.contains(&AuditAction::Verify));
    }
}
