//! Agent key pairs.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;
use x25519_dalek::{PublicKey as AgreementPublicKey, StaticSecret};

pub const SIGNING_ALGORITHM: &str = "Ed25519";
pub const AGREEMENT_ALGORITHM: &str = "X25519";

/// Ed25519 and X25519 public keys are both 32 bytes.
const PUBLIC_KEY_LEN: usize = 32;

struct KeySecrets {
    /// PKCS#8 document
    signing: Vec<u8>,
    agreement: StaticSecret,
}

/// An agent's signing key and key-agreement key, issued and retired together.
///
/// Keys imported from a peer carry only the public halves.
pub struct KeyPair {
    pub id: String,
    pub owner: String,
    pub public_key: Vec<u8>,
    pub agreement_public_key: Vec<u8>,
    secrets: Option<KeySecrets>,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl KeyPair {
    pub fn generate(owner: &str, max_age: Duration, rng: &SystemRandom) -> Result<Self> {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(rng)
            .map_err(|_| Error::security("Failed to generate key pair"))?;
        let parsed = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|e| Error::security(format!("Generated key rejected: {}", e)))?;

        let mut seed = [0u8; PUBLIC_KEY_LEN];
        rng.fill(&mut seed)
            .map_err(|_| Error::security("Failed to generate agreement key"))?;
        let agreement = StaticSecret::from(seed);
        let agreement_public_key = AgreementPublicKey::from(&agreement).to_bytes().to_vec();

        let created_at = Utc::now();
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::security(format!("Invalid key age: {}", e)))?;

        Ok(Self {
            id: format!("key-{}", Uuid::new_v4()),
            owner: owner.to_string(),
            public_key: parsed.public_key().as_ref().to_vec(),
            agreement_public_key,
            secrets: Some(KeySecrets {
                signing: pkcs8.as_ref().to_vec(),
                agreement,
            }),
            algorithm: SIGNING_ALGORITHM.to_string(),
            created_at,
            expires_at: created_at + max_age,
        })
    }

    /// Rebuilds the public half of a peer's key from what the peer published.
    pub fn from_public(info: &PublicKeyInfo) -> Result<Self> {
        if info.algorithm != SIGNING_ALGORITHM {
            return Err(Error::security(format!("Unsupported key algorithm {}", info.algorithm)));
        }
        if info.id.is_empty() || info.owner.is_empty() {
            return Err(Error::validation("Public key needs an id and an owner"));
        }
        if info.expires_at <= info.created_at {
            return Err(Error::security(format!("Key {} expires before it was created", info.id)));
        }

        Ok(Self {
            id: info.id.clone(),
            owner: info.owner.clone(),
            public_key: decode_public(&info.public_key, "signing")?,
            agreement_public_key: decode_public(&info.agreement_key, "agreement")?,
            secrets: None,
            algorithm: info.algorithm.clone(),
            created_at: info.created_at,
            expires_at: info.expires_at,
        })
    }

    /// False for imported keys and for keys whose private halves were discarded.
    pub fn has_secrets(&self) -> bool {
        self.secrets.is_some()
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let pair = Ed25519KeyPair::from_pkcs8(&self.secrets()?.signing)
            .map_err(|e| Error::security(format!("Stored key rejected: {}", e)))?;
        Ok(pair.sign(data).as_ref().to_vec())
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.public_key, data, signature)
    }

    /// X25519 shared secret between this key and `peer_public`.
    pub(crate) fn agree(&self, peer_public: &[u8]) -> Result<[u8; PUBLIC_KEY_LEN]> {
        let secrets = self.secrets()?;
        let peer: [u8; PUBLIC_KEY_LEN] = peer_public
            .try_into()
            .map_err(|_| Error::security("Invalid agreement public key"))?;
        let shared = secrets.agreement.diffie_hellman(&AgreementPublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(Error::security("Key agreement with a low-order point"));
        }
        Ok(shared.to_bytes())
    }

    /// Drops the private halves. The key can still verify signatures.
    pub(crate) fn discard_secrets(&mut self) {
        self.secrets = None;
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn public_info(&self) -> PublicKeyInfo {
        PublicKeyInfo {
            id: self.id.clone(),
            owner: self.owner.clone(),
            public_key: BASE64.encode(&self.public_key),
            agreement_key: BASE64.encode(&self.agreement_public_key),
            algorithm: self.algorithm.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    fn secrets(&self) -> Result<&KeySecrets> {
        self.secrets
            .as_ref()
            .ok_or_else(|| Error::security(format!("Key {} has no private material here", self.id)))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("algorithm", &self.algorithm)
            .field("has_secrets", &self.has_secrets())
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// The shareable half of a key pair. Peers import it to verify and encrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyInfo {
    pub id: String,
    pub owner: String,
    /// Base64 Ed25519 verification key
    pub public_key: String,
    /// Base64 X25519 key used for forward-secret encryption
    pub agreement_key: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub fn verify_signature(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
        .verify(data, signature)
        .is_ok()
}

fn decode_public(encoded: &str, kind: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| Error::security(format!("Malformed {} key", kind)))?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(Error::security(format!(
            "{} key must be {} bytes, got {}",
            kind,
            PUBLIC_KEY_LEN,
            bytes.len()
        )));
    }
    Ok(bytes)
}
