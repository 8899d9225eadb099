//! Payload encryption with ChaCha20-Poly1305.
//!
//! Without forward secrecy the content key is derived with HKDF from the
//! recipient's public key. With forward secrecy the sender generates an
//! ephemeral X25519 key per message, agrees a secret with the recipient's
//! published agreement key and derives the content key from it with HKDF.
//! The ephemeral public key travels with the ciphertext, and only the holder
//! of the recipient's agreement secret can rebuild the content key.

use crate::error::{Error, Result};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use super::keys::KeyPair;

pub const CIPHER_ALGORITHM: &str = "CHACHA20-POLY1305";

const STATIC_SALT: &[u8] = b"a2a-static-content-key-v1";
const EPHEMERAL_SALT: &[u8] = b"a2a-x25519-content-key-v1";

/// Sealed bytes with their nonce and authentication tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    /// Recipient key the content key is bound to
    pub key_id: String,
    pub algorithm: String,
    pub timestamp: i64,
    /// Authenticated as associated data
    pub message_id: String,
    /// Sender's one-time X25519 public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<Vec<u8>>,
}

impl EncryptedPayload {
    pub fn is_forward_secret(&self) -> bool {
        self.ephemeral_public_key.is_some()
    }
}

pub(crate) fn static_content_key(recipient: &KeyPair) -> Result<LessSafeKey> {
    derive_key(STATIC_SALT, &recipient.public_key, &[recipient.id.as_bytes()])
}

/// Sender side: a fresh content key plus the ephemeral public key the recipient needs.
pub(crate) fn ephemeral_content_key(recipient: &KeyPair, rng: &SystemRandom) -> Result<(LessSafeKey, Vec<u8>)> {
    let private = EphemeralPrivateKey::generate(&X25519, rng)
        .map_err(|_| Error::security("Failed to generate ephemeral key"))?;
    let ephemeral_public = private
        .compute_public_key()
        .map_err(|_| Error::security("Failed to compute ephemeral public key"))?
        .as_ref()
        .to_vec();

    let peer = UnparsedPublicKey::new(&X25519, &recipient.agreement_public_key);
    let key = agreement::agree_ephemeral(private, &peer, |shared| {
        forward_secret_key(shared, &ephemeral_public, recipient)
    })
    .map_err(|_| Error::security("Key agreement failed"))??;
    Ok((key, ephemeral_public))
}

/// Recipient side of [`ephemeral_content_key`].
pub(crate) fn recipient_content_key(recipient: &KeyPair, ephemeral_public: &[u8]) -> Result<LessSafeKey> {
    let shared = recipient.agree(ephemeral_public)?;
    forward_secret_key(&shared, ephemeral_public, recipient)
}

fn forward_secret_key(shared: &[u8], ephemeral_public: &[u8], recipient: &KeyPair) -> Result<LessSafeKey> {
    derive_key(
        EPHEMERAL_SALT,
        shared,
        &[recipient.id.as_bytes(), ephemeral_public, &recipient.agreement_public_key],
    )
}

fn derive_key(salt: &[u8], ikm: &[u8], info: &[&[u8]]) -> Result<LessSafeKey> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(ikm);
    let okm = prk
        .expand(info, &CHACHA20_POLY1305)
        .map_err(|_| Error::security("Key derivation failed"))?;
    Ok(LessSafeKey::new(UnboundKey::from(okm)))
}

pub(crate) fn seal(key: &LessSafeKey, rng: &SystemRandom, aad: &[u8], plaintext: &[u8]) -> Result<SealedBox> {
    let mut iv = [0u8; NONCE_LEN];
    rng.fill(&mut iv)
        .map_err(|_| Error::security("Failed to generate nonce"))?;

    let mut in_out = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(iv), Aad::from(aad), &mut in_out)
        .map_err(|_| Error::security("Encryption failed"))?;

    Ok(SealedBox {
        ciphertext: in_out,
        iv: iv.to_vec(),
        tag: tag.as_ref().to_vec(),
    })
}

pub(crate) fn open(key: &LessSafeKey, aad: &[u8], ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
    let nonce = Nonce::try_assume_unique_for_key(iv)
        .map_err(|_| Error::security("Invalid nonce length"))?;
    if tag.len() != aead::MAX_TAG_LEN {
        return Err(Error::security("Invalid authentication tag length"));
    }

    let mut in_out = Vec::with_capacity(ciphertext.len() + tag.len());
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext = key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::security("Decryption failed"))?;
    Ok(plaintext.to_vec())
}
