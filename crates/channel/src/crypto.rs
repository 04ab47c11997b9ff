//! Key material and AEAD
//!
//! Every session key is an AES-256-GCM key derived with HKDF-SHA256.
//! Ciphertext on the wire is `[12-byte nonce][ciphertext + tag]`, with a
//! fresh random nonce per message.

use crate::error::{ChannelError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

pub(crate) fn b64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn b64_decode(text: &str, what: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| ChannelError::Protocol(format!("{what} is not valid base64: {e}")))
}

/// HKDF-SHA256 expansion of `ikm` into a 32-byte key
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .map_err(|e| ChannelError::Encryption(format!("key derivation: {e}")))?;
    Ok(okm)
}

pub fn random_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Fresh X25519 key pair
pub fn ephemeral_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

pub fn encode_public(key: &PublicKey) -> String {
    b64_encode(key.as_bytes())
}

pub fn decode_public(text: &str) -> Result<PublicKey> {
    let bytes: [u8; 32] = b64_decode(text, "ephemeralPublicKey")?
        .try_into()
        .map_err(|_| ChannelError::Protocol("ephemeralPublicKey must be 32 bytes".to_string()))?;
    Ok(PublicKey::from(bytes))
}

/// One symmetric key and its identifier
pub struct SessionKey {
    id: String,
    cipher: Aes256Gcm,
    created_at: DateTime<Utc>,
}

impl SessionKey {
    pub fn new(id: impl Into<String>, key: &[u8; KEY_LEN], created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| ChannelError::Encryption(e.to_string()))?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(ChannelError::Decryption(format!(
                "frame of {} bytes is too short",
                frame.len()
            )));
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ChannelError::Decryption(format!("authentication failed under key {}", self.id)))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A previous key kept for decryption until `until`
#[derive(Debug, Clone)]
pub struct GraceKey {
    pub key: Arc<SessionKey>,
    pub until: DateTime<Utc>,
}

/// Current key plus the grace-period key.
///
/// Rings are immutable; rotation builds a new ring, so a reader holding an
/// `Arc<KeyRing>` always sees a consistent current/grace pair.
#[derive(Debug, Clone)]
pub struct KeyRing {
    current: Arc<SessionKey>,
    previous: Option<GraceKey>,
}

impl KeyRing {
    pub fn new(current: SessionKey) -> Self {
        Self {
            current: Arc::new(current),
            previous: None,
        }
    }

    /// New ring with `next` as current and the old current kept until `grace_until`
    pub fn rotated(&self, next: SessionKey, grace_until: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(next),
            previous: Some(GraceKey {
                key: self.current.clone(),
                until: grace_until,
            }),
        }
    }

    /// Same current key, with `key` accepted until `grace_until`
    pub fn with_grace(&self, key: SessionKey, grace_until: DateTime<Utc>) -> Self {
        Self {
            current: self.current.clone(),
            previous: Some(GraceKey {
                key: Arc::new(key),
                until: grace_until,
            }),
        }
    }

    pub fn current_key_id(&self) -> &str {
        self.current.id()
    }

    pub fn grace_key(&self) -> Option<&GraceKey> {
        self.previous.as_ref()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.current.encrypt(plaintext)
    }

    /// Decrypt a frame.
    ///
    /// With a `key_id` only that key is tried; without one the current key is
    /// tried first, then the grace key.
    pub fn decrypt(&self, frame: &[u8], key_id: Option<&str>, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let grace = self.previous.as_ref().filter(|g| now <= g.until);

        match key_id {
            Some(id) if id == self.current.id() => self.current.decrypt(frame),
            Some(id) => match &self.previous {
                Some(g) if g.key.id() == id && now <= g.until => g.key.decrypt(frame),
                Some(g) if g.key.id() == id => Err(ChannelError::Decryption(format!(
                    "key {id} left its grace period"
                ))),
                _ => Err(ChannelError::Decryption(format!("unknown key {id}"))),
            },
            None => match self.current.decrypt(frame) {
                Ok(plain) => Ok(plain),
                Err(err) => match grace {
                    Some(g) => g.key.decrypt(frame),
                    None => Err(err),
                },
            },
        }
    }
}
