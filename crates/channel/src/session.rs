//! SecureSession - Handshake and key schedule, without I/O
//!
//! The initiator sends `handshake-init` carrying the session id, the key id it
//! wants and (with forward secrecy) an X25519 public key. The responder
//! answers with its own public key and a proof: the session id sealed under
//! the derived key. Both sides derive
//! `HKDF-SHA256(ikm = DH or pre-shared key, salt = session id, info = key id)`.
//!
//! Rotation is one message: the rotating side picks a new key id and salt and,
//! with forward secrecy, a new ephemeral key pair combined with the peer's
//! current public key. The message names the key it replaces. When both sides
//! rotate away from the same key before hearing from each other, the
//! initiator's rotation wins: the responder adopts it, and the initiator keeps
//! the responder's key only as a grace key for frames already in flight.

use crate::crypto::{
    b64_decode, b64_encode, decode_public, derive_key, encode_public, ephemeral_keypair,
    random_salt, KeyRing, SessionKey, KEY_LEN,
};
use crate::error::{ChannelError, Result};
use crate::wire::{HandshakeMessage, KeyRotation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{saturating_add, Clock, EncryptionConfig, SUPPORTED_ALGORITHM};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeState {
    Unauthenticated,
    Handshaking,
    Secured,
}

/// Established session parameters; replaced as a whole on rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub established_at: DateTime<Utc>,
    pub algorithm: String,
    pub key_id: String,
    /// The peer proved possession of the derived key
    pub certificate_valid: bool,
    pub perfect_forward_secrecy: bool,
    pub rotations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
}

fn new_key_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("k-{}", &id[..12])
}

/// How many of our own rotations are remembered for crossing resolution
const ROTATION_HISTORY: usize = 4;

/// A rotation we announced that the peer has not built on yet
struct LocalRotation {
    replaced_key_id: String,
    /// Our ephemeral secret from before the rotation
    previous_secret: Option<StaticSecret>,
}

pub struct SecureSession {
    role: Role,
    config: EncryptionConfig,
    pre_shared_key: Option<[u8; KEY_LEN]>,
    clock: Arc<dyn Clock>,
    state: HandshakeState,
    session_id: Option<String>,
    pending_key_id: Option<String>,
    local_secret: Option<StaticSecret>,
    peer_public: Option<PublicKey>,
    keys: Option<Arc<KeyRing>>,
    info: Option<Arc<SessionInfo>>,
    unanswered: VecDeque<LocalRotation>,
}

impl SecureSession {
    pub fn new(role: Role, config: EncryptionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.algorithm != SUPPORTED_ALGORITHM {
            return Err(ChannelError::Config(format!(
                "unsupported algorithm '{}'",
                config.algorithm
            )));
        }
        let pre_shared_key = config
            .decode_pre_shared_key()
            .map_err(|e| ChannelError::Config(e.to_string()))?;
        if !config.perfect_forward_secrecy && pre_shared_key.is_none() {
            return Err(ChannelError::Config(
                "a pre-shared key is required without forward secrecy".to_string(),
            ));
        }

        Ok(Self {
            role,
            config,
            pre_shared_key,
            clock,
            state: HandshakeState::Unauthenticated,
            session_id: None,
            pending_key_id: None,
            local_secret: None,
            peer_public: None,
            keys: None,
            info: None,
            unanswered: VecDeque::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_secured(&self) -> bool {
        self.state == HandshakeState::Secured
    }

    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    /// Snapshot of the key ring
    pub fn keys(&self) -> Option<Arc<KeyRing>> {
        self.keys.clone()
    }

    pub fn info(&self) -> Option<Arc<SessionInfo>> {
        self.info.clone()
    }

    /// Forget every key; the next handshake starts from scratch
    pub fn reset(&mut self) {
        self.state = HandshakeState::Unauthenticated;
        self.session_id = None;
        self.pending_key_id = None;
        self.local_secret = None;
        self.peer_public = None;
        self.keys = None;
        self.info = None;
        self.unanswered.clear();
    }

    /// Initiator: produce the `handshake-init` message
    pub fn begin(&mut self) -> Result<HandshakeMessage> {
        if self.role != Role::Initiator {
            return Err(ChannelError::Handshake("only the initiator starts a handshake".to_string()));
        }
        self.reset();

        let session_id = uuid::Uuid::new_v4().to_string();
        let key_id = new_key_id();
        let ephemeral_public_key = if self.config.perfect_forward_secrecy {
            let (secret, public) = ephemeral_keypair();
            self.local_secret = Some(secret);
            Some(encode_public(&public))
        } else {
            None
        };

        self.session_id = Some(session_id.clone());
        self.pending_key_id = Some(key_id.clone());
        self.state = HandshakeState::Handshaking;
        debug!(session_id = %session_id, key_id = %key_id, "handshake started");

        Ok(HandshakeMessage {
            session_id,
            algorithm: self.config.algorithm.clone(),
            key_id,
            timestamp: self.clock.now(),
            ephemeral_public_key,
            proof: None,
        })
    }

    /// Responder: accept a `handshake-init` and produce the response
    pub fn accept(&mut self, init: HandshakeMessage) -> Result<HandshakeMessage> {
        if self.role != Role::Responder {
            return Err(ChannelError::Handshake("initiator received handshake-init".to_string()));
        }
        self.reset();
        self.state = HandshakeState::Handshaking;
        check_algorithm(&init.algorithm)?;
        if init.session_id.is_empty() || init.key_id.is_empty() {
            return Err(ChannelError::Handshake("sessionId and keyId are required".to_string()));
        }

        let (ikm, response_public) = if self.config.perfect_forward_secrecy {
            let peer = init
                .ephemeral_public_key
                .as_deref()
                .ok_or_else(|| ChannelError::Handshake("missing ephemeral public key".to_string()))
                .and_then(decode_public)?;
            let (secret, public) = ephemeral_keypair();
            let shared = secret.diffie_hellman(&peer);
            self.local_secret = Some(secret);
            self.peer_public = Some(peer);
            (shared.as_bytes().to_vec(), Some(encode_public(&public)))
        } else {
            (self.psk()?.to_vec(), None)
        };

        let now = self.clock.now();
        let key = derive_key(&ikm, init.session_id.as_bytes(), init.key_id.as_bytes())?;
        let session_key = SessionKey::new(init.key_id.clone(), &key, now);
        let proof = b64_encode(
            &session_key
                .encrypt(init.session_id.as_bytes())
                .map_err(|e| ChannelError::Handshake(e.to_string()))?,
        );

        self.install(init.session_id.clone(), session_key, now);
        info!(session_id = %init.session_id, key_id = %init.key_id, "session secured (responder)");

        Ok(HandshakeMessage {
            session_id: init.session_id,
            algorithm: self.config.algorithm.clone(),
            key_id: init.key_id,
            timestamp: now,
            ephemeral_public_key: response_public,
            proof: Some(proof),
        })
    }

    /// Initiator: verify the `handshake-response` and secure the session
    pub fn complete(&mut self, response: HandshakeMessage) -> Result<()> {
        if self.role != Role::Initiator || self.state != HandshakeState::Handshaking {
            return Err(ChannelError::Handshake("unexpected handshake-response".to_string()));
        }
        check_algorithm(&response.algorithm)?;
        let session_id = self.session_id.clone().unwrap_or_default();
        if response.session_id != session_id {
            return Err(ChannelError::Handshake("session id mismatch".to_string()));
        }
        if self.pending_key_id.as_deref() != Some(response.key_id.as_str()) {
            return Err(ChannelError::Handshake("key id mismatch".to_string()));
        }

        let ikm = if self.config.perfect_forward_secrecy {
            let peer = response
                .ephemeral_public_key
                .as_deref()
                .ok_or_else(|| ChannelError::Handshake("missing ephemeral public key".to_string()))
                .and_then(decode_public)?;
            let secret = self
                .local_secret
                .as_ref()
                .ok_or_else(|| ChannelError::Handshake("no local ephemeral key".to_string()))?;
            let shared = secret.diffie_hellman(&peer);
            self.peer_public = Some(peer);
            shared.as_bytes().to_vec()
        } else {
            self.psk()?.to_vec()
        };

        let now = self.clock.now();
        let key = derive_key(&ikm, session_id.as_bytes(), response.key_id.as_bytes())?;
        let session_key = SessionKey::new(response.key_id.clone(), &key, now);

        let proof = response
            .proof
            .as_deref()
            .ok_or_else(|| ChannelError::Handshake("missing key confirmation".to_string()))?;
        let sealed = b64_decode(proof, "proof").map_err(|e| ChannelError::Handshake(e.to_string()))?;
        let opened = session_key
            .decrypt(&sealed)
            .map_err(|_| ChannelError::Handshake("key confirmation failed".to_string()))?;
        if opened != session_id.as_bytes() {
            return Err(ChannelError::Handshake("key confirmation mismatch".to_string()));
        }

        self.pending_key_id = None;
        self.install(session_id.clone(), session_key, now);
        info!(session_id = %session_id, key_id = %response.key_id, "session secured (initiator)");
        Ok(())
    }

    /// Start a key rotation; the returned message must reach the peer
    pub fn rotate(&mut self) -> Result<KeyRotation> {
        let session_id = self.secured_session_id()?;
        let replaced_key_id = self.current_key_id()?;
        let key_id = new_key_id();
        let salt = random_salt();

        let (ikm, ephemeral_public_key, previous_secret) = if self.config.perfect_forward_secrecy {
            let peer = self
                .peer_public
                .ok_or_else(|| ChannelError::Encryption("peer public key unknown".to_string()))?;
            let (secret, public) = ephemeral_keypair();
            let shared = secret.diffie_hellman(&peer);
            let previous = self.local_secret.replace(secret);
            (shared.as_bytes().to_vec(), Some(encode_public(&public)), previous)
        } else {
            (self.psk()?.to_vec(), None, None)
        };

        let key = derive_key(&ikm, &salt, key_id.as_bytes())?;
        let now = self.clock.now();
        self.swap_key(SessionKey::new(key_id.clone(), &key, now), now)?;

        if self.unanswered.len() == ROTATION_HISTORY {
            self.unanswered.pop_front();
        }
        self.unanswered.push_back(LocalRotation {
            replaced_key_id: replaced_key_id.clone(),
            previous_secret,
        });

        Ok(KeyRotation {
            session_id,
            key_id,
            salt: b64_encode(&salt),
            timestamp: now,
            ephemeral_public_key,
            replaces_key_id: Some(replaced_key_id),
        })
    }

    /// Apply a rotation announced by the peer.
    ///
    /// Returns `false` when the peer's rotation crossed one of ours and ours
    /// was kept; the peer's key then only decrypts during the grace period.
    pub fn apply_rotation(&mut self, rotation: KeyRotation) -> Result<bool> {
        let session_id = self.secured_session_id()?;
        if rotation.session_id != session_id {
            return Err(ChannelError::Protocol("key rotation for another session".to_string()));
        }

        let current_key_id = self.current_key_id()?;
        let replaces = rotation
            .replaces_key_id
            .clone()
            .unwrap_or_else(|| current_key_id.clone());

        if replaces == current_key_id {
            self.unanswered.clear();
            let (key, peer) = self.rotation_key(&rotation, self.local_secret.as_ref())?;
            if peer.is_some() {
                self.peer_public = peer;
            }
            let now = self.clock.now();
            self.swap_key(key, now)?;
            return Ok(true);
        }

        // The peer rotated away from a key we had already replaced ourselves.
        // Anything we announced before that key is known to the peer.
        let position = self
            .unanswered
            .iter()
            .position(|local| local.replaced_key_id == replaces)
            .ok_or_else(|| ChannelError::Protocol(format!("key rotation replaces unknown key {replaces}")))?;
        self.unanswered.drain(..position);
        let Some(crossed) = self.unanswered.pop_front() else {
            return Err(ChannelError::NotSecured);
        };
        let (key, peer) = self.rotation_key(&rotation, crossed.previous_secret.as_ref())?;
        let now = self.clock.now();

        match self.role {
            Role::Initiator => {
                let ring = self.keys.as_ref().ok_or(ChannelError::NotSecured)?;
                let grace_until = saturating_add(now, self.config.grace_period());
                self.keys = Some(Arc::new(ring.with_grace(key, grace_until)));
                // A follow-up rotation built on the discarded key crosses ours too.
                self.unanswered.push_front(LocalRotation {
                    replaced_key_id: rotation.key_id.clone(),
                    previous_secret: crossed.previous_secret,
                });
                debug!(key_id = %rotation.key_id, "crossing key rotation, keeping ours");
                Ok(false)
            }
            Role::Responder => {
                self.unanswered.clear();
                if self.config.perfect_forward_secrecy {
                    self.local_secret = crossed.previous_secret;
                    self.peer_public = peer;
                }
                debug!(key_id = %rotation.key_id, "crossing key rotation, adopting the initiator's");
                self.swap_key(key, now)?;
                Ok(true)
            }
        }
    }

    /// Encrypt under the current key; returns the key id used
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(String, Vec<u8>)> {
        let keys = self.keys.as_ref().ok_or(ChannelError::NotSecured)?;
        Ok((keys.current_key_id().to_string(), keys.encrypt(plaintext)?))
    }

    pub fn decrypt(&self, frame: &[u8], key_id: Option<&str>) -> Result<Vec<u8>> {
        let keys = self.keys.as_ref().ok_or(ChannelError::NotSecured)?;
        keys.decrypt(frame, key_id, self.clock.now())
    }

    fn psk(&self) -> Result<[u8; KEY_LEN]> {
        self.pre_shared_key
            .ok_or_else(|| ChannelError::Handshake("no pre-shared key configured".to_string()))
    }

    fn current_key_id(&self) -> Result<String> {
        self.keys
            .as_ref()
            .map(|ring| ring.current_key_id().to_string())
            .ok_or(ChannelError::NotSecured)
    }

    /// Key announced by `rotation`, derived against `secret` with forward secrecy
    fn rotation_key(
        &self,
        rotation: &KeyRotation,
        secret: Option<&StaticSecret>,
    ) -> Result<(SessionKey, Option<PublicKey>)> {
        let (ikm, peer) = if self.config.perfect_forward_secrecy {
            let peer = rotation
                .ephemeral_public_key
                .as_deref()
                .ok_or_else(|| ChannelError::Protocol("rotation without ephemeral key".to_string()))
                .and_then(decode_public)?;
            let secret = secret.ok_or_else(|| ChannelError::Encryption("no local ephemeral key".to_string()))?;
            (secret.diffie_hellman(&peer).as_bytes().to_vec(), Some(peer))
        } else {
            (self.psk()?.to_vec(), None)
        };

        let salt = b64_decode(&rotation.salt, "salt")?;
        let key = derive_key(&ikm, &salt, rotation.key_id.as_bytes())?;
        Ok((SessionKey::new(rotation.key_id.clone(), &key, self.clock.now()), peer))
    }

    fn secured_session_id(&self) -> Result<String> {
        match (&self.state, &self.session_id) {
            (HandshakeState::Secured, Some(id)) => Ok(id.clone()),
            _ => Err(ChannelError::NotSecured),
        }
    }

    fn install(&mut self, session_id: String, key: SessionKey, now: DateTime<Utc>) {
        let info = SessionInfo {
            session_id: session_id.clone(),
            established_at: now,
            algorithm: self.config.algorithm.clone(),
            key_id: key.id().to_string(),
            certificate_valid: true,
            perfect_forward_secrecy: self.config.perfect_forward_secrecy,
            rotations: 0,
            rotated_at: None,
        };
        self.session_id = Some(session_id);
        self.keys = Some(Arc::new(KeyRing::new(key)));
        self.info = Some(Arc::new(info));
        self.state = HandshakeState::Secured;
    }

    fn swap_key(&mut self, next: SessionKey, now: DateTime<Utc>) -> Result<()> {
        let (ring, info) = match (&self.keys, &self.info) {
            (Some(ring), Some(info)) => (ring, info),
            _ => return Err(ChannelError::NotSecured),
        };

        let key_id = next.id().to_string();
        let grace_until = saturating_add(now, self.config.grace_period());
        let next_ring = ring.rotated(next, grace_until);
        let next_info = SessionInfo {
            key_id: key_id.clone(),
            rotations: info.rotations + 1,
            rotated_at: Some(now),
            ..SessionInfo::clone(info)
        };

        self.keys = Some(Arc::new(next_ring));
        self.info = Some(Arc::new(next_info));
        info!(key_id = %key_id, grace_until = %grace_until, "session key rotated");
        Ok(())
    }
}

fn check_algorithm(algorithm: &str) -> Result<()> {
    if algorithm == SUPPORTED_ALGORITHM {
        Ok(())
    } else {
        Err(ChannelError::Handshake(format!("unsupported algorithm '{algorithm}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use shared::ManualClock;

    fn psk_config() -> EncryptionConfig {
        EncryptionConfig {
            perfect_forward_secrecy: false,
            pre_shared_key: Some(b64_encode(&[9u8; 32])),
            ..Default::default()
        }
    }

    fn pair_with(config: EncryptionConfig) -> (SecureSession, SecureSession, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let mut initiator = SecureSession::new(Role::Initiator, config.clone(), clock.clone()).unwrap();
        let mut responder = SecureSession::new(Role::Responder, config, clock.clone()).unwrap();

        let init = initiator.begin().unwrap();
        let response = responder.accept(init).unwrap();
        initiator.complete(response).unwrap();
        (initiator, responder, clock)
    }

    fn pair() -> (SecureSession, SecureSession, Arc<ManualClock>) {
        pair_with(EncryptionConfig::default())
    }

    // ============== Handshake Tests ==============

    #[test]
    fn test_handshake_secures_both_sides() {
        let (initiator, responder, _) = pair();

        assert!(initiator.is_secured());
        assert!(responder.is_secured());

        let a = initiator.info().unwrap();
        let b = responder.info().unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(a.key_id, b.key_id);
        assert!(a.perfect_forward_secrecy);
        assert!(a.certificate_valid);
    }

    #[test]
    fn test_handshake_states() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut initiator =
            SecureSession::new(Role::Initiator, EncryptionConfig::default(), clock).unwrap();

        assert_eq!(initiator.state(), HandshakeState::Unauthenticated);
        let init = initiator.begin().unwrap();
        assert_eq!(initiator.state(), HandshakeState::Handshaking);
        assert!(init.ephemeral_public_key.is_some());
        assert!(matches!(initiator.encrypt(b"too early"), Err(ChannelError::NotSecured)));
    }

    #[test]
    fn test_handshake_with_pre_shared_key() {
        let (initiator, responder, _) = pair_with(psk_config());

        let (key_id, frame) = initiator.encrypt(b"psk").unwrap();
        assert_eq!(responder.decrypt(&frame, Some(&key_id)).unwrap(), b"psk");
        assert!(!initiator.info().unwrap().perfect_forward_secrecy);
    }

    #[test]
    fn test_mismatched_pre_shared_key_fails_confirmation() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut other = psk_config();
        other.pre_shared_key = Some(b64_encode(&[1u8; 32]));

        let mut initiator = SecureSession::new(Role::Initiator, psk_config(), clock.clone()).unwrap();
        let mut responder = SecureSession::new(Role::Responder, other, clock).unwrap();

        let response = responder.accept(initiator.begin().unwrap()).unwrap();
        let err = initiator.complete(response).unwrap_err();
        assert_eq!(err, ChannelError::Handshake("key confirmation failed".to_string()));
        assert!(!initiator.is_secured());
    }

    #[test]
    fn test_response_for_other_session_rejected() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = EncryptionConfig::default();
        let mut initiator = SecureSession::new(Role::Initiator, config.clone(), clock.clone()).unwrap();
        let mut responder = SecureSession::new(Role::Responder, config, clock).unwrap();

        let init = initiator.begin().unwrap();
        let mut response = responder.accept(init).unwrap();
        response.session_id = "someone-else".to_string();

        assert!(matches!(initiator.complete(response), Err(ChannelError::Handshake(_))));
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = EncryptionConfig::default();
        let mut initiator = SecureSession::new(Role::Initiator, config.clone(), clock.clone()).unwrap();
        let mut responder = SecureSession::new(Role::Responder, config, clock).unwrap();

        let mut init = initiator.begin().unwrap();
        init.algorithm = "DES".to_string();
        assert!(matches!(responder.accept(init), Err(ChannelError::Handshake(_))));
    }

    #[test]
    fn test_missing_psk_is_config_error() {
        let config = EncryptionConfig {
            perfect_forward_secrecy: false,
            ..Default::default()
        };
        let result = SecureSession::new(Role::Initiator, config, Arc::new(ManualClock::starting_now()));
        assert!(matches!(result, Err(ChannelError::Config(_))));
    }

    #[test]
    fn test_roles_enforced() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut responder =
            SecureSession::new(Role::Responder, EncryptionConfig::default(), clock).unwrap();
        assert!(responder.begin().is_err());
    }

    // ============== Encryption Tests ==============

    #[test]
    fn test_roundtrip_both_directions() {
        let (initiator, responder, _) = pair();
        let payload: Vec<u8> = (0..=255).collect();

        let (key_id, frame) = initiator.encrypt(&payload).unwrap();
        assert_eq!(responder.decrypt(&frame, Some(&key_id)).unwrap(), payload);

        let (_, frame) = responder.encrypt(b"reply").unwrap();
        assert_eq!(initiator.decrypt(&frame, None).unwrap(), b"reply");
    }

    // ============== Rotation Tests ==============

    #[test]
    fn test_rotation_keeps_sides_in_step() {
        let (mut initiator, mut responder, _) = pair();
        let before = initiator.info().unwrap();

        let rotation = initiator.rotate().unwrap();
        responder.apply_rotation(rotation).unwrap();

        let after = initiator.info().unwrap();
        assert_ne!(after.key_id, before.key_id);
        assert_eq!(after.session_id, before.session_id);
        assert_eq!(after.rotations, 1);
        assert_eq!(responder.info().unwrap().key_id, after.key_id);

        let (key_id, frame) = responder.encrypt(b"after rotation").unwrap();
        assert_eq!(key_id, after.key_id);
        assert_eq!(initiator.decrypt(&frame, Some(&key_id)).unwrap(), b"after rotation");
    }

    #[test]
    fn test_rotation_from_either_side() {
        let (mut initiator, mut responder, _) = pair();

        responder.apply_rotation(initiator.rotate().unwrap()).unwrap();
        initiator.apply_rotation(responder.rotate().unwrap()).unwrap();
        responder.apply_rotation(initiator.rotate().unwrap()).unwrap();

        let (key_id, frame) = initiator.encrypt(b"third key").unwrap();
        assert_eq!(responder.decrypt(&frame, Some(&key_id)).unwrap(), b"third key");
    }

    fn assert_in_step(a: &SecureSession, b: &SecureSession) {
        assert_eq!(a.info().unwrap().key_id, b.info().unwrap().key_id);

        let (key_id, frame) = a.encrypt(b"hello").unwrap();
        assert_eq!(b.decrypt(&frame, Some(&key_id)).unwrap(), b"hello");
        let (key_id, frame) = b.encrypt(b"world").unwrap();
        assert_eq!(a.decrypt(&frame, Some(&key_id)).unwrap(), b"world");
    }

    #[test]
    fn test_rotation_names_replaced_key() {
        let (mut initiator, _, _) = pair();
        let before = initiator.info().unwrap().key_id.clone();

        let rotation = initiator.rotate().unwrap();
        assert_eq!(rotation.replaces_key_id, Some(before));
    }

    #[test]
    fn test_crossing_rotations_converge_on_initiator_key() {
        let (mut initiator, mut responder, _) = pair();

        let from_initiator = initiator.rotate().unwrap();
        let from_responder = responder.rotate().unwrap();
        let winner = from_initiator.key_id.clone();

        assert!(responder.apply_rotation(from_initiator).unwrap());
        assert!(!initiator.apply_rotation(from_responder).unwrap());

        assert_eq!(initiator.info().unwrap().key_id, winner);
        assert_in_step(&initiator, &responder);
    }

    #[test]
    fn test_crossing_rotations_in_either_arrival_order() {
        let (mut initiator, mut responder, _) = pair();

        let from_initiator = initiator.rotate().unwrap();
        let from_responder = responder.rotate().unwrap();

        assert!(!initiator.apply_rotation(from_responder).unwrap());
        assert!(responder.apply_rotation(from_initiator).unwrap());

        assert_in_step(&initiator, &responder);
    }

    #[test]
    fn test_crossing_rotations_with_pre_shared_key() {
        let (mut initiator, mut responder, _) = pair_with(psk_config());

        let from_initiator = initiator.rotate().unwrap();
        let from_responder = responder.rotate().unwrap();
        responder.apply_rotation(from_initiator).unwrap();
        initiator.apply_rotation(from_responder).unwrap();

        assert_in_step(&initiator, &responder);
    }

    #[test]
    fn test_discarded_key_still_opens_in_flight_frames() {
        let (mut initiator, mut responder, clock) = pair();

        let from_initiator = initiator.rotate().unwrap();
        let from_responder = responder.rotate().unwrap();
        let (discarded, in_flight) = responder.encrypt(b"sent under the losing key").unwrap();

        initiator.apply_rotation(from_responder).unwrap();
        responder.apply_rotation(from_initiator).unwrap();

        assert_eq!(
            initiator.decrypt(&in_flight, Some(&discarded)).unwrap(),
            b"sent under the losing key"
        );
        clock.advance(Duration::seconds(31));
        assert!(initiator.decrypt(&in_flight, Some(&discarded)).is_err());
    }

    #[test]
    fn test_responder_rotating_twice_while_crossing() {
        let (mut initiator, mut responder, _) = pair();

        let from_initiator = initiator.rotate().unwrap();
        let first = responder.rotate().unwrap();
        let second = responder.rotate().unwrap();

        assert!(!initiator.apply_rotation(first).unwrap());
        assert!(!initiator.apply_rotation(second).unwrap());
        assert!(responder.apply_rotation(from_initiator).unwrap());

        assert_in_step(&initiator, &responder);
    }

    #[test]
    fn test_rotations_keep_working_after_a_crossing() {
        let (mut initiator, mut responder, _) = pair();

        let from_initiator = initiator.rotate().unwrap();
        let from_responder = responder.rotate().unwrap();
        responder.apply_rotation(from_initiator).unwrap();
        initiator.apply_rotation(from_responder).unwrap();

        assert!(initiator.apply_rotation(responder.rotate().unwrap()).unwrap());
        assert_in_step(&initiator, &responder);
        assert!(responder.apply_rotation(initiator.rotate().unwrap()).unwrap());
        assert_in_step(&initiator, &responder);
    }

    #[test]
    fn test_crossing_after_peer_applied_earlier_rotations() {
        let (mut initiator, mut responder, _) = pair();

        // The initiator has applied several responder rotations without rotating itself.
        for _ in 0..3 {
            initiator.apply_rotation(responder.rotate().unwrap()).unwrap();
        }
        let from_initiator = initiator.rotate().unwrap();
        let from_responder = responder.rotate().unwrap();

        assert!(responder.apply_rotation(from_initiator).unwrap());
        assert!(!initiator.apply_rotation(from_responder).unwrap());
        assert_in_step(&initiator, &responder);
    }

    #[test]
    fn test_rotation_replacing_unknown_key_rejected() {
        let (mut initiator, mut responder, _) = pair();

        let mut rotation = initiator.rotate().unwrap();
        rotation.replaces_key_id = Some("k-elsewhere".to_string());

        assert!(matches!(responder.apply_rotation(rotation), Err(ChannelError::Protocol(_))));
    }

    #[test]
    fn test_old_key_decrypts_within_grace_period() {
        let (mut initiator, mut responder, clock) = pair();
        let (old_id, in_flight) = responder.encrypt(b"in flight").unwrap();

        responder.apply_rotation(initiator.rotate().unwrap()).unwrap();
        clock.advance(Duration::seconds(29));

        assert_eq!(initiator.decrypt(&in_flight, Some(&old_id)).unwrap(), b"in flight");
        assert_eq!(initiator.decrypt(&in_flight, None).unwrap(), b"in flight");
    }

    #[test]
    fn test_old_key_fails_after_grace_period() {
        let (mut initiator, mut responder, clock) = pair();
        let (old_id, in_flight) = responder.encrypt(b"too late").unwrap();

        responder.apply_rotation(initiator.rotate().unwrap()).unwrap();
        clock.advance(Duration::seconds(31));

        assert!(matches!(
            initiator.decrypt(&in_flight, Some(&old_id)),
            Err(ChannelError::Decryption(_))
        ));
        assert!(matches!(initiator.decrypt(&in_flight, None), Err(ChannelError::Decryption(_))));
    }

    #[test]
    fn test_rotation_replaces_session_info() {
        let (mut initiator, _, _) = pair();
        let before = initiator.info().unwrap();

        initiator.rotate().unwrap();

        assert_eq!(before.rotations, 0);
        assert!(before.rotated_at.is_none());
        assert!(!Arc::ptr_eq(&before, &initiator.info().unwrap()));
    }

    #[test]
    fn test_rotation_for_other_session_rejected() {
        let (mut a, _, _) = pair();
        let (_, mut c, _) = pair();

        let rotation = a.rotate().unwrap();
        assert!(matches!(c.apply_rotation(rotation), Err(ChannelError::Protocol(_))));
    }

    #[test]
    fn test_rotate_requires_secured_session() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut session =
            SecureSession::new(Role::Initiator, EncryptionConfig::default(), clock).unwrap();
        assert_eq!(session.rotate().unwrap_err(), ChannelError::NotSecured);
    }

    #[test]
    fn test_reset_clears_keys() {
        let (mut initiator, _, _) = pair();
        initiator.reset();

        assert_eq!(initiator.state(), HandshakeState::Unauthenticated);
        assert!(initiator.keys().is_none());
        assert!(initiator.info().is_none());
    }
}
