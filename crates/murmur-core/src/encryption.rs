//! Per-peer session encryption, key bundles and shared secret negotiation.
//!
//! Every installation owns an X25519 bundle key derived from the identity
//! secret and its installation ID, published in a signed [`Bundle`]. Direct
//! messages carry one ciphertext per recipient installation whose bundle we
//! know; each is encrypted with a message key from a symmetric hash ratchet
//! seeded by the X25519 agreement of the two bundle keys. Until a peer's bundle
//! is known we fall back to the agreement of the two identity keys.
//!
//! Once a peer's bundle is known both sides can derive the same shared secret
//! from their identity keys and move the conversation to a topic derived from
//! it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use murmur_shared::constants::{
    ENCRYPTION_MAGIC, KDF_CONTEXT_BUNDLE_KEY, KDF_CONTEXT_CHAIN_KEY, KDF_CONTEXT_DH_ROOT,
    KDF_CONTEXT_MESSAGE_KEY, KDF_CONTEXT_SHARED_SECRET,
};
use murmur_shared::crypto::{self, derive_key};
use murmur_shared::error::{CodecError, CryptoError, IdentityError};
use murmur_shared::identity::verify_signature;
use murmur_shared::protocol::{decode_framed, encode_framed};
use murmur_shared::types::now_ms;
use murmur_shared::{Identity, UserId};
use murmur_store::{Installation, StoreError};

use crate::SharedDatabase;

/// Largest gap between the expected and the received counter.
const MAX_SKIP: u32 = 1000;
/// Message keys kept per session for late arrivals.
const MAX_SKIPPED_KEYS: usize = 1000;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("no ciphertext addressed to this device")]
    DeviceNotFound,

    #[error("message is addressed to another identity")]
    NotAddressed,

    #[error("invalid bundle from {0}")]
    InvalidBundle(String),

    #[error("message key for counter {0} is not available")]
    MessageKeyNotFound(u32),

    #[error("counter {0} skips too many messages")]
    TooManySkipped(u32),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

type Result<T> = std::result::Result<T, EncryptionError>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Signed announcement of an installation's bundle key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bundle {
    pub identity: UserId,
    pub installation_id: String,
    pub dh_public: [u8; 32],
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

impl Bundle {
    pub fn new(
        identity: &Identity,
        installation_id: &str,
        dh_public: [u8; 32],
        timestamp: u64,
    ) -> std::result::Result<Self, CodecError> {
        let mut bundle = Self {
            identity: identity.user_id(),
            installation_id: installation_id.to_string(),
            dh_public,
            timestamp,
            signature: Vec::new(),
        };
        bundle.signature = identity.sign(&bundle.signing_bytes()?).to_bytes().to_vec();
        Ok(bundle)
    }

    fn signing_bytes(&self) -> std::result::Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(&(
            &self.identity,
            &self.installation_id,
            &self.dh_public,
            self.timestamp,
        ))?)
    }

    pub fn verify(&self) -> std::result::Result<(), IdentityError> {
        let bytes = self
            .signing_bytes()
            .map_err(|_| IdentityError::InvalidSignature)?;
        verify_signature(&self.identity, &bytes, &self.signature)
    }
}

/// Ciphertext for one recipient installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectMessage {
    pub recipient: UserId,
    /// Recipient installation; empty when encrypted to the identity key.
    pub installation_id: String,
    pub sender_key: [u8; 32],
    pub recipient_key: [u8; 32],
    pub counter: u32,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtocolPayload {
    /// Readable by anyone on the topic.
    Public(Vec<u8>),
    Direct(Vec<DirectMessage>),
    /// Carries only the sender's bundle.
    Advertisement,
}

/// The encryption envelope placed inside a transport envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolMessage {
    /// Sending installation.
    pub installation_id: String,
    pub bundle: Option<Bundle>,
    pub payload: ProtocolPayload,
}

impl ProtocolMessage {
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, CodecError> {
        encode_framed(ENCRYPTION_MAGIC, self)
    }

    /// `Ok(None)` when `data` is not an encryption envelope.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Option<Self>, CodecError> {
        decode_framed(ENCRYPTION_MAGIC, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedSecret {
    pub identity: UserId,
    pub key: [u8; 32],
}

/// Result of an encryption call.
#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub message: ProtocolMessage,
    /// Set once the recipient can derive the same secret.
    pub shared_secret: Option<SharedSecret>,
}

impl MessageSpec {
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, CodecError> {
        self.message.to_bytes()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecryptResponse {
    /// `None` for bundle advertisements.
    pub plaintext: Option<Vec<u8>>,
    /// Secrets newly usable with the sender.
    pub shared_secrets: Vec<SharedSecret>,
    /// Other installations of our own identity learned from bundles.
    pub installations: Vec<Installation>,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    send_chain: [u8; 32],
    send_counter: u32,
    recv_chain: [u8; 32],
    recv_counter: u32,
    skipped: VecDeque<(u32, [u8; 32])>,
}

impl Session {
    fn new(agreement: &[u8; 32], local_key: &[u8; 32], remote_key: &[u8; 32]) -> Self {
        let root = derive_key(KDF_CONTEXT_DH_ROOT, &[agreement]);
        Self {
            send_chain: derive_key(KDF_CONTEXT_CHAIN_KEY, &[&root, local_key, remote_key]),
            send_counter: 0,
            recv_chain: derive_key(KDF_CONTEXT_CHAIN_KEY, &[&root, remote_key, local_key]),
            recv_counter: 0,
            skipped: VecDeque::new(),
        }
    }

    fn message_key(chain: &[u8; 32]) -> [u8; 32] {
        derive_key(KDF_CONTEXT_MESSAGE_KEY, &[chain])
    }

    fn advance(chain: &[u8; 32]) -> [u8; 32] {
        derive_key(KDF_CONTEXT_CHAIN_KEY, &[chain, b"next"])
    }

    fn next_send_key(&mut self) -> (u32, [u8; 32]) {
        let counter = self.send_counter;
        let key = Self::message_key(&self.send_chain);
        self.send_chain = Self::advance(&self.send_chain);
        self.send_counter += 1;
        (counter, key)
    }

    fn recv_key(&mut self, counter: u32) -> Result<[u8; 32]> {
        if counter < self.recv_counter {
            let pos = self
                .skipped
                .iter()
                .position(|(c, _)| *c == counter)
                .ok_or(EncryptionError::MessageKeyNotFound(counter))?;
            return self
                .skipped
                .remove(pos)
                .map(|(_, key)| key)
                .ok_or(EncryptionError::MessageKeyNotFound(counter));
        }
        if counter - self.recv_counter > MAX_SKIP {
            return Err(EncryptionError::TooManySkipped(counter));
        }
        while self.recv_counter < counter {
            self.skipped
                .push_back((self.recv_counter, Self::message_key(&self.recv_chain)));
            if self.skipped.len() > MAX_SKIPPED_KEYS {
                self.skipped.pop_front();
            }
            self.recv_chain = Self::advance(&self.recv_chain);
            self.recv_counter += 1;
        }
        let key = Self::message_key(&self.recv_chain);
        self.recv_chain = Self::advance(&self.recv_chain);
        self.recv_counter += 1;
        Ok(key)
    }
}

fn session_key(local_key: &[u8; 32], remote_key: &[u8; 32]) -> String {
    format!("{}:{}", hex::encode(local_key), hex::encode(remote_key))
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EncryptionState {
    bundles: HashMap<UserId, HashMap<String, Bundle>>,
    sessions: HashMap<(UserId, String), Session>,
    advertised: HashMap<UserId, u64>,
}

pub struct EncryptionProtocol {
    identity: Arc<Identity>,
    installation_id: String,
    bundle_secret: StaticSecret,
    bundle: Bundle,
    advertise_interval_ms: u64,
    db: SharedDatabase,
    state: Mutex<EncryptionState>,
}

impl EncryptionProtocol {
    /// Build the protocol for this installation and load stored bundles and sessions.
    pub fn new(
        identity: Arc<Identity>,
        installation_id: &str,
        advertise_interval: Duration,
        db: SharedDatabase,
    ) -> Result<Self> {
        let bundle_secret = StaticSecret::from(derive_key(
            KDF_CONTEXT_BUNDLE_KEY,
            &[identity.secret_bytes(), installation_id.as_bytes()],
        ));
        let dh_public = PublicKey::from(&bundle_secret).to_bytes();
        let bundle = Bundle::new(&identity, installation_id, dh_public, now_ms())?;

        let mut state = EncryptionState::default();
        {
            let db = db
                .lock()
                .map_err(|e| EncryptionError::LockPoisoned(e.to_string()))?;
            for (owner, data) in db.all_bundles()? {
                match bincode::deserialize::<Bundle>(&data) {
                    Ok(bundle) if bundle.identity == owner && bundle.verify().is_ok() => {
                        state
                            .bundles
                            .entry(owner)
                            .or_default()
                            .insert(bundle.installation_id.clone(), bundle);
                    }
                    _ => warn!(identity = %owner, "Skipping unreadable stored bundle"),
                }
            }
            for (peer, key, data) in db.all_sessions()? {
                match bincode::deserialize::<Session>(&data) {
                    Ok(session) => {
                        state.sessions.insert((peer, key), session);
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "Skipping unreadable stored session"),
                }
            }
        }
        debug!(
            installation_id,
            bundles = state.bundles.len(),
            sessions = state.sessions.len(),
            "Encryption protocol loaded"
        );

        Ok(Self {
            identity,
            installation_id: installation_id.to_string(),
            bundle_secret,
            bundle,
            advertise_interval_ms: advertise_interval.as_millis() as u64,
            db,
            state: Mutex::new(state),
        })
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EncryptionState>> {
        self.state
            .lock()
            .map_err(|e| EncryptionError::LockPoisoned(e.to_string()))
    }

    /// Secret shared with `peer`, derived from both identity keys.
    pub fn shared_secret(&self, peer: &UserId) -> Result<SharedSecret> {
        let agreement = self.identity.agree(peer)?;
        Ok(SharedSecret {
            identity: *peer,
            key: derive_key(KDF_CONTEXT_SHARED_SECRET, &[&agreement]),
        })
    }

    /// The shared secret, if negotiation with `peer` has completed.
    pub fn negotiated_secret(&self, peer: &UserId) -> Result<Option<SharedSecret>> {
        if *peer == self.identity.user_id() {
            return Ok(None);
        }
        let known = self
            .lock()?
            .bundles
            .get(peer)
            .is_some_and(|bundles| !bundles.is_empty());
        if known {
            Ok(Some(self.shared_secret(peer)?))
        } else {
            Ok(None)
        }
    }

    /// Every peer a secret has been negotiated with.
    pub fn negotiated_secrets(&self) -> Result<Vec<SharedSecret>> {
        let me = self.identity.user_id();
        let peers: Vec<UserId> = self
            .lock()?
            .bundles
            .keys()
            .filter(|peer| **peer != me)
            .copied()
            .collect();
        peers.iter().map(|peer| self.shared_secret(peer)).collect()
    }

    pub fn encrypt_public(&self, plaintext: &[u8]) -> MessageSpec {
        MessageSpec {
            message: ProtocolMessage {
                installation_id: self.installation_id.clone(),
                bundle: None,
                payload: ProtocolPayload::Public(plaintext.to_vec()),
            },
            shared_secret: None,
        }
    }

    /// Encrypt `plaintext` for every known installation of `peer`.
    pub fn encrypt_direct(&self, peer: &UserId, plaintext: &[u8]) -> Result<MessageSpec> {
        let me = self.identity.user_id();
        let mut state = self.lock()?;

        let targets: Vec<(String, [u8; 32])> = state
            .bundles
            .get(peer)
            .map(|bundles| {
                bundles
                    .values()
                    .filter(|b| !(*peer == me && b.installation_id == self.installation_id))
                    .map(|b| (b.installation_id.clone(), b.dh_public))
                    .collect()
            })
            .unwrap_or_default();

        let mut entries = Vec::new();
        let mut touched = Vec::new();
        if targets.is_empty() {
            let local_key = me.dh_public()?.to_bytes();
            let remote_key = peer.dh_public()?.to_bytes();
            let agreement = self.identity.agree(peer)?;
            let (entry, key) =
                encrypt_entry(&mut state, peer, String::new(), local_key, remote_key, &agreement, plaintext)?;
            entries.push(entry);
            touched.push(key);
        } else {
            for (installation_id, remote_key) in &targets {
                let agreement = *self
                    .bundle_secret
                    .diffie_hellman(&PublicKey::from(*remote_key))
                    .as_bytes();
                let (entry, key) = encrypt_entry(
                    &mut state,
                    peer,
                    installation_id.clone(),
                    self.bundle.dh_public,
                    *remote_key,
                    &agreement,
                    plaintext,
                )?;
                entries.push(entry);
                touched.push(key);
            }
        }
        self.persist_sessions(&state, peer, &touched)?;
        drop(state);

        let shared_secret = if targets.is_empty() || *peer == me {
            None
        } else {
            Some(self.shared_secret(peer)?)
        };
        debug!(peer = %peer, installations = entries.len(), negotiated = shared_secret.is_some(), "Encrypted direct message");

        Ok(MessageSpec {
            message: ProtocolMessage {
                installation_id: self.installation_id.clone(),
                bundle: Some(self.bundle.clone()),
                payload: ProtocolPayload::Direct(entries),
            },
            shared_secret,
        })
    }

    pub fn decrypt(&self, sender: &UserId, message: &ProtocolMessage) -> Result<DecryptResponse> {
        if let ProtocolPayload::Direct(entries) = &message.payload {
            let me = self.identity.user_id();
            if !entries.iter().any(|e| e.recipient == me) {
                return Err(EncryptionError::NotAddressed);
            }
        }

        let mut response = DecryptResponse::default();
        if let Some(bundle) = &message.bundle {
            self.accept_bundle(sender, bundle, &mut response)?;
        }

        match &message.payload {
            ProtocolPayload::Public(plaintext) => response.plaintext = Some(plaintext.clone()),
            ProtocolPayload::Advertisement => {}
            ProtocolPayload::Direct(entries) => {
                let identity_key = self.identity.user_id().dh_public()?.to_bytes();
                let entry = entries
                    .iter()
                    .find(|e| {
                        e.installation_id == self.installation_id
                            && e.recipient_key == self.bundle.dh_public
                    })
                    .or_else(|| {
                        entries
                            .iter()
                            .find(|e| e.installation_id.is_empty() && e.recipient_key == identity_key)
                    })
                    .ok_or(EncryptionError::DeviceNotFound)?;

                let sender_key = PublicKey::from(entry.sender_key);
                let agreement = if entry.installation_id.is_empty() {
                    *self.identity.dh_secret().diffie_hellman(&sender_key).as_bytes()
                } else {
                    *self.bundle_secret.diffie_hellman(&sender_key).as_bytes()
                };
                let key = session_key(&entry.recipient_key, &entry.sender_key);

                let mut state = self.lock()?;
                let mut session = state
                    .sessions
                    .get(&(*sender, key.clone()))
                    .cloned()
                    .unwrap_or_else(|| Session::new(&agreement, &entry.recipient_key, &entry.sender_key));
                // Work on a copy so a forged ciphertext cannot advance the chain.
                let message_key = session.recv_key(entry.counter)?;
                let plaintext = crypto::decrypt(&message_key, &entry.ciphertext)?;
                state.sessions.insert((*sender, key.clone()), session);
                self.persist_sessions(&state, sender, &[key])?;

                response.plaintext = Some(plaintext);
            }
        }
        Ok(response)
    }

    fn accept_bundle(
        &self,
        sender: &UserId,
        bundle: &Bundle,
        response: &mut DecryptResponse,
    ) -> Result<()> {
        if bundle.identity != *sender || bundle.verify().is_err() {
            return Err(EncryptionError::InvalidBundle(sender.to_hex()));
        }
        let me = self.identity.user_id();
        if *sender == me && bundle.installation_id == self.installation_id {
            return Ok(());
        }

        let first = {
            let mut state = self.lock()?;
            let bundles = state.bundles.entry(*sender).or_default();
            let first = bundles.is_empty();
            let newer = bundles
                .get(&bundle.installation_id)
                .map_or(true, |known| bundle.timestamp > known.timestamp);
            if newer {
                bundles.insert(bundle.installation_id.clone(), bundle.clone());
                let data = bincode::serialize(bundle).map_err(CodecError::from)?;
                self.db
                    .lock()
                    .map_err(|e| EncryptionError::LockPoisoned(e.to_string()))?
                    .save_bundle(sender, &bundle.installation_id, bundle.timestamp, &data)?;
                debug!(identity = %sender, installation_id = %bundle.installation_id, "Stored bundle");
            }
            first
        };

        if *sender == me {
            response.installations.push(Installation {
                id: bundle.installation_id.clone(),
                identity: me,
                enabled: false,
                name: String::new(),
                device_type: String::new(),
                timestamp: bundle.timestamp,
            });
        } else {
            if first {
                debug!(peer = %sender, "Negotiated shared secret");
            }
            response.shared_secrets.push(self.shared_secret(sender)?);
        }
        Ok(())
    }

    fn persist_sessions(&self, state: &EncryptionState, peer: &UserId, keys: &[String]) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|e| EncryptionError::LockPoisoned(e.to_string()))?;
        for key in keys {
            if let Some(session) = state.sessions.get(&(*peer, key.clone())) {
                let data = bincode::serialize(session).map_err(CodecError::from)?;
                db.save_session(peer, key, &data)?;
            }
        }
        Ok(())
    }

    /// Whether enough time passed since our bundle was last advertised to `peer`.
    pub fn should_advertise_bundle(&self, peer: &UserId, now: u64) -> Result<bool> {
        Ok(self
            .lock()?
            .advertised
            .get(peer)
            .map_or(true, |last| now.saturating_sub(*last) >= self.advertise_interval_ms))
    }

    pub fn confirm_bundle_advertisement(&self, peer: &UserId, now: u64) -> Result<()> {
        self.lock()?.advertised.insert(*peer, now);
        Ok(())
    }

    pub fn build_bundle_advertisement(&self) -> ProtocolMessage {
        ProtocolMessage {
            installation_id: self.installation_id.clone(),
            bundle: Some(self.bundle.clone()),
            payload: ProtocolPayload::Advertisement,
        }
    }
}

fn encrypt_entry(
    state: &mut EncryptionState,
    peer: &UserId,
    installation_id: String,
    local_key: [u8; 32],
    remote_key: [u8; 32],
    agreement: &[u8; 32],
    plaintext: &[u8],
) -> Result<(DirectMessage, String)> {
    let key = session_key(&local_key, &remote_key);
    let session = state
        .sessions
        .entry((*peer, key.clone()))
        .or_insert_with(|| Session::new(agreement, &local_key, &remote_key));
    let (counter, message_key) = session.next_send_key();
    let ciphertext = crypto::encrypt(&message_key, plaintext)?;
    Ok((
        DirectMessage {
            recipient: *peer,
            installation_id,
            sender_key: local_key,
            recipient_key: remote_key,
            counter,
            ciphertext,
        },
        key,
    ))
}
