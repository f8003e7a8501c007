//! Transport envelopes and the delivery events reported about them.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use murmur_shared::constants::{ENVELOPE_TTL_SECS, MAX_MESSAGE_SIZE};
use murmur_shared::error::CodecError;
use murmur_shared::identity::verify_signature;
use murmur_shared::types::now_ms;
use murmur_shared::{Identity, Topic, UserId};

use crate::error::{Result, TransportError};

/// Transport-level hash identifying one posted envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvelopeHash(pub [u8; 32]);

impl EnvelopeHash {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for EnvelopeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// What callers hand to the transport. Kept by the delivery tracker so the
/// same content can be re-posted under a fresh hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEnvelope {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub ttl: u32,
}

impl OutgoingEnvelope {
    pub fn new(topic: Topic, payload: Vec<u8>) -> Self {
        Self {
            topic,
            payload,
            ttl: ENVELOPE_TTL_SECS,
        }
    }
}

/// A signed envelope as it travels over the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub ttl: u32,
    pub timestamp: u64,
    pub nonce: u64,
    pub sender: UserId,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct EnvelopeSigningView<'a> {
    topic: &'a Topic,
    payload: &'a [u8],
    ttl: u32,
    timestamp: u64,
    nonce: u64,
}

impl Envelope {
    /// Sign `outgoing` with the local identity. Every call yields a distinct
    /// envelope (fresh nonce and timestamp) and therefore a distinct hash.
    pub fn seal(identity: &Identity, outgoing: OutgoingEnvelope) -> Result<Self> {
        if outgoing.payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::PayloadTooLarge(outgoing.payload.len()));
        }
        let mut envelope = Self {
            topic: outgoing.topic,
            payload: outgoing.payload,
            ttl: outgoing.ttl,
            timestamp: now_ms(),
            nonce: rand::rngs::OsRng.next_u64(),
            sender: identity.user_id(),
            signature: Vec::new(),
        };
        envelope.signature = identity.sign(&envelope.signing_bytes()?).to_bytes().to_vec();
        Ok(envelope)
    }

    fn signing_bytes(&self) -> std::result::Result<Vec<u8>, CodecError> {
        let view = EnvelopeSigningView {
            topic: &self.topic,
            payload: &self.payload,
            ttl: self.ttl,
            timestamp: self.timestamp,
            nonce: self.nonce,
        };
        bincode::serialize(&view).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Check the sender's signature and return the authenticated sender.
    pub fn verify(&self) -> Result<UserId> {
        verify_signature(&self.sender, &self.signing_bytes()?, &self.signature)?;
        Ok(self.sender)
    }

    /// The signature already commits to topic, payload, time and nonce.
    pub fn hash(&self) -> EnvelopeHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.sender.0);
        hasher.update(&self.signature);
        EnvelopeHash(*hasher.finalize().as_bytes())
    }

    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, CodecError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// How a private payload reaches its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Topic negotiated from a secret shared with the recipient.
    SharedSecret([u8; 32]),
    /// Topic partitioned by the recipient's key, for pre-discovery peers.
    Partitioned,
    /// The common discovery topic.
    Discovery,
}

impl DeliveryMode {
    pub fn topic(&self, recipient: &UserId) -> Topic {
        match self {
            DeliveryMode::SharedSecret(secret) => Topic::shared_secret(secret),
            DeliveryMode::Partitioned => Topic::partitioned(recipient),
            DeliveryMode::Discovery => Topic::discovery(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeliveryMode::SharedSecret(_) => "shared_secret",
            DeliveryMode::Partitioned => "partitioned",
            DeliveryMode::Discovery => "discovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeEventKind {
    Sent,
    Received,
    Expired,
    BatchAcknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeErrorCode {
    /// The receiving peer rejected the envelope because clocks disagree.
    TimeNotSynced,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeError {
    pub hash: EnvelopeHash,
    pub code: EnvelopeErrorCode,
    pub description: String,
}

/// Delivery notification emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeEvent {
    pub kind: EnvelopeEventKind,
    pub hash: EnvelopeHash,
    /// Set when the envelope travelled in a batch awaiting acknowledgement.
    pub batch: Option<EnvelopeHash>,
    pub peer: Option<UserId>,
    pub errors: Vec<EnvelopeError>,
}

impl EnvelopeEvent {
    pub fn new(kind: EnvelopeEventKind, hash: EnvelopeHash) -> Self {
        Self {
            kind,
            hash,
            batch: None,
            peer: None,
            errors: Vec::new(),
        }
    }

    pub fn sent(hash: EnvelopeHash) -> Self {
        Self::new(EnvelopeEventKind::Sent, hash)
    }

    pub fn expired(hash: EnvelopeHash) -> Self {
        Self::new(EnvelopeEventKind::Expired, hash)
    }

    pub fn received(hash: EnvelopeHash, peer: UserId) -> Self {
        Self {
            peer: Some(peer),
            ..Self::new(EnvelopeEventKind::Received, hash)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_verify() {
        let id = Identity::generate();
        let envelope =
            Envelope::seal(&id, OutgoingEnvelope::new(Topic::discovery(), b"payload".to_vec()))
                .unwrap();
        assert_eq!(envelope.verify().unwrap(), id.user_id());

        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.hash(), envelope.hash());
    }

    #[test]
    fn test_resealing_changes_hash() {
        let id = Identity::generate();
        let outgoing = OutgoingEnvelope::new(Topic::public("status"), vec![1, 2, 3]);
        let first = Envelope::seal(&id, outgoing.clone()).unwrap();
        let second = Envelope::seal(&id, outgoing).unwrap();
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn test_forged_sender_rejected() {
        let id = Identity::generate();
        let mut envelope =
            Envelope::seal(&id, OutgoingEnvelope::new(Topic::discovery(), vec![9])).unwrap();
        envelope.sender = Identity::generate().user_id();
        assert!(envelope.verify().is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let id = Identity::generate();
        let outgoing = OutgoingEnvelope::new(Topic::discovery(), vec![0; MAX_MESSAGE_SIZE + 1]);
        assert!(matches!(
            Envelope::seal(&id, outgoing),
            Err(TransportError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_delivery_mode_topics() {
        let peer = Identity::generate().user_id();
        assert_eq!(DeliveryMode::Discovery.topic(&peer), Topic::discovery());
        assert_eq!(DeliveryMode::Partitioned.topic(&peer), Topic::partitioned(&peer));
        let secret = [7u8; 32];
        assert_eq!(
            DeliveryMode::SharedSecret(secret).topic(&peer),
            Topic::shared_secret(&secret)
        );
    }
}
