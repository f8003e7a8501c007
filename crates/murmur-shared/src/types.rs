use serde::{Deserialize, Serialize};

use crate::constants::{
    KDF_CONTEXT_TOPIC, PARTITIONS_COUNT, PUBKEY_SIZE, TOPIC_DISCOVERY, TOPIC_SIZE,
};
use crate::error::IdentityError;

// User identity = Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub [u8; PUBKEY_SIZE]);

impl UserId {
    /// Canonical textual form: lowercase hex with a `0x` prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse a hex-encoded key, with or without the `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed).map_err(|_| IdentityError::InvalidKeyBytes)?;
        if bytes.len() != PUBKEY_SIZE {
            return Err(IdentityError::InvalidKeyBytes);
        }
        let mut arr = [0u8; PUBKEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First eight hex characters of the key, used for display names.
    pub fn short(&self) -> String {
        hex::encode(self.0)[..8].to_string()
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_SIZE] {
        &self.0
    }

    /// X25519 public key matching this identity's Ed25519 key.
    pub fn dh_public(&self) -> Result<x25519_dalek::PublicKey, IdentityError> {
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(x25519_dalek::PublicKey::from(
            verifying.to_montgomery().to_bytes(),
        ))
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Canonical message identifier: BLAKE3(signer || payload).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the canonical ID of a payload signed by `signer`.
///
/// The same (signer, bytes) pair always yields the same ID, so a message keeps
/// its identity across re-encryption and re-transmission.
pub fn message_id(signer: &UserId, payload: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&signer.0);
    hasher.update(payload);
    MessageId(*hasher.finalize().as_bytes())
}

/// A pub/sub topic on the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(pub String);

impl Topic {
    /// Topic of a public chat, derived from its name.
    pub fn public(name: &str) -> Self {
        Self::derive("public", name.as_bytes())
    }

    /// Topic partitioned by the recipient's key, for pre-discovery clients.
    pub fn partitioned(user: &UserId) -> Self {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&user.0[..8]);
        let partition = u64::from_be_bytes(prefix) % PARTITIONS_COUNT;
        Self::derive("partitioned", format!("contact-discovery-{partition}").as_bytes())
    }

    /// Shared discovery topic every node listens on.
    pub fn discovery() -> Self {
        Self::derive("discovery", TOPIC_DISCOVERY.as_bytes())
    }

    /// Topic negotiated from a shared secret between two peers.
    pub fn shared_secret(secret: &[u8; 32]) -> Self {
        Self::derive("secret", secret)
    }

    fn derive(namespace: &str, material: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_TOPIC);
        hasher.update(namespace.as_bytes());
        hasher.update(material);
        let hash = hasher.finalize();
        Self(format!(
            "{namespace}:{}",
            hex::encode(&hash.as_bytes()[..TOPIC_SIZE])
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_user_id_hex_roundtrip() {
        let id = Identity::generate().user_id();
        let hex = id.to_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(UserId::from_hex(&hex).unwrap(), id);
        assert_eq!(UserId::from_hex(&hex[2..]).unwrap(), id);
    }

    #[test]
    fn test_user_id_rejects_wrong_length() {
        assert!(UserId::from_hex("0xabcd").is_err());
        assert!(UserId::from_hex("zz").is_err());
    }

    #[test]
    fn test_message_id_is_deterministic() {
        let signer = Identity::generate().user_id();
        let payload = b"hello";
        assert_eq!(message_id(&signer, payload), message_id(&signer, payload));
    }

    #[test]
    fn test_message_id_depends_on_signer() {
        let a = Identity::generate().user_id();
        let b = Identity::generate().user_id();
        assert_ne!(message_id(&a, b"same"), message_id(&b, b"same"));
    }

    #[test]
    fn test_topics_are_namespaced() {
        let user = Identity::generate().user_id();
        assert!(Topic::public("status").as_str().starts_with("public:"));
        assert!(Topic::partitioned(&user).as_str().starts_with("partitioned:"));
        assert_eq!(Topic::discovery(), Topic::discovery());
        assert_ne!(Topic::public("a"), Topic::public("b"));
    }
}
