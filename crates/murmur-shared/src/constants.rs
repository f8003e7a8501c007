//! Protocol constants shared by every layer.

// Transport

/// libp2p identify protocol string.
pub const PROTOCOL_VERSION: &str = "/murmur/1.0.0";
pub const DEFAULT_QUIC_PORT: u16 = 4001;
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;
/// Largest envelope payload accepted on the wire (256 KiB).
pub const MAX_MESSAGE_SIZE: usize = 262_144;
pub const ENVELOPE_TTL_SECS: u32 = 15;

// Topics

/// Partitioned discovery topics a one-to-one peer is hashed onto.
pub const PARTITIONS_COUNT: u64 = 5000;
/// Bytes of the topic hash kept in a topic name.
pub const TOPIC_SIZE: usize = 4;
pub const TOPIC_DISCOVERY: &str = "contact-discovery";

// Framing. Each layer recognises its payloads by a four byte prefix.

pub const SYNC_MAGIC: [u8; 4] = *b"msyn";
pub const ENCRYPTION_MAGIC: [u8; 4] = *b"menc";
pub const METADATA_MAGIC: [u8; 4] = *b"mmd1";

// Key material

/// XChaCha20-Poly1305 nonce.
pub const NONCE_SIZE: usize = 24;
pub const SYMMETRIC_KEY_SIZE: usize = 32;
/// Ed25519 public key.
pub const PUBKEY_SIZE: usize = 32;

// BLAKE3 derive_key contexts

pub const KDF_CONTEXT_TOPIC: &str = "murmur-topic-v1";
pub const KDF_CONTEXT_DH_ROOT: &str = "murmur-dh-root-v1";
pub const KDF_CONTEXT_CHAIN_KEY: &str = "murmur-chain-key-v1";
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "murmur-message-key-v1";
pub const KDF_CONTEXT_SHARED_SECRET: &str = "murmur-shared-secret-v1";
pub const KDF_CONTEXT_BUNDLE_KEY: &str = "murmur-bundle-key-v1";
