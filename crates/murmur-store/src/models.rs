//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to callers in a messenger response.

use serde::{Deserialize, Serialize};

use murmur_shared::protocol::{ChatType, ContentType, MembershipUpdateEvent, MessageType};
use murmur_shared::{MessageId, UserId};

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation: public channel, one-to-one chat or private group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    /// Public chat name, peer key hex, or `<uuid>-<creator hex>` for groups.
    pub id: String,
    pub chat_type: ChatType,
    pub name: String,
    /// Soft-deletion flag. Inactive chats keep their history.
    pub active: bool,
    /// Creation time in milliseconds.
    pub timestamp: u64,
    /// Highest clock value seen in this chat.
    pub last_clock_value: u64,
    /// Messages at or below this clock are ignored.
    pub deleted_at_clock_value: u64,
    pub unviewed_count: u32,
    pub last_message_id: Option<MessageId>,
    /// Group membership log, sorted by `(clock, signature)`. Empty for other chat types.
    pub membership_updates: Vec<MembershipUpdateEvent>,
}

impl Chat {
    pub fn new(id: impl Into<String>, chat_type: ChatType, name: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            chat_type,
            name: name.into(),
            active: true,
            timestamp: now,
            last_clock_value: 0,
            deleted_at_clock_value: 0,
            unviewed_count: 0,
            last_message_id: None,
            membership_updates: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

pub const TAG_CONTACT_ADDED: &str = ":contact/added";
pub const TAG_REQUEST_RECEIVED: &str = ":contact/request-received";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: UserId,
    /// Name announced by the contact itself.
    pub name: String,
    /// Deterministic display alias derived from the key.
    pub alias: String,
    pub identicon: String,
    pub system_tags: Vec<String>,
    /// Clock of the last accepted contact update.
    pub last_updated: u64,
    pub ens_verified: bool,
}

impl Contact {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.system_tags.iter().any(|t| t == tag)
    }

    /// Add `tag` unless already present. Returns whether the contact changed.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.has_tag(tag) {
            return false;
        }
        self.system_tags.push(tag.to_string());
        true
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutgoingStatus {
    Sending,
    Sent,
}

impl OutgoingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutgoingStatus::Sending => "sending",
            OutgoingStatus::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(OutgoingStatus::Sending),
            "sent" => Some(OutgoingStatus::Sent),
            _ => None,
        }
    }
}

/// A user-visible message in a chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Content hash over the signer key and the signed payload.
    pub id: MessageId,
    pub chat_id: String,
    pub from: UserId,
    pub clock: u64,
    /// Transport timestamp in milliseconds.
    pub whisper_timestamp: u64,
    /// Sender timestamp in milliseconds.
    pub timestamp: u64,
    pub text: String,
    pub content_type: ContentType,
    /// `None` for inbound messages.
    pub outgoing_status: Option<OutgoingStatus>,
    pub seen: bool,
    pub response_to: Option<MessageId>,
}

// ---------------------------------------------------------------------------
// Raw message
// ---------------------------------------------------------------------------

/// A signed outbound payload kept so it can be re-sent under the same ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    pub local_chat_id: String,
    /// Metadata-wrapped application payload.
    pub payload: Vec<u8>,
    pub message_type: MessageType,
    pub recipients: Vec<UserId>,
    pub send_count: u32,
    pub sent: bool,
    pub last_sent: u64,
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

/// A device belonging to an identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Installation {
    pub id: String,
    pub identity: UserId,
    pub enabled: bool,
    pub name: String,
    pub device_type: String,
    pub timestamp: u64,
}
