//! Application-level wire messages.
//!
//! Every structure here is bincode-encoded so that signatures and content
//! hashes computed by one peer can be recomputed byte-for-byte by another.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::constants::METADATA_MAGIC;
use crate::error::{CodecError, IdentityError};
use crate::identity::{verify_signature, Identity};
use crate::types::{MessageId, UserId};

/// Encode `value` with a 4-byte magic prefix.
pub fn encode_framed<T: Serialize>(magic: [u8; 4], value: &T) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(magic.len() + body.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a magic-prefixed value. Returns `Ok(None)` when the prefix is absent,
/// so callers can pass unrelated payloads through untouched.
pub fn decode_framed<T: DeserializeOwned>(
    magic: [u8; 4],
    data: &[u8],
) -> Result<Option<T>, CodecError> {
    match data.strip_prefix(&magic[..]) {
        Some(body) => Ok(Some(bincode::deserialize(body)?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChatType {
    OneToOne,
    Public,
    PrivateGroup,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::OneToOne => "one_to_one",
            ChatType::Public => "public",
            ChatType::PrivateGroup => "private_group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_to_one" => Some(ChatType::OneToOne),
            "public" => Some(ChatType::Public),
            "private_group" => Some(ChatType::PrivateGroup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContentType {
    Text,
    Emoji,
    SystemMembership,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Emoji => "emoji",
            ContentType::SystemMembership => "system_membership",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentType::Text),
            "emoji" => Some(ContentType::Emoji),
            "system_membership" => Some(ContentType::SystemMembership),
            _ => None,
        }
    }
}

/// Tag carried in the signed metadata envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    ChatMessage,
    MembershipUpdate,
    PairInstallation,
    ContactUpdate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ChatMessage => "chat_message",
            MessageType::MembershipUpdate => "membership_update",
            MessageType::PairInstallation => "pair_installation",
            MessageType::ContactUpdate => "contact_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat_message" => Some(MessageType::ChatMessage),
            "membership_update" => Some(MessageType::MembershipUpdate),
            "pair_installation" => Some(MessageType::PairInstallation),
            "contact_update" => Some(MessageType::ContactUpdate),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Application messages
// ---------------------------------------------------------------------------

/// A plain chat message as it travels between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Lamport clock of the chat at send time
    pub clock: u64,
    /// Sender wall-clock time in milliseconds
    pub timestamp: u64,
    pub text: String,
    /// Chat ID from the sender's point of view
    pub chat_id: String,
    pub response_to: Option<MessageId>,
    pub chat_type: ChatType,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MembershipEventKind {
    ChatCreated,
    NameChanged,
    MembersAdded,
    MemberJoined,
    MemberRemoved,
    AdminsAdded,
}

/// A signed, immutable entry of a group chat's membership log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MembershipUpdateEvent {
    pub chat_id: String,
    pub kind: MembershipEventKind,
    pub clock: u64,
    pub member: Option<UserId>,
    /// Always sorted and deduplicated.
    pub members: Vec<UserId>,
    pub name: Option<String>,
    pub from: UserId,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct EventSigningView<'a> {
    chat_id: &'a str,
    kind: MembershipEventKind,
    clock: u64,
    member: &'a Option<UserId>,
    members: &'a [UserId],
    name: &'a Option<String>,
    from: &'a UserId,
}

impl MembershipUpdateEvent {
    fn signed(
        identity: &Identity,
        chat_id: &str,
        kind: MembershipEventKind,
        clock: u64,
        member: Option<UserId>,
        mut members: Vec<UserId>,
        name: Option<String>,
    ) -> Result<Self, CodecError> {
        members.sort();
        members.dedup();
        let mut event = Self {
            chat_id: chat_id.to_string(),
            kind,
            clock,
            member,
            members,
            name,
            from: identity.user_id(),
            signature: Vec::new(),
        };
        event.signature = identity.sign(&event.signing_bytes()?).to_bytes().to_vec();
        Ok(event)
    }

    pub fn chat_created(
        identity: &Identity,
        chat_id: &str,
        name: &str,
        clock: u64,
    ) -> Result<Self, CodecError> {
        let kind = MembershipEventKind::ChatCreated;
        Self::signed(identity, chat_id, kind, clock, None, Vec::new(), Some(name.to_string()))
    }

    pub fn name_changed(
        identity: &Identity,
        chat_id: &str,
        name: &str,
        clock: u64,
    ) -> Result<Self, CodecError> {
        let kind = MembershipEventKind::NameChanged;
        Self::signed(identity, chat_id, kind, clock, None, Vec::new(), Some(name.to_string()))
    }

    pub fn members_added(
        identity: &Identity,
        chat_id: &str,
        members: Vec<UserId>,
        clock: u64,
    ) -> Result<Self, CodecError> {
        let kind = MembershipEventKind::MembersAdded;
        Self::signed(identity, chat_id, kind, clock, None, members, None)
    }

    pub fn member_joined(
        identity: &Identity,
        chat_id: &str,
        clock: u64,
    ) -> Result<Self, CodecError> {
        let kind = MembershipEventKind::MemberJoined;
        let me = identity.user_id();
        Self::signed(identity, chat_id, kind, clock, Some(me), Vec::new(), None)
    }

    pub fn member_removed(
        identity: &Identity,
        chat_id: &str,
        member: UserId,
        clock: u64,
    ) -> Result<Self, CodecError> {
        let kind = MembershipEventKind::MemberRemoved;
        Self::signed(identity, chat_id, kind, clock, Some(member), Vec::new(), None)
    }

    pub fn admins_added(
        identity: &Identity,
        chat_id: &str,
        admins: Vec<UserId>,
        clock: u64,
    ) -> Result<Self, CodecError> {
        let kind = MembershipEventKind::AdminsAdded;
        Self::signed(identity, chat_id, kind, clock, None, admins, None)
    }

    /// Canonical bytes covered by the signature: every field except the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let view = EventSigningView {
            chat_id: &self.chat_id,
            kind: self.kind,
            clock: self.clock,
            member: &self.member,
            members: &self.members,
            name: &self.name,
            from: &self.from,
        };
        bincode::serialize(&view).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn verify(&self) -> Result<(), IdentityError> {
        let bytes = self
            .signing_bytes()
            .map_err(|_| IdentityError::InvalidSignature)?;
        verify_signature(&self.from, &bytes, &self.signature)
    }

    /// Deterministic ID of the system message announcing this event.
    pub fn system_message_id(&self) -> MessageId {
        MessageId(*blake3::hash(&self.signature).as_bytes())
    }
}

/// A batch of membership events for one group, optionally carrying a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipUpdateMessage {
    pub chat_id: String,
    pub events: Vec<MembershipUpdateEvent>,
    pub message: Option<ChatMessage>,
}

/// Announces a device of the sender's own identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairInstallation {
    pub clock: u64,
    pub installation_id: String,
    pub device_type: String,
    pub name: String,
}

/// Profile update pushed to a contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactUpdate {
    pub clock: u64,
    pub name: String,
}

/// Closed set of application messages understood by the messenger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplicationMessage {
    Chat(ChatMessage),
    MembershipUpdate(MembershipUpdateMessage),
    PairInstallation(PairInstallation),
    ContactUpdate(ContactUpdate),
    Unknown,
}

impl ApplicationMessage {
    pub fn kind(&self) -> Option<MessageType> {
        match self {
            ApplicationMessage::Chat(_) => Some(MessageType::ChatMessage),
            ApplicationMessage::MembershipUpdate(_) => Some(MessageType::MembershipUpdate),
            ApplicationMessage::PairInstallation(_) => Some(MessageType::PairInstallation),
            ApplicationMessage::ContactUpdate(_) => Some(MessageType::ContactUpdate),
            ApplicationMessage::Unknown => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode an application payload. Anything undecodable becomes `Unknown`.
    pub fn from_bytes(data: &[u8]) -> Self {
        bincode::deserialize(data).unwrap_or(ApplicationMessage::Unknown)
    }
}

// ---------------------------------------------------------------------------
// Detached-signature envelope
// ---------------------------------------------------------------------------

/// Wraps an encoded application message with the author's signature.
///
/// The signer recorded here is authoritative over whoever relayed the bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationMetadata {
    pub signer: UserId,
    pub signature: Vec<u8>,
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl ApplicationMetadata {
    fn signing_bytes(kind: MessageType, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(&(kind, payload)).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Sign `payload` and return the framed envelope bytes.
    pub fn wrap(
        identity: &Identity,
        kind: MessageType,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CodecError> {
        let signature = identity
            .sign(&Self::signing_bytes(kind, &payload)?)
            .to_bytes()
            .to_vec();
        let metadata = Self {
            signer: identity.user_id(),
            signature,
            kind,
            payload,
        };
        encode_framed(METADATA_MAGIC, &metadata)
    }

    /// Returns `Ok(None)` when `data` is not a metadata envelope.
    pub fn unwrap(data: &[u8]) -> Result<Option<Self>, CodecError> {
        decode_framed(METADATA_MAGIC, data)
    }

    pub fn verify(&self) -> Result<(), IdentityError> {
        let bytes = Self::signing_bytes(self.kind, &self.payload)
            .map_err(|_| IdentityError::InvalidSignature)?;
        verify_signature(&self.signer, &bytes, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_message() -> ChatMessage {
        ChatMessage {
            clock: 7,
            timestamp: 1_700_000_000_000,
            text: "hi there".into(),
            chat_id: "status".into(),
            response_to: None,
            chat_type: ChatType::Public,
            content_type: ContentType::Text,
        }
    }

    #[test]
    fn test_metadata_wrap_is_deterministic_and_verifiable() {
        let id = Identity::generate();
        let payload = ApplicationMessage::Chat(chat_message()).to_bytes().unwrap();

        let first = ApplicationMetadata::wrap(&id, MessageType::ChatMessage, payload.clone()).unwrap();
        let second = ApplicationMetadata::wrap(&id, MessageType::ChatMessage, payload.clone()).unwrap();
        assert_eq!(first, second);

        let metadata = ApplicationMetadata::unwrap(&first).unwrap().unwrap();
        assert_eq!(metadata.signer, id.user_id());
        assert!(metadata.verify().is_ok());
        assert_eq!(metadata.payload, payload);
    }

    #[test]
    fn test_metadata_tampered_payload_fails_verification() {
        let id = Identity::generate();
        let bytes = ApplicationMetadata::wrap(&id, MessageType::ChatMessage, vec![1, 2, 3]).unwrap();
        let mut metadata = ApplicationMetadata::unwrap(&bytes).unwrap().unwrap();
        metadata.payload.push(4);
        assert!(metadata.verify().is_err());
    }

    #[test]
    fn test_unframed_payload_is_not_metadata() {
        assert!(ApplicationMetadata::unwrap(b"plain bytes").unwrap().is_none());
    }

    #[test]
    fn test_garbage_decodes_to_unknown() {
        assert_eq!(
            ApplicationMessage::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            ApplicationMessage::Unknown
        );
    }

    #[test]
    fn test_membership_event_signature() {
        let id = Identity::generate();
        let other = Identity::generate().user_id();
        let event = MembershipUpdateEvent::members_added(
            &id,
            "chat",
            vec![other, other],
            3,
        )
        .unwrap();
        assert_eq!(event.members, vec![other]);
        assert!(event.verify().is_ok());

        let mut forged = event.clone();
        forged.clock = 4;
        assert!(forged.verify().is_err());
    }

    #[test]
    fn test_system_message_id_is_stable() {
        let id = Identity::generate();
        let event = MembershipUpdateEvent::chat_created(&id, "chat", "name", 1).unwrap();
        assert_eq!(event.system_message_id(), event.clone().system_message_id());
    }
}
