use thiserror::Error;

use murmur_net::TransportError;
use murmur_shared::error::{CodecError, IdentityError};
use murmur_shared::protocol::ChatType;
use murmur_store::StoreError;

use crate::datasync::SyncError;
use crate::encryption::EncryptionError;

/// Errors returned synchronously by messenger operations.
#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Invalid membership update: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Operation not supported for {0:?} chats")]
    InvalidChatType(ChatType),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Why an inbound message could not be attached to a chat.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatResolutionError {
    #[error("public chat {0} is not joined")]
    PublicChatNotFound(String),

    #[error("invalid one-to-one chat id {0}")]
    InvalidChatId(String),

    #[error("chat {chat_id} exists with type {existing:?}")]
    ChatTypeMismatch { chat_id: String, existing: ChatType },

    #[error("no matching group chat {chat_id}: {reason}")]
    NoMatchingGroupChat { chat_id: String, reason: String },
}

/// Structural problems with a membership update message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("membership update carries no events")]
    NoEvents,

    #[error("event for chat {event} inside update for chat {update}")]
    ChatIdMismatch { update: String, event: String },

    #[error("event signature from {0} does not verify")]
    InvalidSignature(String),

    #[error("chat id {0} does not end with the creator key")]
    InvalidCreator(String),
}

pub type Result<T> = std::result::Result<T, MessengerError>;
