use thiserror::Error;

use murmur_shared::error::{CodecError, IdentityError};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Envelope signature invalid: {0}")]
    InvalidEnvelope(#[from] IdentityError),

    #[error("Envelope payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Swarm command channel closed")]
    ChannelClosed,

    #[error("Swarm error: {0}")]
    Swarm(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
