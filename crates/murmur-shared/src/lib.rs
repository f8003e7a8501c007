//! Identity, addressing and wire types shared by every murmur crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use identity::Identity;
pub use types::{message_id, MessageId, Topic, UserId};
