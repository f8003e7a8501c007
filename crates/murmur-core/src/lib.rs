//! Messaging core: encryption, data sync, the inbound pipeline and the
//! chat/group state machine behind [`Messenger`].

pub mod chat;
pub mod config;
pub mod contact;
pub mod datasync;
pub mod encryption;
pub mod error;
pub mod group;
pub mod messenger;
pub mod pipeline;
pub mod processor;
pub mod response;

use std::sync::{Arc, Mutex};

/// Store handle shared by the messenger and the encryption layer.
pub type SharedDatabase = Arc<Mutex<murmur_store::Database>>;

pub use config::MessengerConfig;
pub use error::{ChatResolutionError, MessengerError, Result, ValidationError};
pub use group::Group;
pub use messenger::{MessageBody, Messenger};
pub use response::MessengerResponse;
