//! # murmur-store
//!
//! Local SQLite persistence for the murmur messenger.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model, plus [`Database::save_batch`] which writes chats, contacts and
//! messages in a single transaction.

pub mod batch;
pub mod chats;
pub mod contacts;
pub mod database;
pub mod installations;
pub mod keys;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod raw_messages;

mod error;

pub use batch::SaveBatch;
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
