//! All-or-nothing persistence of chats, contacts and messages.

use crate::chats::upsert_chat;
use crate::contacts::upsert_contact;
use crate::database::Database;
use crate::error::Result;
use crate::messages::upsert_message;
use crate::models::{Chat, Contact, Message};

#[derive(Debug, Default, Clone)]
pub struct SaveBatch {
    pub chats: Vec<Chat>,
    pub contacts: Vec<Contact>,
    pub messages: Vec<Message>,
}

impl SaveBatch {
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty() && self.contacts.is_empty() && self.messages.is_empty()
    }
}

impl Database {
    /// Persist a batch in one transaction. On error nothing is written.
    pub fn save_batch(&mut self, batch: &SaveBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.conn_mut().transaction()?;
        for chat in &batch.chats {
            upsert_chat(&tx, chat)?;
        }
        for contact in &batch.contacts {
            upsert_contact(&tx, contact)?;
        }
        for message in &batch.messages {
            upsert_message(&tx, message)?;
        }
        tx.commit()?;

        tracing::debug!(
            chats = batch.chats.len(),
            contacts = batch.contacts.len(),
            messages = batch.messages.len(),
            "saved batch"
        );
        Ok(())
    }
}
