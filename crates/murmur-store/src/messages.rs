use rusqlite::{params, Connection, OptionalExtension};

use murmur_shared::protocol::ContentType;
use murmur_shared::{MessageId, UserId};

use crate::database::Database;
use crate::error::{conversion_error, invalid_column, not_found, Result};
use crate::models::{Message, OutgoingStatus};

const MESSAGE_COLUMNS: &str = "id, chat_id, sender, clock, whisper_timestamp, timestamp, text,
     content_type, outgoing_status, seen, response_to";

impl Database {
    pub fn save_message(&self, message: &Message) -> Result<()> {
        upsert_message(self.conn(), message)
    }

    pub fn get_message_by_id(&self, id: &MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_hex()],
                row_to_message,
            )
            .map_err(not_found)
    }

    pub fn message_exists(&self, id: &MessageId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![id.to_hex()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Newest-first page of a chat's messages.
    pub fn get_messages_for_chat(
        &self,
        chat_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE chat_id = ?1
             ORDER BY clock DESC, id
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(params![chat_id, limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Mark the given messages of `chat_id` as seen. Returns how many changed.
    pub fn mark_messages_seen(&mut self, chat_id: &str, ids: &[MessageId]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET seen = 1 WHERE chat_id = ?1 AND id = ?2 AND seen = 0",
            )?;
            for id in ids {
                changed += stmt.execute(params![chat_id, id.to_hex()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn count_unseen(&self, chat_id: &str) -> Result<u32> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND seen = 0",
            params![chat_id],
            |row| row.get(0),
        )?)
    }

    /// Set the outgoing status of our own messages. Returns how many changed.
    pub fn update_outgoing_status(&self, ids: &[MessageId], status: OutgoingStatus) -> Result<usize> {
        let mut stmt = self.conn().prepare_cached(
            "UPDATE messages SET outgoing_status = ?1
             WHERE id = ?2 AND outgoing_status IS NOT NULL AND outgoing_status != ?1",
        )?;
        let mut changed = 0;
        for id in ids {
            changed += stmt.execute(params![status.as_str(), id.to_hex()])?;
        }
        Ok(changed)
    }

    pub fn delete_messages_for_chat(&self, chat_id: &str) -> Result<usize> {
        Ok(self
            .conn()
            .execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id])?)
    }
}

pub(crate) fn upsert_message(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, chat_id, sender, clock, whisper_timestamp, timestamp, text,
                               content_type, outgoing_status, seen, response_to)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
             outgoing_status = excluded.outgoing_status,
             seen = excluded.seen",
        params![
            message.id.to_hex(),
            message.chat_id,
            message.from.to_hex(),
            message.clock as i64,
            message.whisper_timestamp as i64,
            message.timestamp as i64,
            message.text,
            message.content_type.as_str(),
            message.outgoing_status.map(|s| s.as_str()),
            message.seen,
            message.response_to.map(|id| id.to_hex()),
        ],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_hex: String = row.get(0)?;
    let sender_hex: String = row.get(2)?;
    let content_type_str: String = row.get(7)?;
    let status_str: Option<String> = row.get(8)?;
    let response_hex: Option<String> = row.get(10)?;

    let id = MessageId::from_hex(&id_hex).map_err(|e| conversion_error(0, e))?;
    let from = UserId::from_hex(&sender_hex).map_err(|e| conversion_error(2, e))?;
    let content_type = ContentType::parse(&content_type_str)
        .ok_or_else(|| invalid_column(7, "content_type", &content_type_str))?;
    let outgoing_status = match status_str {
        Some(s) => Some(OutgoingStatus::parse(&s).ok_or_else(|| invalid_column(8, "outgoing_status", &s))?),
        None => None,
    };
    let response_to = response_hex
        .map(|s| MessageId::from_hex(&s).map_err(|e| conversion_error(10, e)))
        .transpose()?;

    Ok(Message {
        id,
        chat_id: row.get(1)?,
        from,
        clock: row.get::<_, i64>(3)? as u64,
        whisper_timestamp: row.get::<_, i64>(4)? as u64,
        timestamp: row.get::<_, i64>(5)? as u64,
        text: row.get(6)?,
        content_type,
        outgoing_status,
        seen: row.get(9)?,
        response_to,
    })
}
