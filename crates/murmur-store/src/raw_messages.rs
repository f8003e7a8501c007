use rusqlite::params;

use murmur_shared::protocol::MessageType;
use murmur_shared::{MessageId, UserId};

use crate::database::Database;
use crate::error::{conversion_error, invalid_column, not_found, Result};
use crate::models::RawMessage;

impl Database {
    pub fn save_raw_message(&self, raw: &RawMessage) -> Result<()> {
        let recipients: Vec<String> = raw.recipients.iter().map(UserId::to_hex).collect();
        self.conn().execute(
            "INSERT OR REPLACE INTO raw_messages
                 (id, local_chat_id, payload, message_type, recipients, send_count, sent, last_sent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                raw.id.to_hex(),
                raw.local_chat_id,
                raw.payload,
                raw.message_type.as_str(),
                serde_json::to_string(&recipients)?,
                raw.send_count,
                raw.sent,
                raw.last_sent as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_raw_message(&self, id: &MessageId) -> Result<RawMessage> {
        self.conn()
            .query_row(
                "SELECT id, local_chat_id, payload, message_type, recipients, send_count, sent, last_sent
                 FROM raw_messages WHERE id = ?1",
                params![id.to_hex()],
                row_to_raw_message,
            )
            .map_err(not_found)
    }

    /// Record another dispatch of a raw message.
    pub fn record_raw_send(&self, id: &MessageId, now: u64) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE raw_messages SET send_count = send_count + 1, last_sent = ?2 WHERE id = ?1",
            params![id.to_hex(), now as i64],
        )?;
        if affected == 0 {
            return Err(crate::StoreError::NotFound);
        }
        Ok(())
    }

    /// Flag raw messages as confirmed by the transport.
    pub fn mark_raw_messages_sent(&self, ids: &[MessageId]) -> Result<usize> {
        let mut stmt = self
            .conn()
            .prepare_cached("UPDATE raw_messages SET sent = 1 WHERE id = ?1 AND sent = 0")?;
        let mut changed = 0;
        for id in ids {
            changed += stmt.execute(params![id.to_hex()])?;
        }
        Ok(changed)
    }
}

fn row_to_raw_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    let id_hex: String = row.get(0)?;
    let type_str: String = row.get(3)?;
    let recipients_json: String = row.get(4)?;

    let id = MessageId::from_hex(&id_hex).map_err(|e| conversion_error(0, e))?;
    let message_type =
        MessageType::parse(&type_str).ok_or_else(|| invalid_column(3, "message_type", &type_str))?;
    let recipient_hexes: Vec<String> =
        serde_json::from_str(&recipients_json).map_err(|e| conversion_error(4, e))?;
    let recipients = recipient_hexes
        .iter()
        .map(|s| UserId::from_hex(s).map_err(|e| conversion_error(4, e)))
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(RawMessage {
        id,
        local_chat_id: row.get(1)?,
        payload: row.get(2)?,
        message_type,
        recipients,
        send_count: row.get(5)?,
        sent: row.get(6)?,
        last_sent: row.get::<_, i64>(7)? as u64,
    })
}
