use rusqlite::{params, Connection};

use murmur_shared::protocol::{ChatType, MembershipUpdateEvent};
use murmur_shared::MessageId;

use crate::database::Database;
use crate::error::{conversion_error, invalid_column, not_found, Result};
use crate::models::Chat;

const CHAT_COLUMNS: &str = "id, chat_type, name, active, timestamp, last_clock_value,
     deleted_at_clock_value, unviewed_count, last_message_id";

impl Database {
    /// Insert or update a chat together with any membership events not yet stored.
    pub fn save_chat(&self, chat: &Chat) -> Result<()> {
        upsert_chat(self.conn(), chat)
    }

    pub fn get_chat(&self, id: &str) -> Result<Chat> {
        let mut chat = self
            .conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id],
                row_to_chat,
            )
            .map_err(not_found)?;
        chat.membership_updates = self.membership_events(id)?;
        Ok(chat)
    }

    /// All chats, most recently active first.
    pub fn all_chats(&self) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats ORDER BY last_clock_value DESC, id"
        ))?;
        let rows = stmt.query_map([], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            let mut chat = row?;
            chat.membership_updates = self.membership_events(&chat.id)?;
            chats.push(chat);
        }
        Ok(chats)
    }

    /// Membership log of a chat in `(clock, signature)` order.
    pub fn membership_events(&self, chat_id: &str) -> Result<Vec<MembershipUpdateEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT data FROM membership_events
             WHERE chat_id = ?1
             ORDER BY clock ASC, signature ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| row.get::<_, Vec<u8>>(0))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(bincode::deserialize(&row?)?);
        }
        Ok(events)
    }

    /// Hard-delete a chat, its membership log and its messages.
    pub fn delete_chat(&mut self, id: &str) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![id])?;
        let affected = tx.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(affected > 0)
    }
}

pub(crate) fn upsert_chat(conn: &Connection, chat: &Chat) -> Result<()> {
    conn.execute(
        "INSERT INTO chats (id, chat_type, name, active, timestamp, last_clock_value,
                            deleted_at_clock_value, unviewed_count, last_message_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             active = excluded.active,
             last_clock_value = excluded.last_clock_value,
             deleted_at_clock_value = excluded.deleted_at_clock_value,
             unviewed_count = excluded.unviewed_count,
             last_message_id = excluded.last_message_id",
        params![
            chat.id,
            chat.chat_type.as_str(),
            chat.name,
            chat.active,
            chat.timestamp as i64,
            chat.last_clock_value as i64,
            chat.deleted_at_clock_value as i64,
            chat.unviewed_count,
            chat.last_message_id.map(|id| id.to_hex()),
        ],
    )?;

    // The log is append-only: known signatures are left untouched.
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO membership_events (chat_id, signature, clock, data)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for event in &chat.membership_updates {
        stmt.execute(params![
            chat.id,
            hex::encode(&event.signature),
            event.clock as i64,
            bincode::serialize(event)?,
        ])?;
    }
    Ok(())
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let chat_type_str: String = row.get(1)?;
    let chat_type =
        ChatType::parse(&chat_type_str).ok_or_else(|| invalid_column(1, "chat_type", &chat_type_str))?;

    let last_message_id = row
        .get::<_, Option<String>>(8)?
        .map(|s| MessageId::from_hex(&s).map_err(|e| conversion_error(8, e)))
        .transpose()?;

    Ok(Chat {
        id: row.get(0)?,
        chat_type,
        name: row.get(2)?,
        active: row.get(3)?,
        timestamp: row.get::<_, i64>(4)? as u64,
        last_clock_value: row.get::<_, i64>(5)? as u64,
        deleted_at_clock_value: row.get::<_, i64>(6)? as u64,
        unviewed_count: row.get(7)?,
        last_message_id,
        membership_updates: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::Identity;

    #[test]
    fn test_chat_round_trip_with_membership_log() {
        let db = Database::open_in_memory().unwrap();
        let creator = Identity::generate();
        let chat_id = format!("group-{}", creator.user_id().to_hex());

        let mut chat = Chat::new(&chat_id, ChatType::PrivateGroup, "friends", 1_000);
        let created = MembershipUpdateEvent::chat_created(&creator, &chat_id, "friends", 2).unwrap();
        let added = MembershipUpdateEvent::members_added(
            &creator,
            &chat_id,
            vec![Identity::generate().user_id()],
            1,
        )
        .unwrap();
        chat.membership_updates = vec![created.clone(), added.clone()];
        db.save_chat(&chat).unwrap();

        // Saving again with the same events must not duplicate them.
        chat.last_clock_value = 9;
        db.save_chat(&chat).unwrap();

        let loaded = db.get_chat(&chat_id).unwrap();
        assert_eq!(loaded.last_clock_value, 9);
        assert_eq!(loaded.membership_updates, vec![added, created]);
    }

    #[test]
    fn test_missing_chat_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_chat("nope"), Err(crate::StoreError::NotFound)));
    }

    #[test]
    fn test_delete_chat() {
        let mut db = Database::open_in_memory().unwrap();
        db.save_chat(&Chat::new("status", ChatType::Public, "status", 1)).unwrap();
        assert_eq!(db.all_chats().unwrap().len(), 1);
        assert!(db.delete_chat("status").unwrap());
        assert!(db.all_chats().unwrap().is_empty());
    }
}
