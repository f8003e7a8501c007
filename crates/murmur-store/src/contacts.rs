use rusqlite::{params, Connection};

use murmur_shared::UserId;

use crate::database::Database;
use crate::error::{conversion_error, not_found, Result};
use crate::models::Contact;

impl Database {
    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        upsert_contact(self.conn(), contact)
    }

    pub fn get_contact(&self, id: &UserId) -> Result<Contact> {
        self.conn()
            .query_row(
                "SELECT id, name, alias, identicon, system_tags, last_updated, ens_verified
                 FROM contacts WHERE id = ?1",
                params![id.to_hex()],
                row_to_contact,
            )
            .map_err(not_found)
    }

    pub fn all_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, alias, identicon, system_tags, last_updated, ens_verified
             FROM contacts ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }
}

pub(crate) fn upsert_contact(conn: &Connection, contact: &Contact) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO contacts
             (id, name, alias, identicon, system_tags, last_updated, ens_verified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            contact.id.to_hex(),
            contact.name,
            contact.alias,
            contact.identicon,
            serde_json::to_string(&contact.system_tags)?,
            contact.last_updated as i64,
            contact.ens_verified,
        ],
    )?;
    Ok(())
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let id_hex: String = row.get(0)?;
    let id = UserId::from_hex(&id_hex).map_err(|e| conversion_error(0, e))?;

    let tags_json: String = row.get(4)?;
    let system_tags = serde_json::from_str(&tags_json).map_err(|e| conversion_error(4, e))?;

    Ok(Contact {
        id,
        name: row.get(1)?,
        alias: row.get(2)?,
        identicon: row.get(3)?,
        system_tags,
        last_updated: row.get::<_, i64>(5)? as u64,
        ens_verified: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TAG_CONTACT_ADDED;
    use murmur_shared::Identity;

    #[test]
    fn test_contact_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let id = Identity::generate().user_id();
        let mut contact = Contact {
            id,
            name: "alice".into(),
            alias: "Brave Quiet Heron".into(),
            identicon: "#a1b2c3".into(),
            system_tags: Vec::new(),
            last_updated: 0,
            ens_verified: false,
        };
        assert!(contact.add_tag(TAG_CONTACT_ADDED));
        assert!(!contact.add_tag(TAG_CONTACT_ADDED));
        db.save_contact(&contact).unwrap();

        contact.last_updated = 42;
        db.save_contact(&contact).unwrap();

        assert_eq!(db.get_contact(&id).unwrap(), contact);
        assert_eq!(db.all_contacts().unwrap().len(), 1);
    }
}
