use rusqlite::params;

use murmur_shared::UserId;

use crate::database::Database;
use crate::error::{conversion_error, Result};
use crate::models::Installation;

impl Database {
    pub fn save_installation(&self, installation: &Installation) -> Result<()> {
        self.conn().execute(
            "INSERT INTO installations (identity, id, enabled, name, device_type, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(identity, id) DO UPDATE SET
                 name = excluded.name,
                 device_type = excluded.device_type,
                 timestamp = excluded.timestamp",
            params![
                installation.identity.to_hex(),
                installation.id,
                installation.enabled,
                installation.name,
                installation.device_type,
                installation.timestamp as i64,
            ],
        )?;
        Ok(())
    }

    pub fn set_installation_enabled(&self, identity: &UserId, id: &str, enabled: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE installations SET enabled = ?3 WHERE identity = ?1 AND id = ?2",
            params![identity.to_hex(), id, enabled],
        )?;
        Ok(affected > 0)
    }

    pub fn installations_for(&self, identity: &UserId) -> Result<Vec<Installation>> {
        let mut stmt = self.conn().prepare(
            "SELECT identity, id, enabled, name, device_type, timestamp
             FROM installations WHERE identity = ?1 ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map(params![identity.to_hex()], |row| {
            let identity_hex: String = row.get(0)?;
            Ok(Installation {
                identity: UserId::from_hex(&identity_hex).map_err(|e| conversion_error(0, e))?,
                id: row.get(1)?,
                enabled: row.get(2)?,
                name: row.get(3)?,
                device_type: row.get(4)?,
                timestamp: row.get::<_, i64>(5)? as u64,
            })
        })?;

        let mut installations = Vec::new();
        for row in rows {
            installations.push(row?);
        }
        Ok(installations)
    }
}
