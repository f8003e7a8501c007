//! Opaque key material owned by the encryption layer.
//!
//! Values are stored as blobs; their encoding belongs to the caller.

use rusqlite::{params, OptionalExtension};

use murmur_shared::UserId;

use crate::database::Database;
use crate::error::{conversion_error, Result};

impl Database {
    pub fn save_bundle(
        &self,
        identity: &UserId,
        installation_id: &str,
        timestamp: u64,
        data: &[u8],
    ) -> Result<()> {
        // An older bundle never replaces a newer one.
        self.conn().execute(
            "INSERT INTO bundles (identity, installation_id, timestamp, data)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity, installation_id) DO UPDATE SET
                 timestamp = excluded.timestamp,
                 data = excluded.data
             WHERE excluded.timestamp > bundles.timestamp",
            params![identity.to_hex(), installation_id, timestamp as i64, data],
        )?;
        Ok(())
    }

    /// Every stored bundle as `(identity, encoded bundle)`.
    pub fn all_bundles(&self) -> Result<Vec<(UserId, Vec<u8>)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT identity, data FROM bundles ORDER BY identity, installation_id")?;
        let rows = stmt.query_map([], |row| {
            let hex: String = row.get(0)?;
            let identity = UserId::from_hex(&hex).map_err(|e| conversion_error(0, e))?;
            Ok((identity, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut bundles = Vec::new();
        for row in rows {
            bundles.push(row?);
        }
        Ok(bundles)
    }

    pub fn save_session(&self, peer: &UserId, session_key: &str, data: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sessions (peer, session_key, data) VALUES (?1, ?2, ?3)",
            params![peer.to_hex(), session_key, data],
        )?;
        Ok(())
    }

    /// Every stored session as `(peer, session key, encoded session)`.
    pub fn all_sessions(&self) -> Result<Vec<(UserId, String, Vec<u8>)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT peer, session_key, data FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            let hex: String = row.get(0)?;
            let peer = UserId::from_hex(&hex).map_err(|e| conversion_error(0, e))?;
            Ok((peer, row.get::<_, String>(1)?, row.get::<_, Vec<u8>>(2)?))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    pub fn set_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO secrets (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }

    pub fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM secrets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }
}
