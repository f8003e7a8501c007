//! Schema migrations, applied in order when a [`Database`] is opened.
//!
//! SQLite's `user_version` pragma records the last applied step. Each step
//! runs in its own transaction together with the version bump.
//!
//! [`Database`]: crate::Database

mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial",
    sql: v001_initial::SQL,
}];

pub(crate) fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to the newest version.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied = schema_version(conn)?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying migration"
        );
        let fail = |e: rusqlite::Error| {
            StoreError::Migration(format!("v{:03} {}: {e}", migration.version, migration.name))
        };
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql).map_err(fail)?;
        tx.pragma_update(None, "user_version", migration.version)
            .map_err(fail)?;
        tx.commit()?;
    }

    Ok(())
}
