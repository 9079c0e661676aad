//! Schema versioning: create, keep, or destructively rebuild

use rusqlite::{Connection, TransactionBehavior};

use super::{queries, APPLICATION_ID, SCHEMA_VERSION};
use crate::error::{Error, Result, ResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Schema already at the expected version
    Current,
    /// Fresh file, schema created
    Created,
    /// Stale version; every table and view was dropped and recreated
    Reset { from: i32 },
}

/// Bring the schema to [`SCHEMA_VERSION`] inside one exclusive transaction.
///
/// Foreign-key enforcement cannot change inside a transaction, so it is
/// switched off around the whole migration and left off; the caller turns it
/// back on once the schema is settled.
pub(super) fn migrate(conn: &mut Connection) -> Result<Migration> {
    migrate_to(conn, queries::SCHEMA)
}

fn migrate_to(conn: &mut Connection, schema: &str) -> Result<Migration> {
    conn.pragma_update(None, "foreign_keys", false)
        .context("Failed to disable foreign keys for migration")?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .context("Failed to start migration transaction")?;

    let tag: i32 = tx
        .pragma_query_value(None, "application_id", |row| row.get(0))
        .context("Failed to read application id")?;
    let version: i32 = tx
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("Failed to read schema version")?;
    let existing = schema_objects(&tx)?;

    let outcome = match tag {
        APPLICATION_ID if version == SCHEMA_VERSION => return Ok(Migration::Current),
        APPLICATION_ID => {
            drop_all(&tx, &existing)?;
            Migration::Reset { from: version }
        }
        0 if existing.is_empty() => Migration::Created,
        0 => {
            return Err(Error::Store(format!(
                "file has {} tables but no cache tag; refusing to use it",
                existing.len()
            )))
        }
        other => {
            return Err(Error::Store(format!(
                "foreign application id {other:#010x} (expected {APPLICATION_ID:#010x})"
            )))
        }
    };

    tx.execute_batch(schema)
        .context("Failed to create schema")?;
    tx.pragma_update(None, "application_id", APPLICATION_ID)
        .context("Failed to write application id")?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("Failed to write schema version")?;
    tx.commit().context("Failed to commit migration")?;

    Ok(outcome)
}

/// `(type, name)` of every user table and view.
fn schema_objects(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn
        .prepare(queries::LIST_SCHEMA_OBJECTS)
        .context("Failed to inspect schema")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("Failed to inspect schema")?;
    rows.collect::<Result<Vec<_>, _>>()
        .context("Failed to inspect schema")
}

fn drop_all(conn: &Connection, existing: &[(String, String)]) -> Result<()> {
    // Views first; they may reference the tables.
    for kind in ["view", "table"] {
        for (_, name) in existing.iter().filter(|(ty, _)| ty == kind) {
            let sql = format!("DROP {} IF EXISTS \"{}\"", kind.to_uppercase(), name.replace('"', "\"\""));
            conn.execute_batch(&sql)
                .with_context(|| format!("Failed to drop {kind} {name}"))?;
        }
    }
    Ok(())
}
