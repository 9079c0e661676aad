//! SQLite-backed object cache
//!
//! One database file holds every mirrored object plus the commit index. All
//! access goes through a single [`rusqlite::Connection`]; mutating operations
//! run inside savepoints so they are atomic on their own and nest inside a
//! sync's enclosing transaction.

mod migrate;
pub(crate) mod objects;
pub(crate) mod queries;

use std::path::{Path, PathBuf};
use std::time::Duration;

use gix_object::Kind;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result, ResultExt};
use crate::object::ObjectId;

pub use migrate::Migration;
pub use objects::{ObjectInfo, ObjectReader};

/// Fixed `application_id` tag ("GMC1") identifying our cache files.
pub const APPLICATION_ID: i32 = 0x474d_4331;

/// Bump on any change to `schema.sql`. A mismatch drops and rebuilds the cache.
pub const SCHEMA_VERSION: i32 = 3;

pub struct ObjectCache {
    conn: Connection,
    path: Option<PathBuf>,
    migration: Migration,
}

impl ObjectCache {
    /// Open (creating if absent) the cache file at `path` and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            Error::Store(format!("Failed to open cache at {}: {e}", path.display()))
        })?;
        Self::init(conn, Some(path.to_path_buf())).map_err(|e| match e {
            Error::Sqlite { context, source } => {
                Error::Store(format!("{} ({}): {source}", context, path.display()))
            }
            other => other,
        })
    }

    /// Open a throwaway cache that lives only as long as the handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory cache")?;
        Self::init(conn, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(10))
            .context("Failed to set busy timeout")?;

        // Migration runs before any pragma that rewrites the file header, so a
        // foreign file is refused untouched.
        let migration = migrate::migrate(&mut conn)?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;

        match migration {
            Migration::Current => tracing::debug!(?path, "Opened object cache"),
            Migration::Created => tracing::info!(?path, "Created object cache"),
            Migration::Reset { from } => tracing::warn!(
                ?path,
                from,
                to = SCHEMA_VERSION,
                "Cache schema version changed; discarded all cached objects"
            ),
        }

        Ok(Self {
            conn,
            path,
            migration,
        })
    }

    /// Release the underlying connection, surfacing any error from closing it.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, source)| Error::Sqlite {
                context: "Failed to close cache".to_string(),
                source,
            })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// What `open` had to do to the schema.
    pub fn migration(&self) -> Migration {
        self.migration
    }

    pub fn schema_version(&self) -> Result<i32> {
        self.conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .context("Failed to read schema version")
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn stat(&self, id: &ObjectId) -> Result<ObjectInfo> {
        objects::stat(&self.conn, id)
    }

    pub fn contains(&self, id: &ObjectId) -> Result<bool> {
        objects::contains(&self.conn, id)
    }

    /// Open a verifying streaming reader over the object's content.
    pub fn open_object(&self, id: &ObjectId) -> Result<ObjectReader<'_>> {
        objects::open(&self.conn, id)
    }

    /// Read and verify a whole object.
    pub fn read_object(&self, id: &ObjectId) -> Result<(ObjectInfo, Vec<u8>)> {
        objects::read(&self.conn, id)
    }

    /// Store an already-compressed object of `compressed_len` bytes, streamed
    /// from `compressed`. Returns `false` if it was present.
    pub fn insert(
        &self,
        id: &ObjectId,
        kind: Kind,
        size: u64,
        compressed_len: u64,
        compressed: impl std::io::Read,
    ) -> Result<bool> {
        objects::insert(&self.conn, id, kind, size, compressed_len, compressed)
    }

    pub fn object_count(&self) -> Result<u64> {
        count(&self.conn, queries::COUNT_OBJECTS)
    }

    pub fn commit_count(&self) -> Result<u64> {
        count(&self.conn, queries::COUNT_COMMITS)
    }

    /// Refs recorded by the last successful sync, sorted by name.
    pub fn refs(&self) -> Result<Vec<(String, ObjectId)>> {
        let mut stmt = self
            .conn
            .prepare_cached(queries::LIST_REFS)
            .context("Failed to prepare ref listing")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .context("Failed to list refs")?;
        let mut refs = Vec::new();
        for row in rows {
            let (name, hash) = row.context("Failed to read ref row")?;
            refs.push((name, id_from_column(&hash)?));
        }
        Ok(refs)
    }

    /// Hash `name` pointed at when the last sync committed.
    pub fn ref_target(&self, name: &str) -> Result<Option<ObjectId>> {
        let hash: Option<Vec<u8>> = self
            .conn
            .prepare_cached(queries::REF_BY_NAME)
            .and_then(|mut stmt| stmt.query_row([name], |row| row.get(0)).optional())
            .with_context(|| format!("Failed to look up ref {name}"))?;
        hash.map(|h| id_from_column(&h)).transpose()
    }

    /// Resolve a revision string: a full hex hash, or a ref name as recorded
    /// by the last sync (`main` falls back to `refs/heads/main`, then
    /// `refs/tags/main`).
    pub fn resolve(&self, rev: &str) -> Result<ObjectId> {
        if rev.len() == ObjectId::LEN * 2 {
            if let Ok(id) = ObjectId::from_hex(rev) {
                return Ok(id);
            }
        }
        let candidates = [
            rev.to_string(),
            format!("refs/{rev}"),
            format!("refs/heads/{rev}"),
            format!("refs/tags/{rev}"),
        ];
        for name in &candidates {
            if let Some(id) = self.ref_target(name)? {
                return Ok(id);
            }
        }
        Err(Error::UnknownRef(rev.to_string()))
    }
}

/// Run `f` inside a named savepoint: a transaction at top level, a nested
/// savepoint inside one. Rolled back if `f` fails.
pub(crate) fn with_savepoint<T>(
    conn: &Connection,
    name: &'static str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch(&format!("SAVEPOINT {name}"))
        .with_context(|| format!("Failed to open savepoint {name}"))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))
                .with_context(|| format!("Failed to release savepoint {name}"))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) =
                conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
            {
                tracing::warn!(savepoint = name, %rollback, "Failed to roll back savepoint");
            }
            Err(err)
        }
    }
}

pub(crate) fn id_from_column(bytes: &[u8]) -> Result<ObjectId> {
    ObjectId::from_slice(bytes).ok_or_else(|| {
        Error::Corruption(format!("stored hash has {} bytes, expected 20", bytes.len()))
    })
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn
        .prepare_cached(sql)
        .and_then(|mut stmt| stmt.query_row([], |row| row.get(0)))
        .context("Failed to count rows")?;
    Ok(n as u64)
}
