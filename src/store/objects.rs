//! The `objects` table: content-addressed, zlib-compressed, lazily verified

use std::io::{self, Read};

use flate2::read::ZlibDecoder;
use gix_object::Kind;
use rusqlite::{blob::Blob, params, Connection, DatabaseName, OptionalExtension};

use super::{queries, with_savepoint};
use crate::error::{Error, Result, ResultExt};
use crate::object::{kind_code, kind_from_code, ObjectHasher, ObjectId};

/// Type and declared (uncompressed) size of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub kind: Kind,
    pub size: u64,
}

struct Row {
    rowid: i64,
    info: ObjectInfo,
}

fn lookup(conn: &Connection, id: &ObjectId) -> Result<Option<Row>> {
    let row = conn
        .prepare_cached(queries::OBJECT_BY_HASH)
        .and_then(|mut stmt| {
            stmt.query_row([id.as_bytes().as_slice()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })
            .optional()
        })
        .with_context(|| format!("Failed to look up object {id}"))?;

    let Some((rowid, code, size)) = row else {
        return Ok(None);
    };
    let kind = u8::try_from(code)
        .ok()
        .and_then(kind_from_code)
        .ok_or_else(|| Error::Corruption(format!("object {id} has unknown kind {code}")))?;
    let size = u64::try_from(size)
        .map_err(|_| Error::Corruption(format!("object {id} has negative size {size}")))?;
    Ok(Some(Row {
        rowid,
        info: ObjectInfo { kind, size },
    }))
}

pub(crate) fn stat(conn: &Connection, id: &ObjectId) -> Result<ObjectInfo> {
    lookup(conn, id)?
        .map(|row| row.info)
        .ok_or(Error::NotFound(*id))
}

pub(crate) fn contains(conn: &Connection, id: &ObjectId) -> Result<bool> {
    Ok(rowid(conn, id)?.is_some())
}

pub(crate) fn rowid(conn: &Connection, id: &ObjectId) -> Result<Option<i64>> {
    conn.prepare_cached(queries::OBJECT_ID_BY_HASH)
        .and_then(|mut stmt| {
            stmt.query_row([id.as_bytes().as_slice()], |row| row.get(0))
                .optional()
        })
        .with_context(|| format!("Failed to look up object {id}"))
}

/// Store compressed content under `id`. Idempotent: returns `false` without
/// touching the row when the hash is already present.
///
/// `compressed` is copied straight into a `compressed_len`-byte blob; a
/// stream that is shorter or longer fails the insert and leaves no row. The
/// content itself is trusted here; integrity is checked when the object is
/// read back in full.
pub(crate) fn insert(
    conn: &Connection,
    id: &ObjectId,
    kind: Kind,
    size: u64,
    compressed_len: u64,
    mut compressed: impl Read,
) -> Result<bool> {
    if contains(conn, id)? {
        return Ok(false);
    }
    let len = i64::try_from(compressed_len)
        .map_err(|_| Error::Store(format!("object {id} is too large to store")))?;

    with_savepoint(conn, "insert_object", || {
        let inserted = conn
            .prepare_cached(queries::INSERT_OBJECT)
            .and_then(|mut stmt| {
                stmt.execute(params![id.as_bytes().as_slice(), kind_code(kind), size as i64, len])
            })
            .with_context(|| format!("Failed to insert object {id}"))?;
        if inserted == 0 {
            return Ok(false);
        }

        let mut blob = conn
            .blob_open(DatabaseName::Main, "objects", "content", conn.last_insert_rowid(), false)
            .with_context(|| format!("Failed to open content of {id} for writing"))?;
        let copied = io::copy(&mut compressed, &mut blob)
            .with_context(|| format!("Failed to write compressed content of {id}"))?;
        if copied != compressed_len {
            return Err(Error::Corruption(format!(
                "object {id}: compressed stream is {copied} bytes, expected {compressed_len}"
            )));
        }
        blob.close()
            .with_context(|| format!("Failed to close content of {id}"))?;
        Ok(true)
    })
}

pub(crate) fn open<'conn>(conn: &'conn Connection, id: &ObjectId) -> Result<ObjectReader<'conn>> {
    let row = lookup(conn, id)?.ok_or(Error::NotFound(*id))?;
    let blob = conn
        .blob_open(DatabaseName::Main, "objects", "content", row.rowid, true)
        .with_context(|| format!("Failed to open content of {id}"))?;
    Ok(ObjectReader {
        id: *id,
        info: row.info,
        decoder: ZlibDecoder::new(blob),
        hasher: Some(ObjectHasher::new(row.info.kind, row.info.size)),
        produced: 0,
    })
}

pub(crate) fn read(conn: &Connection, id: &ObjectId) -> Result<(ObjectInfo, Vec<u8>)> {
    let mut reader = open(conn, id)?;
    let mut data = Vec::with_capacity(usize::try_from(reader.info.size.min(1 << 20)).unwrap_or(0));
    reader
        .read_to_end(&mut data)
        .with_context(|| format!("Failed to read object {id}"))?;
    let info = reader.info;
    reader.close()?;
    Ok((info, data))
}

/// Streaming, decompressing reader over one stored object.
///
/// Reaching EOF checks that exactly the declared number of bytes came out and
/// that they hash back to the object id; a mismatch is reported as an
/// `InvalidData` error wrapping [`Error::Corruption`]. Partial reads carry no
/// guarantee.
pub struct ObjectReader<'conn> {
    id: ObjectId,
    info: ObjectInfo,
    decoder: ZlibDecoder<Blob<'conn>>,
    /// `None` once verification ran
    hasher: Option<ObjectHasher>,
    produced: u64,
}

impl<'conn> ObjectReader<'conn> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn info(&self) -> ObjectInfo {
        self.info
    }

    /// Release the blob handle.
    pub fn close(self) -> Result<()> {
        let id = self.id;
        self.decoder
            .into_inner()
            .close()
            .with_context(|| format!("Failed to close content of {id}"))
    }

    fn corrupt(&self, reason: String) -> io::Error {
        Error::Corruption(format!("object {}: {reason}", self.id)).into_io()
    }

    fn verify(&mut self) -> io::Result<()> {
        let Some(hasher) = self.hasher.take() else {
            return Ok(());
        };
        if self.produced != self.info.size {
            return Err(self.corrupt(format!(
                "content is {} bytes, expected {}",
                self.produced, self.info.size
            )));
        }
        let actual = hasher.finish();
        if actual != self.id {
            return Err(self.corrupt(format!("content hashes to {actual}")));
        }
        Ok(())
    }
}

impl Read for ObjectReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = match self.decoder.read(buf) {
            Ok(n) => n,
            Err(e) => return Err(self.corrupt(format!("undecodable content: {e}"))),
        };
        if n == 0 {
            self.verify()?;
            return Ok(0);
        }
        self.produced += n as u64;
        if self.produced > self.info.size {
            return Err(self.corrupt(format!(
                "content exceeds declared size {}",
                self.info.size
            )));
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}
