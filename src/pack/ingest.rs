//! Stream a pack into the object table

use std::io::Read;

use gix_object::Kind;
use rusqlite::Connection;
use tracing::{debug, warn};

use super::parse::{EntryBody, PackParser};
use super::resolve::{undeltify, DeltaBase, PackIndex, PendingDelta};
use crate::cancel::{CancelToken, Cancellable};
use crate::error::Result;
use crate::object::{compress, ObjectId};
use crate::store::objects;

/// What one pack contributed to the cache
#[derive(Debug, Default, Clone)]
pub(crate) struct IngestReport {
    pub entries: u32,
    /// Rows added to `objects` (direct and delta-resolved)
    pub inserted: u64,
    pub deltas_resolved: u64,
    /// Blobs, reserved types, and deltas on top of them
    pub skipped: u64,
    /// Commits stored for the first time, in pack order
    pub new_commits: Vec<ObjectId>,
    pub new_tags: Vec<ObjectId>,
}

impl IngestReport {
    /// Hash, recompress and insert one full object, recording what was new.
    pub(super) fn store(&mut self, conn: &Connection, kind: Kind, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::for_object(kind, data);
        if objects::contains(conn, &id)? {
            return Ok(id);
        }
        // Recompressed so stored bytes never depend on the remote's zlib settings.
        let packed = compress(data)?;
        if objects::insert(conn, &id, kind, data.len() as u64, packed.len() as u64, &packed[..])? {
            self.inserted += 1;
            match kind {
                Kind::Commit => self.new_commits.push(id),
                Kind::Tag => self.new_tags.push(id),
                Kind::Tree | Kind::Blob => {}
            }
        }
        Ok(id)
    }
}

/// Parse `reader` as a pack, storing every commit, tree and tag it carries.
///
/// Full entries are stored as they stream past; deltas are buffered and
/// resolved once the whole pack (and its trailer) has been read.
pub(crate) fn ingest_pack<R: Read>(
    conn: &Connection,
    reader: R,
    cancel: &CancelToken,
) -> Result<IngestReport> {
    let mut parser = PackParser::new(Cancellable::new(reader, cancel.clone()))?;
    debug!(
        version = parser.version(),
        entries = parser.remaining(),
        "Reading pack"
    );

    let mut report = IngestReport::default();
    let mut index = PackIndex::default();
    let mut pending = Vec::new();

    while let Some(entry) = parser.next_entry()? {
        cancel.check()?;
        report.entries += 1;
        match entry.body {
            EntryBody::Object { kind, data } => {
                let id = report.store(conn, kind, &data)?;
                index.stored(entry.offset, id);
            }
            EntryBody::Blob { id } => {
                index.skipped(entry.offset, Some(id));
                report.skipped += 1;
            }
            EntryBody::Unknown { code } => {
                warn!(offset = entry.offset, code, "Skipping pack entry of unknown type");
                index.skipped(entry.offset, None);
                report.skipped += 1;
            }
            EntryBody::OfsDelta { base_offset, delta } => pending.push(PendingDelta {
                offset: entry.offset,
                base: DeltaBase::Offset(base_offset),
                delta,
            }),
            EntryBody::RefDelta { base, delta } => pending.push(PendingDelta {
                offset: entry.offset,
                base: DeltaBase::Id(base),
                delta,
            }),
        }
    }

    debug!(
        stored = report.inserted,
        deltas = pending.len(),
        "Pack read; resolving deltas"
    );
    undeltify(conn, pending, &mut index, &mut report, cancel)?;
    Ok(report)
}
