//! Fixed-point delta resolution
//!
//! Deltas may name a base that appears later in the pack, or one that only
//! becomes available after another delta is resolved. Each pass resolves
//! every delta whose base is stored; a pass that makes no progress with work
//! left means the pack referenced a base we will never see.

use std::collections::{HashMap, HashSet};

use gix_object::Kind;
use rusqlite::Connection;
use tracing::{debug, trace};

use super::delta::apply_delta;
use super::ingest::IngestReport;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::store::objects;

pub(super) enum DeltaBase {
    /// Absolute pack offset of the base entry.
    Offset(u64),
    Id(ObjectId),
}

pub(super) struct PendingDelta {
    pub offset: u64,
    pub base: DeltaBase,
    pub delta: Vec<u8>,
}

enum Slot {
    Stored(ObjectId),
    Skipped,
}

/// Outcome of every entry seen so far, by pack offset.
#[derive(Default)]
pub(super) struct PackIndex {
    by_offset: HashMap<u64, Slot>,
    skipped_ids: HashSet<ObjectId>,
}

impl PackIndex {
    pub(super) fn stored(&mut self, offset: u64, id: ObjectId) {
        self.by_offset.insert(offset, Slot::Stored(id));
    }

    pub(super) fn skipped(&mut self, offset: u64, id: Option<ObjectId>) {
        self.by_offset.insert(offset, Slot::Skipped);
        if let Some(id) = id {
            self.skipped_ids.insert(id);
        }
    }
}

enum BaseState {
    Ready(ObjectId, Kind),
    Skipped,
    Waiting,
}

fn base_state(conn: &Connection, index: &PackIndex, base: &DeltaBase) -> Result<BaseState> {
    let id = match base {
        DeltaBase::Offset(offset) => match index.by_offset.get(offset) {
            Some(Slot::Stored(id)) => *id,
            Some(Slot::Skipped) => return Ok(BaseState::Skipped),
            None => return Ok(BaseState::Waiting),
        },
        DeltaBase::Id(id) if index.skipped_ids.contains(id) => return Ok(BaseState::Skipped),
        DeltaBase::Id(id) => *id,
    };
    // Ref-delta bases may come from an earlier sync rather than this pack.
    match objects::stat(conn, &id) {
        Ok(info) if info.kind == Kind::Blob => Ok(BaseState::Skipped),
        Ok(info) => Ok(BaseState::Ready(id, info.kind)),
        Err(Error::NotFound(_)) => Ok(BaseState::Waiting),
        Err(e) => Err(e),
    }
}

fn describe(base: &DeltaBase) -> String {
    match base {
        DeltaBase::Offset(offset) => format!("offset {offset}"),
        DeltaBase::Id(id) => id.to_hex(),
    }
}

/// Resolve every buffered delta, storing the reconstructed objects.
pub(super) fn undeltify(
    conn: &Connection,
    mut pending: Vec<PendingDelta>,
    index: &mut PackIndex,
    report: &mut IngestReport,
    cancel: &CancelToken,
) -> Result<()> {
    let mut pass = 0;
    while !pending.is_empty() {
        pass += 1;
        let before = pending.len();
        let mut waiting = Vec::new();

        for entry in pending {
            cancel.check()?;
            match base_state(conn, index, &entry.base)? {
                BaseState::Ready(base_id, kind) => {
                    let (_, base) = objects::read(conn, &base_id)?;
                    let data = apply_delta(&base, &entry.delta).map_err(|e| match e {
                        Error::Corruption(msg) => Error::Corruption(format!(
                            "{msg} (entry at {} on base {base_id})",
                            entry.offset
                        )),
                        other => other,
                    })?;
                    let id = report.store(conn, kind, &data)?;
                    trace!(offset = entry.offset, %id, "Resolved delta");
                    index.stored(entry.offset, id);
                    report.deltas_resolved += 1;
                }
                BaseState::Skipped => {
                    index.skipped(entry.offset, None);
                    report.skipped += 1;
                }
                BaseState::Waiting => waiting.push(entry),
            }
        }

        debug!(pass, resolved = before - waiting.len(), left = waiting.len(), "Delta pass");
        if waiting.len() == before {
            let first = &waiting[0];
            return Err(Error::Corruption(format!(
                "{} deltas reference bases that never arrived (entry at {} wants {})",
                waiting.len(),
                first.offset,
                describe(&first.base)
            )));
        }
        pending = waiting;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::ingest::ingest_pack;
    use super::*;
    use crate::pack::testing::{DeltaBuilder, PackBuilder};
    use crate::store::ObjectCache;

    #[test]
    fn test_ref_delta_chain_before_its_base() {
        let cache = ObjectCache::open_in_memory().unwrap();
        let base = b"tree contents v0".to_vec();
        let base_id = ObjectId::for_object(Kind::Tree, &base);

        // v1..=v3 each append one byte to the previous version.
        let mut versions = vec![base.clone()];
        for i in 1..=3u8 {
            let mut next = versions.last().unwrap().clone();
            next.push(b'0' + i);
            versions.push(next);
        }
        let ids: Vec<_> = versions
            .iter()
            .map(|v| ObjectId::for_object(Kind::Tree, v))
            .collect();

        let mut pack = PackBuilder::new();
        // Deepest delta first, base last.
        for i in (1..=3).rev() {
            let prev = &versions[i - 1];
            let delta = DeltaBuilder::new(prev.len())
                .copy(0, prev.len() as u32)
                .insert(&versions[i][prev.len()..])
                .build();
            pack.ref_delta(ids[i - 1], &delta);
        }
        pack.object(Kind::Tree, &base);

        let report = ingest_pack(cache.connection(), &pack.finish()[..], &CancelToken::new()).unwrap();
        assert_eq!(report.deltas_resolved, 3);
        assert_eq!(report.inserted, 4);
        assert_eq!(ids[0], base_id);
        for (id, version) in ids.iter().zip(&versions) {
            let (info, data) = cache.read_object(id).unwrap();
            assert_eq!(info.kind, Kind::Tree);
            assert_eq!(&data, version);
        }
    }

    #[test]
    fn test_ofs_delta_chain_inherits_kind() {
        let cache = ObjectCache::open_in_memory().unwrap();
        let base = b"object deadbeef\ntype commit\n".to_vec();
        let mut pack = PackBuilder::new();
        let at = pack.object(Kind::Tag, &base);
        let first = pack.ofs_delta(
            at,
            &DeltaBuilder::new(base.len()).copy(0, 7).insert(b"cafe").build(),
        );
        pack.ofs_delta(first, &DeltaBuilder::new(11).copy(7, 4).build());

        let report = ingest_pack(cache.connection(), &pack.finish()[..], &CancelToken::new()).unwrap();
        assert_eq!(report.deltas_resolved, 2);
        assert_eq!(report.new_tags.len(), 3);
        let id = ObjectId::for_object(Kind::Tag, b"cafe");
        assert_eq!(cache.stat(&id).unwrap().kind, Kind::Tag);
    }

    #[test]
    fn test_ref_delta_on_previously_stored_base() {
        let cache = ObjectCache::open_in_memory().unwrap();
        let base = b"stored by an earlier sync".to_vec();
        let mut first = PackBuilder::new();
        first.object(Kind::Tree, &base);
        ingest_pack(cache.connection(), &first.finish()[..], &CancelToken::new()).unwrap();

        let mut thin = PackBuilder::new();
        thin.ref_delta(
            ObjectId::for_object(Kind::Tree, &base),
            &DeltaBuilder::new(base.len()).copy(0, 6).build(),
        );
        let report = ingest_pack(cache.connection(), &thin.finish()[..], &CancelToken::new()).unwrap();
        assert_eq!(report.inserted, 1);
        assert!(cache.contains(&ObjectId::for_object(Kind::Tree, b"stored")).unwrap());
    }

    #[test]
    fn test_corrupt_delta_names_entry() {
        let cache = ObjectCache::open_in_memory().unwrap();
        let mut pack = PackBuilder::new();
        let at = pack.object(Kind::Tree, b"abc");
        pack.ofs_delta(at, &DeltaBuilder::new(3).copy(1, 5).build());
        let err = ingest_pack(cache.connection(), &pack.finish()[..], &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref msg) if msg.contains("entry at")), "{err}");
    }
}
