//! One atomic round trip with a remote: refs, pack, deltas, index

use std::collections::{BTreeSet, HashMap};

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::commit::CommitInfo;
use crate::error::{Error, Result, ResultExt};
use crate::index::{topological_order, upsert_commit, upsert_tag};
use crate::object::ObjectId;
use crate::pack::{ingest_pack, IngestReport};
use crate::remote::{Advertisement, Remote};
use crate::store::{objects, queries, ObjectCache};
use crate::tag::TagInfo;

pub const DEFAULT_REF_PREFIXES: [&str; 3] = ["HEAD", "refs/heads/", "refs/tags/"];
pub const DEFAULT_FILTER: &str = "blob:none";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Refs to mirror: exact names, or prefixes ending in `/`.
    pub ref_prefixes: Vec<String>,
    /// Partial-clone filter, sent only if the remote supports `filter`.
    pub filter: Option<String>,
    pub index_tags: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            ref_prefixes: DEFAULT_REF_PREFIXES.iter().map(|p| p.to_string()).collect(),
            filter: Some(DEFAULT_FILTER.to_string()),
            index_tags: true,
        }
    }
}

/// A commit or tag that was stored but could not be indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFailure {
    pub id: ObjectId,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub refs: usize,
    pub refs_changed: usize,
    pub refs_removed: usize,
    pub wanted: usize,
    pub pack_entries: u32,
    pub objects_inserted: u64,
    pub deltas_resolved: u64,
    pub skipped: u64,
    pub commits_indexed: usize,
    pub tags_indexed: usize,
    pub index_failures: Vec<IndexFailure>,
}

impl ObjectCache {
    /// Mirror `remote` into the cache.
    ///
    /// Everything happens inside one transaction: on any fatal error, or if
    /// `cancel` fires, the cache is left exactly as it was.
    pub fn sync(
        &mut self,
        remote: &mut dyn Remote,
        options: &SyncOptions,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin sync transaction")?;
        let report = run(&tx, remote, options, cancel)?;
        cancel.check()?;
        tx.commit().context("Failed to commit sync")?;

        info!(
            refs = report.refs,
            inserted = report.objects_inserted,
            deltas = report.deltas_resolved,
            commits = report.commits_indexed,
            failures = report.index_failures.len(),
            "Sync complete"
        );
        Ok(report)
    }
}

fn run(
    conn: &Connection,
    remote: &mut dyn Remote,
    options: &SyncOptions,
    cancel: &CancelToken,
) -> Result<SyncReport> {
    let advertisement = remote.list_refs(&options.ref_prefixes)?;
    cancel.check()?;
    let mut report = SyncReport {
        refs: advertisement.refs.len(),
        ..Default::default()
    };

    let want: Vec<ObjectId> = advertisement
        .refs
        .values()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    report.wanted = want.len();

    if want.is_empty() {
        debug!("Remote advertised no matching refs; nothing to fetch");
    } else {
        let filter = match options.filter.as_deref() {
            Some(spec) if advertisement.capabilities.has("filter") => Some(spec),
            Some(spec) => {
                debug!(filter = spec, "Remote does not support filtering; fetching unfiltered");
                None
            }
            None => None,
        };
        let negotiation = remote.negotiate(&want, filter, cancel)?;
        let ingested = ingest_pack(conn, negotiation.pack, cancel)?;
        report.pack_entries = ingested.entries;
        report.objects_inserted = ingested.inserted;
        report.deltas_resolved = ingested.deltas_resolved;
        report.skipped = ingested.skipped;

        index_commits(conn, &ingested, &mut report, cancel)?;
        if options.index_tags {
            index_tags(conn, &ingested, &mut report, cancel)?;
        }
    }

    replace_refs(conn, &advertisement, &mut report)?;
    Ok(report)
}

/// Per-object failures that are contained rather than aborting the sync.
fn is_contained(err: &Error) -> bool {
    matches!(err, Error::Parse(_) | Error::NotFound(_))
}

fn contain(report: &mut SyncReport, id: ObjectId, what: &str, err: Error) -> Result<()> {
    if !is_contained(&err) {
        return Err(err);
    }
    warn!(%id, error = %err, "Skipping {what} that could not be indexed");
    report.index_failures.push(IndexFailure {
        id,
        reason: err.to_string(),
    });
    Ok(())
}

fn index_commits(
    conn: &Connection,
    ingested: &IngestReport,
    report: &mut SyncReport,
    cancel: &CancelToken,
) -> Result<()> {
    let mut parsed: HashMap<ObjectId, CommitInfo> = HashMap::with_capacity(ingested.new_commits.len());
    for id in &ingested.new_commits {
        let (_, data) = objects::read(conn, id)?;
        match CommitInfo::parse(&data) {
            Ok(info) => {
                parsed.insert(*id, info);
            }
            Err(err) => contain(report, *id, "commit", err)?,
        }
    }

    let parents: HashMap<ObjectId, Vec<ObjectId>> = parsed
        .iter()
        .map(|(id, info)| (*id, info.parents.clone()))
        .collect();
    let batch: Vec<ObjectId> = ingested
        .new_commits
        .iter()
        .filter(|id| parsed.contains_key(id))
        .copied()
        .collect();

    for id in topological_order(&batch, &parents) {
        cancel.check()?;
        let Some(info) = parsed.get(&id) else {
            continue;
        };
        match upsert_commit(conn, &id, info) {
            Ok(()) => report.commits_indexed += 1,
            Err(err) => contain(report, id, "commit", err)?,
        }
    }
    Ok(())
}

fn index_tags(
    conn: &Connection,
    ingested: &IngestReport,
    report: &mut SyncReport,
    cancel: &CancelToken,
) -> Result<()> {
    for id in &ingested.new_tags {
        cancel.check()?;
        let (_, data) = objects::read(conn, id)?;
        let indexed = TagInfo::parse(&data).and_then(|info| upsert_tag(conn, id, &info));
        match indexed {
            Ok(()) => report.tags_indexed += 1,
            Err(err) => contain(report, *id, "tag", err)?,
        }
    }
    Ok(())
}

/// Make the `refs` table mirror the advertisement exactly.
fn replace_refs(conn: &Connection, advertisement: &Advertisement, report: &mut SyncReport) -> Result<()> {
    let existing = conn
        .prepare_cached(queries::LIST_REFS)
        .and_then(|mut stmt| {
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>();
            names
        })
        .context("Failed to list refs")?;

    for name in existing {
        if !advertisement.refs.contains_key(&name) {
            conn.prepare_cached(queries::DELETE_REF)
                .and_then(|mut stmt| stmt.execute([&name]))
                .with_context(|| format!("Failed to remove ref {name}"))?;
            debug!(name, "Ref removed");
            report.refs_removed += 1;
        }
    }

    for (name, id) in &advertisement.refs {
        let changed = conn
            .prepare_cached(queries::UPSERT_REF)
            .and_then(|mut stmt| stmt.execute(rusqlite::params![name, id.as_bytes().as_slice()]))
            .with_context(|| format!("Failed to record ref {name}"))?;
        if changed > 0 {
            debug!(name, %id, "Ref updated");
            report.refs_changed += changed;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::{self, BufRead, Read};

    use gix_object::Kind;

    use super::*;
    use crate::pack::testing::{commit_bytes, DeltaBuilder, PackBuilder};
    use crate::remote::{Capabilities, Negotiation};

    struct FakeRemote {
        refs: BTreeMap<String, ObjectId>,
        capabilities: Capabilities,
        pack: Vec<u8>,
        /// Cancelled as soon as the pack is first read.
        trip: Option<CancelToken>,
        requests: Vec<(Vec<ObjectId>, Option<String>)>,
    }

    impl FakeRemote {
        fn new(pack: Vec<u8>) -> Self {
            Self {
                refs: BTreeMap::new(),
                capabilities: ["ofs-delta", "filter"].into_iter().collect(),
                pack,
                trip: None,
                requests: Vec::new(),
            }
        }

        fn with_ref(mut self, name: &str, id: ObjectId) -> Self {
            self.refs.insert(name.to_string(), id);
            self
        }
    }

    struct Tripwire<'a> {
        inner: &'a [u8],
        token: Option<CancelToken>,
    }

    impl Read for Tripwire<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(token) = &self.token {
                token.cancel();
            }
            self.inner.read(buf)
        }
    }

    impl Remote for FakeRemote {
        fn list_refs(&mut self, _prefixes: &[String]) -> Result<Advertisement> {
            Ok(Advertisement {
                refs: self.refs.clone(),
                capabilities: self.capabilities.clone(),
            })
        }

        fn negotiate(
            &mut self,
            want: &[ObjectId],
            filter: Option<&str>,
            _cancel: &CancelToken,
        ) -> Result<Negotiation<'_>> {
            self.requests
                .push((want.to_vec(), filter.map(str::to_string)));
            let reader: Box<dyn BufRead + '_> = Box::new(io::BufReader::new(Tripwire {
                inner: &self.pack,
                token: self.trip.clone(),
            }));
            Ok(Negotiation {
                capabilities: self.capabilities.clone(),
                pack: reader,
            })
        }
    }

    struct Repo {
        pack: Vec<u8>,
        blob: ObjectId,
        tree: ObjectId,
        commit: ObjectId,
        commit_bytes: Vec<u8>,
        tree_bytes: Vec<u8>,
    }

    /// One root commit holding one file.
    fn root_commit_repo() -> Repo {
        let blob_data = b"hello world\n";
        let blob = ObjectId::for_object(Kind::Blob, blob_data);
        let mut tree_data = b"100644 README\0".to_vec();
        tree_data.extend_from_slice(blob.as_bytes());
        let tree = ObjectId::for_object(Kind::Tree, &tree_data);
        let commit_data = commit_bytes(&tree, &[], "initial\n");
        let commit = ObjectId::for_object(Kind::Commit, &commit_data);

        let mut pack = PackBuilder::new();
        pack.object(Kind::Commit, &commit_data);
        pack.object(Kind::Tree, &tree_data);
        pack.object(Kind::Blob, blob_data);
        Repo {
            pack: pack.finish(),
            blob,
            tree,
            commit,
            commit_bytes: commit_data,
            tree_bytes: tree_data,
        }
    }

    #[test]
    fn test_end_to_end_root_commit() {
        let repo = root_commit_repo();
        let mut cache = ObjectCache::open_in_memory().unwrap();
        let mut remote = FakeRemote::new(repo.pack.clone())
            .with_ref("HEAD", repo.commit)
            .with_ref("refs/heads/main", repo.commit);

        let report = cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.refs, 2);
        assert_eq!(report.wanted, 1);
        assert_eq!(report.objects_inserted, 2);
        assert_eq!(report.commits_indexed, 1);
        assert!(report.index_failures.is_empty());
        assert_eq!(remote.requests[0], (vec![repo.commit], Some("blob:none".to_string())));

        let info = cache.stat(&repo.commit).unwrap();
        assert_eq!(info.kind, Kind::Commit);
        assert_eq!(info.size, repo.commit_bytes.len() as u64);
        let mut bytes = Vec::new();
        cache
            .open_object(&repo.commit)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, repo.commit_bytes);
        assert!(cache.contains(&repo.tree).unwrap());
        assert!(!cache.contains(&repo.blob).unwrap());

        let record = cache.commit(&repo.commit).unwrap();
        assert_eq!(record.tree, repo.tree);
        assert_eq!(record.author.tz_minutes, 60);
        assert_eq!(record.committer.tz_minutes, -150);
        assert_eq!(cache.resolve("main").unwrap(), repo.commit);

        let again = cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(again.objects_inserted, 0);
        assert_eq!(again.commits_indexed, 0);
        assert_eq!(again.refs_changed, 0);
        assert_eq!(cache.object_count().unwrap(), 2);
    }

    #[test]
    fn test_filter_only_when_advertised() {
        let repo = root_commit_repo();
        let mut cache = ObjectCache::open_in_memory().unwrap();
        let mut remote = FakeRemote::new(repo.pack).with_ref("HEAD", repo.commit);
        remote.capabilities = ["ofs-delta"].into_iter().collect();
        cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(remote.requests[0].1, None);
    }

    #[test]
    fn test_no_refs_skips_negotiation() {
        let mut cache = ObjectCache::open_in_memory().unwrap();
        let mut remote = FakeRemote::new(Vec::new());
        let report = cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.wanted, 0);
        assert!(remote.requests.is_empty());
    }

    #[test]
    fn test_cancel_mid_pack_leaves_store_unchanged() {
        let repo = root_commit_repo();
        let mut cache = ObjectCache::open_in_memory().unwrap();
        let token = CancelToken::new();
        let mut remote = FakeRemote::new(repo.pack).with_ref("HEAD", repo.commit);
        remote.trip = Some(token.clone());

        let err = cache
            .sync(&mut remote, &SyncOptions::default(), &token)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err}");
        assert_eq!(cache.object_count().unwrap(), 0);
        assert!(cache.refs().unwrap().is_empty());
    }

    #[test]
    fn test_merge_history_indexed_parents_first() {
        let tree_data: &[u8] = b"";
        let tree = ObjectId::for_object(Kind::Tree, tree_data);
        let root = commit_bytes(&tree, &[], "root\n");
        let root_id = ObjectId::for_object(Kind::Commit, &root);
        let left = commit_bytes(&tree, &[root_id], "left\n");
        let left_id = ObjectId::for_object(Kind::Commit, &left);
        let right = commit_bytes(&tree, &[root_id], "right\n");
        let right_id = ObjectId::for_object(Kind::Commit, &right);
        let merge = commit_bytes(&tree, &[left_id, right_id], "merge\n");
        let merge_id = ObjectId::for_object(Kind::Commit, &merge);

        // Children before parents, and the merge stored as a delta on `left`.
        let mut pack = PackBuilder::new();
        let left_at = pack.object(Kind::Commit, &left);
        let prefix = b"tree ".len() + 40 + 1;
        let merge_delta = DeltaBuilder::new(left.len())
            .copy(0, prefix as u32)
            .insert(&merge[prefix..])
            .build();
        pack.ofs_delta(left_at, &merge_delta);
        pack.object(Kind::Commit, &right);
        pack.object(Kind::Commit, &root);
        pack.object(Kind::Tree, tree_data);

        let mut cache = ObjectCache::open_in_memory().unwrap();
        let mut remote = FakeRemote::new(pack.finish()).with_ref("refs/heads/main", merge_id);
        let report = cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.deltas_resolved, 1);
        assert_eq!(report.commits_indexed, 4);
        assert_eq!(cache.commit_count().unwrap(), 4);
        assert_eq!(cache.commit(&merge_id).unwrap().parents, vec![left_id, right_id]);
        assert_eq!(cache.commit(&left_id).unwrap().parents, vec![root_id]);
    }

    #[test]
    fn test_unindexable_commit_is_contained() {
        let tree_data: &[u8] = b"";
        let tree = ObjectId::for_object(Kind::Tree, tree_data);
        let good = commit_bytes(&tree, &[], "good\n");
        let good_id = ObjectId::for_object(Kind::Commit, &good);
        let missing_tree = ObjectId::for_object(Kind::Tree, b"not in the pack");
        let orphan = commit_bytes(&missing_tree, &[], "orphan\n");
        let orphan_id = ObjectId::for_object(Kind::Commit, &orphan);
        let garbage = b"this is not a commit".to_vec();
        let garbage_id = ObjectId::for_object(Kind::Commit, &garbage);

        let mut pack = PackBuilder::new();
        pack.object(Kind::Tree, tree_data);
        pack.object(Kind::Commit, &good);
        pack.object(Kind::Commit, &orphan);
        pack.object(Kind::Commit, &garbage);

        let mut cache = ObjectCache::open_in_memory().unwrap();
        let mut remote = FakeRemote::new(pack.finish()).with_ref("HEAD", good_id);
        let report = cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.commits_indexed, 1);
        let failed: BTreeSet<_> = report.index_failures.iter().map(|f| f.id).collect();
        assert_eq!(failed, BTreeSet::from([orphan_id, garbage_id]));
        assert!(cache.contains(&orphan_id).unwrap());
        assert!(cache.commit(&orphan_id).unwrap_err().is_not_found());
        assert!(cache.commit(&good_id).is_ok());
    }

    #[test]
    fn test_annotated_tag_indexed_and_refs_replaced() {
        let repo = root_commit_repo();
        let tag_data = format!(
            "object {}\ntype commit\ntag v1.0\ntagger T <t@x> 1700000000 +0000\n\nrelease\n",
            repo.commit
        )
        .into_bytes();
        let tag_id = ObjectId::for_object(Kind::Tag, &tag_data);

        let mut pack = PackBuilder::new();
        pack.object(Kind::Tag, &tag_data);
        pack.object(Kind::Commit, &repo.commit_bytes);
        pack.object(Kind::Tree, &repo.tree_bytes);

        let mut cache = ObjectCache::open_in_memory().unwrap();
        let mut remote = FakeRemote::new(pack.finish())
            .with_ref("refs/heads/main", repo.commit)
            .with_ref("refs/tags/v1.0", tag_id);
        let report = cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.tags_indexed, 1);
        assert_eq!(cache.peel(&cache.resolve("v1.0").unwrap()).unwrap(), repo.commit);

        // The branch is deleted upstream; the next sync forgets it.
        remote.refs.remove("refs/heads/main");
        let report = cache
            .sync(&mut remote, &SyncOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.refs_removed, 1);
        assert_eq!(cache.ref_target("refs/heads/main").unwrap(), None);
        assert_eq!(cache.refs().unwrap(), vec![("refs/tags/v1.0".to_string(), tag_id)]);
    }
}
