//! Structured commit and tag rows, written parents-first

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension};

use crate::commit::{CommitInfo, Signature};
use crate::error::{Error, Result, ResultExt};
use crate::object::{kind_code, ObjectId};
use crate::store::{id_from_column, objects, queries, with_savepoint, ObjectCache};
use crate::tag::TagInfo;

/// Order `batch` so every commit follows all of its parents that are also in
/// `batch`. Parents outside the batch are ignored; a cycle is broken at the
/// first revisit rather than looping.
pub fn topological_order(
    batch: &[ObjectId],
    parents: &HashMap<ObjectId, Vec<ObjectId>>,
) -> Vec<ObjectId> {
    let members: HashSet<&ObjectId> = batch.iter().collect();
    let mut visited: HashSet<ObjectId> = HashSet::with_capacity(batch.len());
    let mut order = Vec::with_capacity(batch.len());
    // (node, index of the next parent to visit)
    let mut stack: Vec<(ObjectId, usize)> = Vec::new();

    for root in batch {
        if !visited.insert(*root) {
            continue;
        }
        stack.push((*root, 0));
        while let Some((node, next)) = stack.last_mut() {
            let node_parents = parents.get(&*node).map(Vec::as_slice).unwrap_or_default();
            match node_parents.get(*next) {
                Some(parent) => {
                    *next += 1;
                    if members.contains(parent) && visited.insert(*parent) {
                        stack.push((*parent, 0));
                    }
                }
                None => {
                    order.push(*node);
                    stack.pop();
                }
            }
        }
    }
    order
}

fn user_id(conn: &Connection, ident: &str) -> Result<i64> {
    conn.prepare_cached(queries::UPSERT_USER)
        .and_then(|mut stmt| stmt.execute([ident]))
        .with_context(|| format!("Failed to record user {ident:?}"))?;
    conn.prepare_cached(queries::USER_ID)
        .and_then(|mut stmt| stmt.query_row([ident], |row| row.get(0)))
        .with_context(|| format!("Failed to look up user {ident:?}"))
}

fn required_rowid(conn: &Connection, id: &ObjectId) -> Result<i64> {
    objects::rowid(conn, id)?.ok_or(Error::NotFound(*id))
}

/// Insert or replace the structured row for commit `id`, replacing its parent
/// links wholesale. The commit, its tree and every parent must already be in
/// the object table (`Error::NotFound` otherwise).
pub(crate) fn upsert_commit(conn: &Connection, id: &ObjectId, info: &CommitInfo) -> Result<()> {
    with_savepoint(conn, "index_commit", || {
        let commit_row = required_rowid(conn, id)?;
        let tree_row = required_rowid(conn, &info.tree)?;
        let author = user_id(conn, &info.author.ident)?;
        let committer = user_id(conn, &info.committer.ident)?;

        conn.prepare_cached(queries::UPSERT_COMMIT)
            .and_then(|mut stmt| {
                stmt.execute(params![
                    commit_row,
                    tree_row,
                    author,
                    info.author.time,
                    info.author.tz_minutes,
                    committer,
                    info.committer.time,
                    info.committer.tz_minutes,
                    info.message,
                ])
            })
            .with_context(|| format!("Failed to index commit {id}"))?;

        conn.prepare_cached(queries::DELETE_PARENTS)
            .and_then(|mut stmt| stmt.execute([commit_row]))
            .with_context(|| format!("Failed to clear parents of {id}"))?;
        for (ordinal, parent) in info.parents.iter().enumerate() {
            let parent_row = required_rowid(conn, parent)?;
            conn.prepare_cached(queries::INSERT_PARENT)
                .and_then(|mut stmt| stmt.execute(params![commit_row, ordinal as i64, parent_row]))
                .with_context(|| format!("Failed to link {id} to parent {parent}"))?;
        }
        Ok(())
    })
}

/// Insert or replace the structured row for annotated tag `id`.
pub(crate) fn upsert_tag(conn: &Connection, id: &ObjectId, info: &TagInfo) -> Result<()> {
    with_savepoint(conn, "index_tag", || {
        let tag_row = required_rowid(conn, id)?;
        let tagger = info
            .tagger
            .as_ref()
            .map(|sig| user_id(conn, &sig.ident))
            .transpose()?;
        conn.prepare_cached(queries::UPSERT_TAG)
            .and_then(|mut stmt| {
                stmt.execute(params![
                    tag_row,
                    info.target.as_bytes().as_slice(),
                    kind_code(info.target_kind),
                    info.name,
                    tagger,
                    info.tagger.as_ref().map(|sig| sig.time),
                    info.tagger.as_ref().map(|sig| sig.tz_minutes),
                    info.message,
                ])
            })
            .with_context(|| format!("Failed to index tag {id}"))?;
        Ok(())
    })
}

/// A commit as recorded in the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl ObjectCache {
    /// Indexed metadata for commit `id`, parents in ordinal order.
    pub fn commit(&self, id: &ObjectId) -> Result<CommitRecord> {
        let conn = self.connection();
        let key = id.as_bytes().as_slice();
        let row = conn
            .prepare_cached(queries::COMMIT_BY_HASH)
            .and_then(|mut stmt| {
                stmt.query_row([key], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        Signature {
                            ident: row.get(1)?,
                            time: row.get(2)?,
                            tz_minutes: row.get(3)?,
                        },
                        Signature {
                            ident: row.get(4)?,
                            time: row.get(5)?,
                            tz_minutes: row.get(6)?,
                        },
                        row.get::<_, String>(7)?,
                    ))
                })
                .optional()
            })
            .with_context(|| format!("Failed to load commit {id}"))?;
        let Some((tree, author, committer, message)) = row else {
            return Err(Error::NotFound(*id));
        };

        let mut stmt = conn
            .prepare_cached(queries::PARENTS_OF)
            .context("Failed to prepare parent lookup")?;
        let hashes = stmt
            .query_map([key], |row| row.get::<_, Vec<u8>>(0))
            .with_context(|| format!("Failed to load parents of {id}"))?;
        let mut parents = Vec::new();
        for hash in hashes {
            parents.push(id_from_column(&hash.context("Failed to read parent row")?)?);
        }

        Ok(CommitRecord {
            id: *id,
            tree: id_from_column(&tree)?,
            parents,
            author,
            committer,
            message,
        })
    }

    /// Follow annotated tags (as indexed) down to the object they name.
    pub fn peel(&self, id: &ObjectId) -> Result<ObjectId> {
        let mut current = *id;
        let mut seen = HashSet::new();
        while seen.insert(current) {
            let target: Option<Vec<u8>> = self
                .connection()
                .prepare_cached(queries::TAG_TARGET)
                .and_then(|mut stmt| {
                    stmt.query_row([current.as_bytes().as_slice()], |row| row.get(0))
                        .optional()
                })
                .with_context(|| format!("Failed to peel {current}"))?;
            match target {
                Some(hash) => current = id_from_column(&hash)?,
                None => return Ok(current),
            }
        }
        Err(Error::Corruption(format!("tag cycle through {current}")))
    }
}
