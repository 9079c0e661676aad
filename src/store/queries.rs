//! Named SQL templates. Executed through `prepare_cached`, so each is parsed
//! once per connection.

pub(crate) const SCHEMA: &str = include_str!("schema.sql");

pub(crate) const LIST_SCHEMA_OBJECTS: &str = "SELECT type, name FROM sqlite_master \
     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'";

pub(crate) const OBJECT_BY_HASH: &str = "SELECT id, kind, size FROM objects WHERE hash = ?1";

pub(crate) const OBJECT_ID_BY_HASH: &str = "SELECT id FROM objects WHERE hash = ?1";

pub(crate) const INSERT_OBJECT: &str = "INSERT INTO objects (hash, kind, size, content) \
     VALUES (?1, ?2, ?3, zeroblob(?4)) ON CONFLICT(hash) DO NOTHING";

pub(crate) const COUNT_OBJECTS: &str = "SELECT COUNT(*) FROM objects";

pub(crate) const UPSERT_USER: &str =
    "INSERT INTO users (ident) VALUES (?1) ON CONFLICT(ident) DO NOTHING";

pub(crate) const USER_ID: &str = "SELECT id FROM users WHERE ident = ?1";

pub(crate) const UPSERT_COMMIT: &str = "INSERT INTO commits \
     (object_id, tree_id, author_id, author_time, author_tz, \
      committer_id, commit_time, commit_tz, message) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
     ON CONFLICT(object_id) DO UPDATE SET \
      tree_id = excluded.tree_id, \
      author_id = excluded.author_id, \
      author_time = excluded.author_time, \
      author_tz = excluded.author_tz, \
      committer_id = excluded.committer_id, \
      commit_time = excluded.commit_time, \
      commit_tz = excluded.commit_tz, \
      message = excluded.message";

pub(crate) const DELETE_PARENTS: &str = "DELETE FROM commit_parents WHERE commit_id = ?1";

pub(crate) const INSERT_PARENT: &str =
    "INSERT INTO commit_parents (commit_id, ordinal, parent_id) VALUES (?1, ?2, ?3)";

pub(crate) const COMMIT_BY_HASH: &str = "SELECT tree, author, author_time, author_tz, \
     committer, commit_time, commit_tz, message FROM commit_log WHERE hash = ?1";

pub(crate) const PARENTS_OF: &str = "SELECT p.hash FROM commit_parents cp \
     JOIN objects c ON c.id = cp.commit_id \
     JOIN objects p ON p.id = cp.parent_id \
     WHERE c.hash = ?1 ORDER BY cp.ordinal";

pub(crate) const COUNT_COMMITS: &str = "SELECT COUNT(*) FROM commits";

pub(crate) const UPSERT_TAG: &str = "INSERT INTO tags \
     (object_id, target_hash, target_kind, name, tagger_id, tag_time, tag_tz, message) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
     ON CONFLICT(object_id) DO UPDATE SET \
      target_hash = excluded.target_hash, \
      target_kind = excluded.target_kind, \
      name = excluded.name, \
      tagger_id = excluded.tagger_id, \
      tag_time = excluded.tag_time, \
      tag_tz = excluded.tag_tz, \
      message = excluded.message";

pub(crate) const TAG_TARGET: &str = "SELECT t.target_hash FROM tags t \
     JOIN objects o ON o.id = t.object_id WHERE o.hash = ?1";

pub(crate) const LIST_REFS: &str = "SELECT name, hash FROM refs ORDER BY name";

pub(crate) const REF_BY_NAME: &str = "SELECT hash FROM refs WHERE name = ?1";

pub(crate) const UPSERT_REF: &str = "INSERT INTO refs (name, hash) VALUES (?1, ?2) \
     ON CONFLICT(name) DO UPDATE SET hash = excluded.hash WHERE hash != excluded.hash";

pub(crate) const DELETE_REF: &str = "DELETE FROM refs WHERE name = ?1";
