#![deny(clippy::mod_module_files)]
//! Local, queryable mirror of a remote Git repository's commits, trees and tags.
//!
//! [`ObjectCache::sync`] pulls a pack from a [`Remote`], resolves its deltas,
//! verifies and stores every non-blob object in SQLite, and indexes commit
//! metadata parents-first so it can be queried without touching the remote.

mod cancel;
mod commit;
mod error;
mod index;
mod object;
mod pack;
mod remote;
mod store;
mod sync;
mod tag;

pub use cancel::CancelToken;
pub use commit::{format_tz, parse_tz, CommitInfo, Signature};
pub use error::{Error, Result};
pub use gix_object::Kind;
pub use index::{topological_order, CommitRecord};
pub use object::{compress, decompress, kind_name, parse_kind_name, ObjectHasher, ObjectId};
pub use pack::apply_delta;
pub use remote::{Advertisement, Capabilities, GitRemote, Negotiation, Remote};
pub use store::{Migration, ObjectCache, ObjectInfo, ObjectReader, APPLICATION_ID, SCHEMA_VERSION};
pub use sync::{IndexFailure, SyncOptions, SyncReport, DEFAULT_FILTER, DEFAULT_REF_PREFIXES};
pub use tag::TagInfo;
