//! Git packfile ingestion
//!
//! A pack is parsed as a stream: each entry is inflated exactly once. Full
//! commit/tree/tag entries are hashed and stored immediately; delta entries
//! are buffered and materialized afterwards by [`resolve`], which iterates to
//! a fixed point so arbitrarily deep delta chains need no recursion.

mod delta;
mod ingest;
mod parse;
mod resolve;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use delta::apply_delta;
pub(crate) use ingest::{ingest_pack, IngestReport};
