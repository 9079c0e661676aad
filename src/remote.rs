//! The pull side of a remote repository

mod git;

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::object::ObjectId;

pub use git::GitRemote;

/// Capability names a remote advertised during ref listing or negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn has(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Capabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Result of listing refs on a remote
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// Full ref name (`HEAD`, `refs/heads/main`, ...) to the object it names.
    pub refs: BTreeMap<String, ObjectId>,
    pub capabilities: Capabilities,
}

/// An agreed pack transfer; `pack` yields the raw packfile bytes.
pub struct Negotiation<'a> {
    pub capabilities: Capabilities,
    pub pack: Box<dyn BufRead + 'a>,
}

/// Minimal pull protocol: list refs, then ask for a pack of everything
/// reachable from a set of wanted objects.
pub trait Remote {
    /// List refs whose names equal or start with one of `prefixes`.
    fn list_refs(&mut self, prefixes: &[String]) -> Result<Advertisement>;

    /// Request a pack containing `want` and everything reachable from it.
    ///
    /// `filter` is a partial-clone filter spec such as `blob:none`; callers
    /// pass it only when the remote advertised the `filter` capability.
    /// Firing `cancel` must abort a transfer even while a read is blocked.
    fn negotiate(
        &mut self,
        want: &[ObjectId],
        filter: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Negotiation<'_>>;
}

/// True when `name` is selected by one of `prefixes` (exact match, or a
/// prefix ending in `/`).
pub(crate) fn ref_selected(name: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|p| name == p || (p.ends_with('/') && name.starts_with(p.as_str())))
}
