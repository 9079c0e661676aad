use std::io;

use crate::object::ObjectId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cache file cannot be used (foreign file, failed migration).
    #[error("store error: {0}")]
    Store(String),

    /// Expected absence. Callers branch on this rather than treating it as failure.
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// A revision that is neither a full hash nor a recorded ref.
    #[error("unknown revision {0:?}")]
    UnknownRef(String),

    /// Hash or size mismatch, found on read or during ingestion.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Negotiation or pack stream failure with the remote.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed commit or tag framing.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Missing object or unknown revision.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::UnknownRef(_))
    }

    /// Recover a crate error that travelled through an `io::Error`, e.g. a
    /// corruption found by [`crate::ObjectReader`] while inside `io::copy`.
    pub(crate) fn from_io(err: io::Error, context: impl Into<String>) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(own) = inner.downcast::<Error>() {
                    return *own;
                }
            }
            return Error::Store("lost wrapped error".to_string());
        }
        Error::Io {
            context: context.into(),
            source: err,
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

/// Attach an operation/key description to foreign errors.
pub(crate) trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|source| Error::Sqlite {
            context: context.into(),
            source,
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|source| Error::Sqlite {
            context: f().into(),
            source,
        })
    }
}

impl<T> ResultExt<T> for std::result::Result<T, io::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|err| Error::from_io(err, context))
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|err| Error::from_io(err, f()))
    }
}
