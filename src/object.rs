//! Git object identity: ids, kinds, canonical hashing and zlib helpers

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use gix_object::Kind;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result, ResultExt};

/// SHA-1 object identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut arr)?;
        Ok(Self(arr))
    }

    /// Hash `data` as an object of type `kind`
    pub fn for_object(kind: Kind, data: &[u8]) -> Self {
        let mut hasher = ObjectHasher::new(kind, data.len() as u64);
        hasher.update(data);
        hasher.finish()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Incremental hasher over the canonical `"{type} {size}\0"` prefix plus content
pub struct ObjectHasher(Sha1);

impl ObjectHasher {
    pub fn new(kind: Kind, size: u64) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind_name(kind).as_bytes());
        hasher.update(b" ");
        hasher.update(size.to_string().as_bytes());
        hasher.update(b"\0");
        Self(hasher)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> ObjectId {
        ObjectId(self.0.finalize().into())
    }
}

impl Write for ObjectHasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Commit => "commit",
        Kind::Tree => "tree",
        Kind::Blob => "blob",
        Kind::Tag => "tag",
    }
}

pub fn parse_kind_name(name: &str) -> Option<Kind> {
    match name {
        "commit" => Some(Kind::Commit),
        "tree" => Some(Kind::Tree),
        "blob" => Some(Kind::Blob),
        "tag" => Some(Kind::Tag),
        _ => None,
    }
}

/// Numeric kind code shared by the pack format and the `objects.kind` column
pub fn kind_code(kind: Kind) -> u8 {
    match kind {
        Kind::Commit => 1,
        Kind::Tree => 2,
        Kind::Blob => 3,
        Kind::Tag => 4,
    }
}

pub fn kind_from_code(code: u8) -> Option<Kind> {
    match code {
        1 => Some(Kind::Commit),
        2 => Some(Kind::Tree),
        3 => Some(Kind::Blob),
        4 => Some(Kind::Tag),
        _ => None,
    }
}

/// Zlib-compress an object body for storage
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .context("Failed to compress object")?;
    encoder.finish().context("Failed to finish compression")
}

/// Inflate a zlib stream completely. Only used for small, trusted payloads.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Corruption(format!("undecodable zlib stream: {e}")))?;
    Ok(out)
}
