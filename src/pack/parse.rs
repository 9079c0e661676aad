//! Pack framing: header, per-entry type/size varints, delta base references,
//! zlib bodies and the SHA-1 trailer.

use std::io::{self, Read};

use flate2::bufread::ZlibDecoder;
use gix_object::Kind;

use super::stream::PackStream;
use crate::error::{Error, Result};
use crate::object::{kind_from_code, ObjectHasher, ObjectId};

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

#[derive(Debug)]
pub(crate) enum EntryBody {
    /// A commit, tree or tag with its full inflated content
    Object { kind: Kind, data: Vec<u8> },
    /// A blob, hashed and discarded
    Blob { id: ObjectId },
    /// Reserved type code; body discarded
    Unknown { code: u8 },
    OfsDelta { base_offset: u64, delta: Vec<u8> },
    RefDelta { base: ObjectId, delta: Vec<u8> },
}

#[derive(Debug)]
pub(crate) struct PackEntry {
    pub offset: u64,
    pub body: EntryBody,
}

pub(crate) struct PackParser<R> {
    stream: PackStream<R>,
    version: u32,
    remaining: u32,
    finished: bool,
}

fn protocol(msg: impl Into<String>) -> Error {
    Error::Protocol(msg.into())
}

fn read_err(what: &str, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        protocol(format!("pack truncated while reading {what}"))
    } else {
        Error::from_io(e, format!("Failed to read pack {what}"))
    }
}

impl<R: Read> PackParser<R> {
    /// Read and validate the 12-byte pack header.
    pub(crate) fn new(reader: R) -> Result<Self> {
        let mut stream = PackStream::new(reader);
        let mut header = [0u8; 12];
        stream
            .read_exact(&mut header)
            .map_err(|e| read_err("header", e))?;
        if &header[..4] != b"PACK" {
            return Err(protocol("missing PACK signature"));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(protocol(format!("unsupported pack version {version}")));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        Ok(Self {
            stream,
            version,
            remaining: count,
            finished: false,
        })
    }

    pub(crate) fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Next entry, or `None` after the last one (the trailer is then checked).
    pub(crate) fn next_entry(&mut self) -> Result<Option<PackEntry>> {
        if self.finished {
            return Ok(None);
        }
        if self.remaining == 0 {
            self.verify_trailer()?;
            self.finished = true;
            return Ok(None);
        }
        self.remaining -= 1;

        let offset = self.stream.offset();
        let (code, size) = self.read_type_and_size()?;
        let body = match code {
            OBJ_OFS_DELTA => {
                let distance = self.read_ofs_distance()?;
                let base_offset = offset.checked_sub(distance).filter(|_| distance > 0);
                let Some(base_offset) = base_offset else {
                    return Err(protocol(format!(
                        "entry at {offset} has delta base distance {distance} out of range"
                    )));
                };
                let delta = self.inflate(size, offset)?;
                EntryBody::OfsDelta { base_offset, delta }
            }
            OBJ_REF_DELTA => {
                let mut raw = [0u8; 20];
                self.stream
                    .read_exact(&mut raw)
                    .map_err(|e| read_err("delta base id", e))?;
                let delta = self.inflate(size, offset)?;
                EntryBody::RefDelta {
                    base: ObjectId::new(raw),
                    delta,
                }
            }
            code => match kind_from_code(code) {
                Some(Kind::Blob) => EntryBody::Blob {
                    id: self.hash_blob(size, offset)?,
                },
                Some(kind) => EntryBody::Object {
                    kind,
                    data: self.inflate(size, offset)?,
                },
                None => {
                    self.discard(size, offset)?;
                    EntryBody::Unknown { code }
                }
            },
        };
        Ok(Some(PackEntry { offset, body }))
    }

    /// Type code in bits 4..6 of the first byte; size in the low nibble
    /// followed by 7-bit little-endian continuation groups.
    fn read_type_and_size(&mut self) -> Result<(u8, u64)> {
        let mut byte = self.stream.read_u8().map_err(|e| read_err("entry header", e))?;
        let code = (byte >> 4) & 0x07;
        let mut size = u64::from(byte & 0x0f);
        let mut shift = 4u32;
        while byte & 0x80 != 0 {
            if shift > 57 {
                return Err(protocol("entry size varint overflows"));
            }
            byte = self.stream.read_u8().map_err(|e| read_err("entry header", e))?;
            size |= u64::from(byte & 0x7f) << shift;
            shift += 7;
        }
        Ok((code, size))
    }

    /// Big-endian base-128 with an implicit +1 per continuation byte.
    fn read_ofs_distance(&mut self) -> Result<u64> {
        let mut byte = self.stream.read_u8().map_err(|e| read_err("delta offset", e))?;
        let mut distance = u64::from(byte & 0x7f);
        while byte & 0x80 != 0 {
            if distance >= 1 << 56 {
                return Err(protocol("delta offset varint overflows"));
            }
            byte = self.stream.read_u8().map_err(|e| read_err("delta offset", e))?;
            distance = ((distance + 1) << 7) | u64::from(byte & 0x7f);
        }
        Ok(distance)
    }

    fn decoder(&mut self) -> ZlibDecoder<&mut PackStream<R>> {
        ZlibDecoder::new(&mut self.stream)
    }

    /// Inflate a body that must produce exactly `size` bytes. Reading one byte
    /// past the limit both detects oversized bodies and drives the decoder to
    /// the end of its zlib stream, so the next entry starts in the right place.
    fn inflate(&mut self, size: u64, offset: u64) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(usize::try_from(size.min(1 << 20)).unwrap_or(0));
        let mut decoder = self.decoder().take(size.saturating_add(1));
        decoder
            .read_to_end(&mut data)
            .map_err(|e| inflate_err(offset, e))?;
        check_size(offset, data.len() as u64, size)?;
        Ok(data)
    }

    fn hash_blob(&mut self, size: u64, offset: u64) -> Result<ObjectId> {
        let mut hasher = ObjectHasher::new(Kind::Blob, size);
        let mut decoder = self.decoder().take(size.saturating_add(1));
        let produced = io::copy(&mut decoder, &mut hasher).map_err(|e| inflate_err(offset, e))?;
        check_size(offset, produced, size)?;
        Ok(hasher.finish())
    }

    fn discard(&mut self, size: u64, offset: u64) -> Result<()> {
        let mut decoder = self.decoder().take(size.saturating_add(1));
        let produced = io::copy(&mut decoder, &mut io::sink()).map_err(|e| inflate_err(offset, e))?;
        check_size(offset, produced, size)
    }

    fn verify_trailer(&mut self) -> Result<()> {
        let expected = self.stream.digest();
        let mut trailer = [0u8; 20];
        self.stream
            .read_exact(&mut trailer)
            .map_err(|e| read_err("trailer", e))?;
        if trailer != expected {
            return Err(Error::Corruption(format!(
                "pack checksum mismatch: trailer {} but content hashes to {}",
                hex::encode(trailer),
                hex::encode(expected)
            )));
        }
        Ok(())
    }
}

fn inflate_err(offset: u64, e: io::Error) -> Error {
    match Error::from_io(e, format!("Failed to inflate entry at {offset}")) {
        Error::Io { context, source } if source.kind() == io::ErrorKind::InvalidInput
            || source.kind() == io::ErrorKind::InvalidData =>
        {
            Error::Corruption(format!("{context}: {source}"))
        }
        other => other,
    }
}

fn check_size(offset: u64, produced: u64, declared: u64) -> Result<()> {
    if produced != declared {
        return Err(Error::Corruption(format!(
            "entry at {offset} inflated to {} bytes, header declared {declared}",
            if produced > declared {
                format!("more than {declared}")
            } else {
                produced.to_string()
            }
        )));
    }
    Ok(())
}
