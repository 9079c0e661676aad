//! Pack and delta encoders for tests

use gix_object::Kind;
use sha1::{Digest, Sha1};

use crate::object::{compress, kind_code, ObjectId};

pub(crate) struct PackBuilder {
    body: Vec<u8>,
    count: u32,
}

impl PackBuilder {
    pub(crate) fn new() -> Self {
        Self {
            body: Vec::new(),
            count: 0,
        }
    }

    /// Pack offset the next entry will start at.
    fn next_offset(&self) -> u64 {
        12 + self.body.len() as u64
    }

    fn entry(&mut self, code: u8, size: u64, extra: &[u8], payload: &[u8]) -> u64 {
        let offset = self.next_offset();
        self.body.extend_from_slice(&encode_entry_header(code, size));
        self.body.extend_from_slice(extra);
        self.body.extend_from_slice(&compress(payload).unwrap());
        self.count += 1;
        offset
    }

    pub(crate) fn object(&mut self, kind: Kind, data: &[u8]) -> u64 {
        self.entry(kind_code(kind), data.len() as u64, &[], data)
    }

    /// Entry whose header declares `size` regardless of the payload length.
    pub(crate) fn raw_object(&mut self, kind: Kind, size: u64, data: &[u8]) -> u64 {
        self.entry(kind_code(kind), size, &[], data)
    }

    pub(crate) fn ofs_delta(&mut self, base_offset: u64, delta: &[u8]) -> u64 {
        let distance = self.next_offset() - base_offset;
        self.ofs_delta_distance(distance, delta)
    }

    pub(crate) fn ofs_delta_distance(&mut self, distance: u64, delta: &[u8]) -> u64 {
        self.entry(6, delta.len() as u64, &encode_ofs_distance(distance), delta)
    }

    pub(crate) fn ref_delta(&mut self, base: ObjectId, delta: &[u8]) -> u64 {
        self.entry(7, delta.len() as u64, base.as_bytes(), delta)
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 32);
        out.extend_from_slice(b"PACK");
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.body);
        let digest = Sha1::digest(&out);
        out.extend_from_slice(&digest);
        out
    }
}

fn encode_entry_header(code: u8, size: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut remaining = size;
    let mut first = ((code & 0x07) << 4) | ((remaining & 0x0f) as u8);
    remaining >>= 4;
    if remaining != 0 {
        first |= 0x80;
    }
    out.push(first);
    while remaining != 0 {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

fn encode_ofs_distance(mut dist: u64) -> Vec<u8> {
    let mut bytes = vec![(dist & 0x7f) as u8];
    dist >>= 7;
    while dist > 0 {
        dist -= 1;
        bytes.push(((dist & 0x7f) as u8) | 0x80);
        dist >>= 7;
    }
    bytes.reverse();
    bytes
}

fn encode_varint(out: &mut Vec<u8>, mut n: u64) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Builds delta instruction streams.
pub(crate) struct DeltaBuilder {
    ops: Vec<u8>,
    base_len: u64,
    result_len: u64,
}

impl DeltaBuilder {
    pub(crate) fn new(base_len: usize) -> Self {
        Self {
            ops: Vec::new(),
            base_len: base_len as u64,
            result_len: 0,
        }
    }

    pub(crate) fn copy(mut self, offset: u32, len: u32) -> Self {
        let mut op = 0x80u8;
        let mut args = Vec::new();
        for i in 0..4 {
            let byte = (offset >> (8 * i)) as u8;
            if byte != 0 {
                op |= 1 << i;
                args.push(byte);
            }
        }
        let encoded_len = if len == 0x10000 { 0 } else { len };
        for i in 0..3 {
            let byte = (encoded_len >> (8 * i)) as u8;
            if byte != 0 {
                op |= 0x10 << i;
                args.push(byte);
            }
        }
        self.ops.push(op);
        self.ops.extend_from_slice(&args);
        self.result_len += u64::from(len);
        self
    }

    pub(crate) fn insert(mut self, data: &[u8]) -> Self {
        for chunk in data.chunks(0x7f) {
            self.ops.push(chunk.len() as u8);
            self.ops.extend_from_slice(chunk);
        }
        self.result_len += data.len() as u64;
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_varint(&mut out, self.base_len);
        encode_varint(&mut out, self.result_len);
        out.extend_from_slice(&self.ops);
        out
    }
}

/// A syntactically valid commit object body.
pub(crate) fn commit_bytes(tree: &ObjectId, parents: &[ObjectId], message: &str) -> Vec<u8> {
    let mut out = format!("tree {tree}\n");
    for parent in parents {
        out.push_str(&format!("parent {parent}\n"));
    }
    out.push_str("author A U Thor <author@example.com> 1700000000 +0100\n");
    out.push_str("committer C O Mitter <committer@example.com> 1700000060 -0230\n");
    out.push('\n');
    out.push_str(message);
    out.into_bytes()
}
