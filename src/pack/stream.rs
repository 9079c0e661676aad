//! Buffered pack reader that tracks the stream offset and the running SHA-1
//! of every consumed byte (for the pack trailer).

use std::io::{self, BufRead, Read};

use sha1::{Digest, Sha1};

const BUF_SIZE: usize = 64 * 1024;

pub(crate) struct PackStream<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    offset: u64,
    hasher: Sha1,
}

impl<R: Read> PackStream<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            pos: 0,
            filled: 0,
            offset: 0,
            hasher: Sha1::new(),
        }
    }

    /// Bytes consumed so far, i.e. the pack offset of the next byte.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// SHA-1 over everything consumed so far.
    pub(crate) fn digest(&self) -> [u8; 20] {
        self.hasher.clone().finalize().into()
    }

    pub(crate) fn read_u8(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

impl<R: Read> Read for PackStream<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for PackStream<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.filled {
            self.filled = loop {
                match self.inner.read(&mut self.buf) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            self.pos = 0;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.filled - self.pos);
        self.hasher.update(&self.buf[self.pos..self.pos + amt]);
        self.pos += amt;
        self.offset += amt as u64;
    }
}
