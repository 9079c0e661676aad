//! Git delta instruction interpreter

use crate::error::{Error, Result};

fn corrupt(msg: impl Into<String>) -> Error {
    Error::Corruption(format!("bad delta: {}", msg.into()))
}

fn read_varint(delta: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *delta.get(*pos).ok_or_else(|| corrupt("truncated size header"))?;
        *pos += 1;
        if shift > 63 {
            return Err(corrupt("size header overflows"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Apply `delta` to `base`, producing the target object.
///
/// The stream starts with the expected base and result sizes, followed by
/// copy (`1xxxxxxx`, offset/length bytes selected by the low bits) and insert
/// (`0nnnnnnn`, `n` literal bytes) instructions. Both sizes are enforced.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_len = read_varint(delta, &mut pos)?;
    if base_len != base.len() as u64 {
        return Err(corrupt(format!(
            "expects a {base_len} byte base, got {}",
            base.len()
        )));
    }
    let result_len = read_varint(delta, &mut pos)?;
    let result_len =
        usize::try_from(result_len).map_err(|_| corrupt("result size does not fit in memory"))?;
    let mut out = Vec::with_capacity(result_len.min(16 << 20));

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        if op & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| corrupt("truncated copy offset"))?;
                    pos += 1;
                    offset |= usize::from(byte) << (8 * i);
                }
            }
            let mut len = 0usize;
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| corrupt("truncated copy length"))?;
                    pos += 1;
                    len |= usize::from(byte) << (8 * i);
                }
            }
            if len == 0 {
                len = 0x10000;
            }
            let end = offset
                .checked_add(len)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| {
                    corrupt(format!(
                        "copy of {len} bytes at {offset} exceeds {} byte base",
                        base.len()
                    ))
                })?;
            out.extend_from_slice(&base[offset..end]);
        } else if op != 0 {
            let len = usize::from(op);
            let literal = delta
                .get(pos..pos + len)
                .ok_or_else(|| corrupt("truncated insert"))?;
            out.extend_from_slice(literal);
            pos += len;
        } else {
            return Err(corrupt("reserved opcode 0"));
        }
        if out.len() > result_len {
            return Err(corrupt(format!("output exceeds declared {result_len} bytes")));
        }
    }

    if out.len() != result_len {
        return Err(corrupt(format!(
            "produced {} bytes, declared {result_len}",
            out.len()
        )));
    }
    Ok(out)
}
