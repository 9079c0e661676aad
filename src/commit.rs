//! Commit and signature framing

use crate::error::{Error, Result};
use crate::object::ObjectId;

fn parse_err(msg: impl Into<String>) -> Error {
    Error::Parse(msg.into())
}

/// `Name <email> <unix-seconds> <+hhmm>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// `Name <email>`, the deduplicated user identity.
    pub ident: String,
    pub time: i64,
    /// Offset from UTC in minutes, east positive.
    pub tz_minutes: i32,
}

impl Signature {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        let mut fields = text.rsplitn(3, ' ');
        let (Some(tz), Some(time), Some(ident)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(parse_err(format!("signature {text:?} lacks time and offset")));
        };
        let time = time
            .parse()
            .map_err(|_| parse_err(format!("bad signature timestamp {time:?}")))?;
        Ok(Self {
            ident: ident.to_string(),
            time,
            tz_minutes: parse_tz(tz)?,
        })
    }
}

/// `+0530` is 330 minutes, `-0230` is -150.
pub fn parse_tz(tz: &str) -> Result<i32> {
    let bad = || parse_err(format!("bad timezone offset {tz:?}"));
    let (sign, digits) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(bad()),
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| bad())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| bad())?;
    if minutes >= 60 {
        return Err(bad());
    }
    Ok(sign * (hours * 60 + minutes))
}

/// Render minutes east of UTC back into git's `+hhmm` form.
pub fn format_tz(tz_minutes: i32) -> String {
    let sign = if tz_minutes < 0 { '-' } else { '+' };
    let abs = tz_minutes.unsigned_abs();
    format!("{sign}{:02}{:02}", abs / 60, abs % 60)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub tree: ObjectId,
    /// In header order; index 0 is the first parent.
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

/// Split an object body into `(name, value)` header pairs and the message.
///
/// Continuation lines (leading space, as in `gpgsig`) are folded into the
/// preceding header's value.
pub(crate) fn split_headers(data: &[u8]) -> Result<(Vec<(&[u8], Vec<u8>)>, &[u8])> {
    let mut headers: Vec<(&[u8], Vec<u8>)> = Vec::new();
    let mut rest = data;
    loop {
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            return Err(parse_err("header block is not terminated by a blank line"));
        };
        let line = &rest[..nl];
        rest = &rest[nl + 1..];
        if line.is_empty() {
            return Ok((headers, rest));
        }
        if let Some(cont) = line.strip_prefix(b" ") {
            let Some((_, value)) = headers.last_mut() else {
                return Err(parse_err("continuation line before any header"));
            };
            value.push(b'\n');
            value.extend_from_slice(cont);
            continue;
        }
        let (name, value) = match line.iter().position(|&b| b == b' ') {
            Some(sp) => (&line[..sp], &line[sp + 1..]),
            None => (line, &line[line.len()..]),
        };
        headers.push((name, value.to_vec()));
    }
}

pub(crate) fn parse_id(field: &str, value: &[u8]) -> Result<ObjectId> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|hex| ObjectId::from_hex(hex).ok())
        .ok_or_else(|| {
            parse_err(format!(
                "bad {field} hash {:?}",
                String::from_utf8_lossy(value)
            ))
        })
}

impl CommitInfo {
    /// Parse a raw commit object body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (headers, message) = split_headers(data)?;
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;

        for (i, (name, value)) in headers.iter().enumerate() {
            match *name {
                b"tree" => {
                    if i != 0 || tree.is_some() {
                        return Err(parse_err("tree header must appear exactly once, first"));
                    }
                    tree = Some(parse_id("tree", value)?);
                }
                b"parent" => parents.push(parse_id("parent", value)?),
                b"author" if author.is_none() => author = Some(Signature::parse(value)?),
                b"committer" if committer.is_none() => {
                    committer = Some(Signature::parse(value)?)
                }
                b"author" | b"committer" => {
                    return Err(parse_err(format!(
                        "duplicate {} header",
                        String::from_utf8_lossy(name)
                    )))
                }
                _ => {}
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| parse_err("missing tree header"))?,
            parents,
            author: author.ok_or_else(|| parse_err("missing author header"))?,
            committer: committer.ok_or_else(|| parse_err("missing committer header"))?,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}
