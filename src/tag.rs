//! Annotated tag framing

use gix_object::Kind;

use crate::commit::{parse_id, split_headers, Signature};
use crate::error::{Error, Result};
use crate::object::{parse_kind_name, ObjectId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub target: ObjectId,
    pub target_kind: Kind,
    pub name: String,
    /// Absent on some very old tags.
    pub tagger: Option<Signature>,
    pub message: String,
}

impl TagInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (headers, message) = split_headers(data)?;
        let mut target = None;
        let mut target_kind = None;
        let mut name = None;
        let mut tagger = None;

        for (header, value) in &headers {
            match *header {
                b"object" => target = Some(parse_id("object", value)?),
                b"type" => {
                    let text = String::from_utf8_lossy(value);
                    target_kind = Some(parse_kind_name(&text).ok_or_else(|| {
                        Error::Parse(format!("tag points at unknown type {text:?}"))
                    })?);
                }
                b"tag" => name = Some(String::from_utf8_lossy(value).into_owned()),
                b"tagger" => tagger = Some(Signature::parse(value)?),
                _ => {}
            }
        }

        let missing = |field: &str| Error::Parse(format!("tag is missing its {field} header"));
        Ok(Self {
            target: target.ok_or_else(|| missing("object"))?,
            target_kind: target_kind.ok_or_else(|| missing("type"))?,
            name: name.ok_or_else(|| missing("tag"))?,
            tagger,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}
