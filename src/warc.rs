//! WARC 1.1 record framing.
//!
//! A record is the version line, `Name: value` header fields each ended by
//! CRLF, a blank line, exactly `Content-Length` bytes of block, and a
//! closing CRLF CRLF. This module only frames and unframes bytes; deciding
//! what goes into a record is [`crate::record`]'s job.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

pub const WARC_VERSION: &str = "WARC/1.1";
const CRLF: &[u8] = b"\r\n";
const TRAILER: &[u8] = b"\r\n\r\n";

/// Ordered header fields of a record (or of an HTTP message).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a field. CR and LF in either part are replaced with spaces so a
    /// value can never terminate the header block early.
    pub fn push(&mut self, name: &str, value: impl AsRef<str>) {
        self.0.push((sanitize(name), sanitize(value.as_ref())));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Name: value\r\n` for every field, without a terminating blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.0 {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF);
        }
        out
    }
}

fn sanitize(s: &str) -> String {
    if s.contains(['\r', '\n']) {
        s.replace(['\r', '\n'], " ")
    } else {
        s.to_string()
    }
}

/// Serialize one complete record.
pub fn frame(fields: &Fields, block: &[u8]) -> Vec<u8> {
    let head = fields.to_bytes();
    let mut out =
        Vec::with_capacity(WARC_VERSION.len() + head.len() + block.len() + 2 * CRLF.len() + 4);
    out.extend_from_slice(WARC_VERSION.as_bytes());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(&head);
    out.extend_from_slice(CRLF);
    out.extend_from_slice(block);
    out.extend_from_slice(TRAILER);
    out
}

/// `WARC-Date` form: UTC, second precision.
pub fn warc_date(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// HTTP `Date` header form (RFC 7231 IMF-fixdate).
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `HTTP/1.1 <code> <reason>` for a status code.
pub fn status_line(code: u16) -> String {
    let reason = reqwest::StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    format!("HTTP/1.1 {} {}", code, reason)
}

/// A record read back from an archive file.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub version: String,
    pub fields: Fields,
    pub block: Vec<u8>,
}

impl ParsedRecord {
    pub fn record_type(&self) -> Option<&str> {
        self.fields.get("WARC-Type")
    }

    pub fn record_id(&self) -> Option<&str> {
        self.fields.get("WARC-Record-ID")
    }
}

/// Split an uncompressed WARC byte stream into records, checking framing.
pub fn parse_records(data: &[u8]) -> Result<Vec<ParsedRecord>> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let index = records.len();
        let (version, next) = read_line(data, pos)
            .with_context(|| format!("record {}: missing version line", index))?;
        if !version.starts_with("WARC/") {
            bail!("record {}: expected version line, found {:?}", index, version);
        }
        pos = next;

        let mut fields = Fields::new();
        loop {
            let (line, next) = read_line(data, pos)
                .with_context(|| format!("record {}: unterminated header block", index))?;
            pos = next;
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                bail!("record {}: malformed header line {:?}", index, line);
            };
            fields.push(name.trim(), value.trim());
        }

        let length: usize = fields
            .get("Content-Length")
            .with_context(|| format!("record {}: no Content-Length", index))?
            .parse()
            .with_context(|| format!("record {}: bad Content-Length", index))?;
        let end = pos
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .with_context(|| format!("record {}: block runs past end of file", index))?;
        let block = data[pos..end].to_vec();
        pos = end;

        if !data[pos..].starts_with(TRAILER) {
            bail!("record {}: missing CRLF CRLF after block", index);
        }
        pos += TRAILER.len();

        records.push(ParsedRecord {
            version,
            fields,
            block,
        });
    }

    Ok(records)
}

fn read_line(data: &[u8], start: usize) -> Option<(String, usize)> {
    let rest = data.get(start..)?;
    let end = rest.windows(2).position(|w| w == CRLF)?;
    let line = String::from_utf8_lossy(&rest[..end]).into_owned();
    Some((line, start + end + 2))
}
