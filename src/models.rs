//! Core data models used throughout the conversion pipeline.
//!
//! These types represent the snapshot rows read from the source database,
//! the derived HTTP semantics (status provenance, redirect hops), and the
//! finished container records that flow into the archive file set.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Valid range for an HTTP status code taken verbatim from a source row.
pub const VALID_STATUS: std::ops::RangeInclusive<i64> = 100..=599;

/// Whether a capture was an ordinary page fetch or a directory/file listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Page,
    Listing,
}

impl CaptureKind {
    /// Classify a row from its `capture_kind` column, falling back to the URL
    /// scheme: `ftp://` captures are listings even when the column is empty.
    pub fn classify(flag: Option<&str>, url: &str) -> Self {
        match flag.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
            Some("listing") | Some("directory") | Some("file") => CaptureKind::Listing,
            Some("page") => CaptureKind::Page,
            _ if url.to_ascii_lowercase().starts_with("ftp://") => CaptureKind::Listing,
            _ => CaptureKind::Page,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Page => "page",
            CaptureKind::Listing => "listing",
        }
    }
}

/// Where the response body of a snapshot lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRef {
    /// Bytes stored directly in the row.
    Inline(Vec<u8>),
    /// A URL or path that must be fetched.
    Remote(String),
    /// The body was never saved.
    Missing,
}

/// Source-specific metadata blob attached to a snapshot row.
///
/// Only `redirects`, `redirect_url` and `url` have meaning to the pipeline;
/// every other key is carried through as an archival annotation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMetadata {
    /// Raw redirect entries in order. Entries may be null or non-URL values;
    /// the chain expander validates them.
    pub redirects: Vec<Value>,
    pub redirect_url: Option<String>,
    /// Where the capture service itself exposed this snapshot.
    pub source_url: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl SourceMetadata {
    /// Parse a metadata blob. Non-object values yield an empty blob.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(map) = value else {
            return Self::default();
        };

        let mut meta = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "redirects" => {
                    meta.redirects = match value {
                        Value::Array(items) => items,
                        Value::Null => Vec::new(),
                        other => vec![other],
                    }
                }
                "redirect_url" => meta.redirect_url = non_empty_string(value),
                "url" => meta.source_url = non_empty_string(value),
                _ => {
                    meta.extra.insert(key, value);
                }
            }
        }
        meta
    }

    /// True when the blob carries at least one absolute redirect URL, the
    /// same entries the chain expander turns into hops.
    pub fn has_redirects(&self) -> bool {
        self.redirects
            .iter()
            .any(|r| r.as_str().is_some_and(is_url_like))
    }
}

/// Absolute `http`, `https` or `ftp` URL with something after the scheme.
pub fn is_url_like(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    ["http://", "https://", "ftp://"]
        .iter()
        .any(|scheme| lower.len() > scheme.len() && lower.starts_with(scheme))
}

fn non_empty_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}

/// One row from the originating dataset: one fetch of one URL at one time.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub id: String,
    pub url: String,
    pub captured_at: DateTime<Utc>,
    /// Raw status as stored; may be absent or outside the valid range.
    pub status: Option<i64>,
    pub media_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: BodyRef,
    /// Expected SHA-256 (hex) of the body, when the source recorded one.
    pub body_hash: Option<String>,
    pub title: Option<String>,
    pub metadata: SourceMetadata,
    pub kind: CaptureKind,
}

impl SourceSnapshot {
    /// The raw status when it is a usable HTTP status code.
    pub fn explicit_status(&self) -> Option<u16> {
        explicit(self.status)
    }

    /// True when either the media type column or the headers name a content type.
    pub fn has_content_type(&self) -> bool {
        self.media_type.as_deref().is_some_and(|m| !m.trim().is_empty())
            || self
                .headers
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && !v.trim().is_empty())
    }
}

pub(crate) fn explicit(status: Option<i64>) -> Option<u16> {
    status
        .filter(|s| VALID_STATUS.contains(s))
        .map(|s| s as u16)
}

/// The capture of the same URL adjacent in time to a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborCapture {
    pub status: Option<i64>,
    /// SHA-256 (hex) of the neighbor's body, if known.
    pub body_hash: Option<String>,
}

/// Immediately preceding and following captures of the same URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neighbors {
    pub previous: Option<NeighborCapture>,
    pub next: Option<NeighborCapture>,
}

/// How an effective status code was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provenance {
    Explicit,
    InferredFromRedirect,
    InferredFromShape,
    InferredFromNeighbor,
    Unknown,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Explicit => "explicit",
            Provenance::InferredFromRedirect => "inferred-from-redirect",
            Provenance::InferredFromShape => "inferred-from-shape",
            Provenance::InferredFromNeighbor => "inferred-from-neighbor",
            Provenance::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective status code of a snapshot plus where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferredStatus {
    pub code: u16,
    pub provenance: Provenance,
}

impl InferredStatus {
    pub fn new(code: u16, provenance: Provenance) -> Self {
        Self { code, provenance }
    }
}

/// Context that has no place in standard response headers and is written
/// to a paired `metadata` record instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchivalContext {
    /// URL of the previous hop in a redirect chain.
    pub via: Option<String>,
    pub hops_from_seed: u32,
    pub title: Option<String>,
    pub source_uri: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl ArchivalContext {
    pub fn is_empty(&self) -> bool {
        self.via.is_none()
            && self.hops_from_seed == 0
            && self.title.is_none()
            && self.source_uri.is_none()
            && self.annotations.is_empty()
    }
}

/// One logical HTTP transaction (or listing) to be archived.
#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    pub source_id: String,
    /// Position in the redirect chain; 0 is the original request.
    pub hop: u32,
    pub record_id: String,
    /// Record ID of hop 0, set on every later hop.
    pub concurrent_to: Option<String>,
    pub url: String,
    pub captured_at: DateTime<Utc>,
    pub kind: CaptureKind,
    /// Absent for listings, which skip status inference.
    pub status: Option<InferredStatus>,
    /// Target of a synthetic redirect hop.
    pub location: Option<String>,
    pub media_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub context: ArchivalContext,
}

/// The unit written to an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Warcinfo,
    Response,
    Resource,
    Metadata,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Warcinfo => "warcinfo",
            RecordType::Response => "response",
            RecordType::Resource => "resource",
            RecordType::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warcinfo" => Some(RecordType::Warcinfo),
            "response" => Some(RecordType::Response),
            "resource" => Some(RecordType::Resource),
            "metadata" => Some(RecordType::Metadata),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully framed container record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    record_type: RecordType,
    record_id: String,
    date: DateTime<Utc>,
    block_digest: String,
    payload_digest: Option<String>,
    content_length: usize,
    bytes: Vec<u8>,
}

impl ContainerRecord {
    pub(crate) fn new(
        record_type: RecordType,
        record_id: String,
        date: DateTime<Utc>,
        block_digest: String,
        payload_digest: Option<String>,
        content_length: usize,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            record_type,
            record_id,
            date,
            block_digest,
            payload_digest,
            content_length,
            bytes,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn block_digest(&self) -> &str {
        &self.block_digest
    }

    pub fn payload_digest(&self) -> Option<&str> {
        self.payload_digest.as_deref()
    }

    /// Length of the record block (the `Content-Length` value).
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Serialized header block, payload, and trailing separator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total serialized length, before any compression.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_listing_by_flag_or_scheme() {
        assert_eq!(CaptureKind::classify(Some("listing"), "http://a/"), CaptureKind::Listing);
        assert_eq!(CaptureKind::classify(None, "FTP://a/pub/"), CaptureKind::Listing);
        assert_eq!(CaptureKind::classify(Some("page"), "ftp://a/"), CaptureKind::Page);
        assert_eq!(CaptureKind::classify(None, "https://a/"), CaptureKind::Page);
    }

    #[test]
    fn metadata_splits_known_keys_from_annotations() {
        let meta = SourceMetadata::from_value(json!({
            "redirects": ["http://a/x", null],
            "redirect_url": "http://a/x",
            "url": "https://versionista.com/1/2",
            "diff_length": 40,
        }));
        assert_eq!(meta.redirects.len(), 2);
        assert_eq!(meta.redirect_url.as_deref(), Some("http://a/x"));
        assert_eq!(meta.source_url.as_deref(), Some("https://versionista.com/1/2"));
        assert_eq!(meta.extra.get("diff_length"), Some(&json!(40)));
        assert!(meta.has_redirects());
    }

    #[test]
    fn metadata_tolerates_garbage() {
        assert_eq!(SourceMetadata::from_value(json!("nope")), SourceMetadata::default());
        let meta = SourceMetadata::from_value(json!({"redirects": [null, ""], "redirect_url": ""}));
        assert!(!meta.has_redirects());
        assert_eq!(meta.redirect_url, None);

        let relative = SourceMetadata::from_value(json!({"redirects": ["/relative", "http://"]}));
        assert!(!relative.has_redirects());
    }

    #[test]
    fn explicit_status_range() {
        assert_eq!(explicit(Some(200)), Some(200));
        assert_eq!(explicit(Some(0)), None);
        assert_eq!(explicit(Some(600)), None);
        assert_eq!(explicit(None), None);
    }
}
