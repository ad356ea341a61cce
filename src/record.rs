//! Container record assembly.
//!
//! Turns one [`ResponseDescriptor`] into a `response` record (or a
//! `resource` record for listings) and, when there is archival context that
//! standard headers cannot carry, a paired `metadata` record that refers
//! back to it. Building is pure: the same descriptor always yields
//! byte-identical records.

use chrono::{DateTime, Utc};

use crate::digest::{self, BlockHasher};
use crate::identity::RecordIdentity;
use crate::models::{CaptureKind, ContainerRecord, RecordType, ResponseDescriptor};
use crate::status::DEFAULT_STATUS;
use crate::warc::{self, Fields};

/// Headers added by the capture service rather than the origin server.
/// They are kept out of response records and preserved in metadata.
pub const SERVICE_HEADERS: &[&str] = &[
    "age",
    "date",
    "vary",
    "expires",
    "x-cachee",
    "connection",
    "accept-ranges",
    "cache-control",
    "transfer-encoding",
];

/// Headers recomputed for the stored body.
const REDERIVED_HEADERS: &[&str] = &["content-length", "content-encoding"];

const HTTP_RESPONSE_TYPE: &str = "application/http;msgtype=response";
const WARC_FIELDS_TYPE: &str = "application/warc-fields";
const DEFAULT_RESOURCE_TYPE: &str = "application/octet-stream";

/// Records produced from one descriptor.
#[derive(Debug, Clone)]
pub struct BuiltRecords {
    pub primary: ContainerRecord,
    pub metadata: Option<ContainerRecord>,
}

impl BuiltRecords {
    pub fn into_vec(self) -> Vec<ContainerRecord> {
        let mut out = vec![self.primary];
        out.extend(self.metadata);
        out
    }
}

#[derive(Debug, Clone)]
pub struct RecordBuilder {
    identity: RecordIdentity,
}

impl RecordBuilder {
    pub fn new(identity: RecordIdentity) -> Self {
        Self { identity }
    }

    pub fn build(&self, descriptor: &ResponseDescriptor) -> BuiltRecords {
        let (primary, captured_headers) = match descriptor.kind {
            CaptureKind::Page => self.response(descriptor),
            CaptureKind::Listing => self.resource(descriptor),
        };
        let metadata = self.metadata(descriptor, &primary, &captured_headers);
        BuiltRecords { primary, metadata }
    }

    /// Returns the record plus the source headers that were left out of it.
    fn response(&self, d: &ResponseDescriptor) -> (ContainerRecord, Vec<(String, String)>) {
        let code = d.status.map(|s| s.code).unwrap_or(DEFAULT_STATUS);
        let media_type = d.media_type.as_deref().filter(|m| !m.trim().is_empty());

        let mut http = Fields::new();
        http.push("Date", warc::http_date(d.captured_at));
        if let Some(location) = &d.location {
            http.push("Location", location);
        }
        if let Some(media_type) = media_type {
            http.push("Content-Type", media_type);
        }

        let mut left_out = Vec::new();
        for (name, value) in &d.headers {
            let lower = name.to_ascii_lowercase();
            if SERVICE_HEADERS.contains(&lower.as_str()) {
                left_out.push((name.clone(), value.clone()));
            } else if REDERIVED_HEADERS.contains(&lower.as_str())
                || (lower == "content-type" && media_type.is_some())
            {
                continue;
            } else {
                http.push(name, value);
            }
        }
        http.push("Content-Length", d.body.len().to_string());

        let mut head = warc::status_line(code).into_bytes();
        head.extend_from_slice(b"\r\n");
        head.extend_from_slice(&http.to_bytes());
        head.extend_from_slice(b"\r\n");

        let mut fields = common_fields(RecordType::Response, &d.record_id, d.captured_at);
        fields.push("WARC-Target-URI", &d.url);
        if let Some(first) = &d.concurrent_to {
            fields.push("WARC-Concurrent-To", first);
        }
        if let Some(source_uri) = &d.context.source_uri {
            fields.push("WARC-Source-URI", source_uri);
        }
        fields.push("Content-Type", HTTP_RESPONSE_TYPE);

        let record = assemble(
            RecordType::Response,
            &d.record_id,
            d.captured_at,
            fields,
            &[head.as_slice(), d.body.as_slice()],
            Some(digest::labelled(&d.body)),
        );
        (record, left_out)
    }

    fn resource(&self, d: &ResponseDescriptor) -> (ContainerRecord, Vec<(String, String)>) {
        let mut fields = common_fields(RecordType::Resource, &d.record_id, d.captured_at);
        fields.push("WARC-Target-URI", &d.url);
        if let Some(first) = &d.concurrent_to {
            fields.push("WARC-Concurrent-To", first);
        }
        if let Some(source_uri) = &d.context.source_uri {
            fields.push("WARC-Source-URI", source_uri);
        }
        let content_type = d
            .media_type
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_RESOURCE_TYPE);
        fields.push("Content-Type", content_type);

        let payload_digest = digest::labelled(&d.body);
        let record = assemble(
            RecordType::Resource,
            &d.record_id,
            d.captured_at,
            fields,
            &[d.body.as_slice()],
            Some(payload_digest),
        );
        let headers = d
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (record, headers)
    }

    fn metadata(
        &self,
        d: &ResponseDescriptor,
        primary: &ContainerRecord,
        captured_headers: &[(String, String)],
    ) -> Option<ContainerRecord> {
        if d.context.is_empty() && captured_headers.is_empty() {
            return None;
        }

        let mut body = Fields::new();
        if let Some(via) = &d.context.via {
            body.push("via", via);
        }
        if d.context.hops_from_seed > 0 {
            body.push("hopsFromSeed", "R".repeat(d.context.hops_from_seed as usize));
        }
        if let Some(title) = &d.context.title {
            body.push("title", title);
        }
        if let Some(source) = &d.context.source_uri {
            body.push("source", source);
        }
        for (name, value) in captured_headers {
            body.push("capturedHeader", format!("{}: {}", name, value));
        }
        for (key, value) in &d.context.annotations {
            body.push(&field_name(key), value);
        }
        let block = body.to_bytes();

        let record_id = self.identity.urn(&d.source_id, d.hop, RecordType::Metadata);
        let mut fields = common_fields(RecordType::Metadata, &record_id, d.captured_at);
        fields.push("WARC-Target-URI", &d.url);
        fields.push("WARC-Refers-To", primary.record_id());
        if let Some(first) = &d.concurrent_to {
            fields.push("WARC-Concurrent-To", first);
        }
        fields.push("Content-Type", WARC_FIELDS_TYPE);

        Some(assemble(
            RecordType::Metadata,
            &record_id,
            d.captured_at,
            fields,
            &[block.as_slice()],
            None,
        ))
    }
}

/// The `warcinfo` record that opens every archive file.
pub fn warcinfo(
    identity: &RecordIdentity,
    file_name: &str,
    date: DateTime<Utc>,
    info: &[(String, String)],
) -> ContainerRecord {
    let mut body = Fields::new();
    body.push(
        "software",
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    );
    body.push("format", "WARC file version 1.1");
    for (name, value) in info {
        body.push(&field_name(name), value);
    }
    let block = body.to_bytes();

    let record_id = identity.file_urn(file_name);
    let mut fields = common_fields(RecordType::Warcinfo, &record_id, date);
    fields.push("WARC-Filename", file_name);
    fields.push("Content-Type", WARC_FIELDS_TYPE);

    assemble(RecordType::Warcinfo, &record_id, date, fields, &[block.as_slice()], None)
}

fn common_fields(record_type: RecordType, id: &str, date: DateTime<Utc>) -> Fields {
    let mut fields = Fields::new();
    fields.push("WARC-Type", record_type.as_str());
    fields.push("WARC-Record-ID", id);
    fields.push("WARC-Date", warc::warc_date(date));
    fields
}

/// Append digests and length, then frame.
fn assemble(
    record_type: RecordType,
    record_id: &str,
    date: DateTime<Utc>,
    mut fields: Fields,
    parts: &[&[u8]],
    payload_digest: Option<String>,
) -> ContainerRecord {
    let mut hasher = BlockHasher::new();
    let mut block = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        hasher.update(part);
        block.extend_from_slice(part);
    }
    let block_digest = hasher.finish();

    if let Some(payload) = &payload_digest {
        fields.push("WARC-Payload-Digest", payload);
    }
    fields.push("WARC-Block-Digest", &block_digest);
    fields.push("Content-Length", block.len().to_string());

    ContainerRecord::new(
        record_type,
        record_id.to_string(),
        date,
        block_digest,
        payload_digest,
        block.len(),
        warc::frame(&fields, &block),
    )
}

/// Reduce an arbitrary key to a header-safe token.
fn field_name(key: &str) -> String {
    let name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "annotation".to_string()
    } else {
        name
    }
}
