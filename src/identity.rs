//! Deterministic record identifiers.
//!
//! Record IDs are URNs built only from their inputs, so re-running a
//! conversion over the same rows yields the same IDs:
//!
//! ```text
//! <urn:snapshot-warc:{dataset}:{record type}:{hop}:{source id}>
//! <urn:snapshot-warc:{dataset}:file:{file name}>
//! ```
//!
//! The dataset is restricted to `[A-Za-z0-9._-]`, the record type and hop
//! are fixed-alphabet segments, and the source ID is percent-encoded (with
//! `%` itself escaped), so distinct inputs can never produce the same URN.

use anyhow::{bail, Result};

use crate::models::RecordType;

const SCHEME: &str = "urn:snapshot-warc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    dataset: String,
}

impl RecordIdentity {
    pub fn new(dataset: &str) -> Result<Self> {
        validate_dataset(dataset)?;
        Ok(Self {
            dataset: dataset.to_string(),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Record ID for one record derived from a source row.
    pub fn urn(&self, source_id: &str, hop: u32, record_type: RecordType) -> String {
        format!(
            "<{}:{}:{}:{}:{}>",
            SCHEME,
            self.dataset,
            record_type.as_str(),
            hop,
            escape(source_id)
        )
    }

    /// Record ID for the `warcinfo` record opening an archive file.
    pub fn file_urn(&self, file_name: &str) -> String {
        format!("<{}:{}:file:{}>", SCHEME, self.dataset, escape(file_name))
    }
}

pub fn validate_dataset(dataset: &str) -> Result<()> {
    if dataset.is_empty() {
        bail!("dataset name must not be empty");
    }
    if let Some(c) = dataset
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        bail!(
            "dataset name '{}' contains '{}'; only letters, digits, '.', '_' and '-' are allowed",
            dataset,
            c
        );
    }
    Ok(())
}

/// Percent-encode everything outside the URN-safe set.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        let safe = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'-' | b'.' | b'_' | b'~' | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*'
                    | b'+' | b',' | b';' | b'=' | b':' | b'@' | b'/'
            );
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
