//! Resolving a snapshot's body reference to bytes.
//!
//! Bodies may be stored inline in the row, behind an HTTP(S) URL, or as a
//! file path (absolute, `file:` prefixed, or relative to `[bodies].root`).
//! Every failure here is scoped to one snapshot and surfaces as
//! [`ConvertError::Payload`] with a [`SkipReason`]:
//!
//! - HTTP 404/410, a missing file, or no reference at all → `missing_body`
//! - other HTTP errors and I/O failures, after retries → `fetch_failed`
//! - bytes whose SHA-256 differs from the row's `body_hash` → `mismatched_body`
//!
//! Retries use the same policy as the rest of the crate's HTTP calls:
//! 429, 5xx and network errors back off exponentially (1s, 2s, 4s, ...);
//! other client errors fail at once.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::config::BodiesConfig;
use crate::digest;
use crate::error::{ConvertError, Result, SkipReason};
use crate::models::{BodyRef, SourceSnapshot};

#[async_trait]
pub trait BodyLoader: Send + Sync {
    /// Fetch and verify the body bytes of `snapshot`.
    async fn load(&self, snapshot: &SourceSnapshot) -> Result<Vec<u8>>;
}

pub struct DefaultBodyLoader {
    client: reqwest::Client,
    root: Option<PathBuf>,
    retries: u32,
}

impl DefaultBodyLoader {
    pub fn new(config: &BodiesConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            root: config.root.clone(),
            retries: config.retries,
        })
    }

    async fn fetch_http(&self, source_id: &str, url: &str) -> Result<Vec<u8>> {
        let mut last_err = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        match response.bytes().await {
                            Ok(bytes) => return Ok(bytes.to_vec()),
                            Err(e) => {
                                last_err = Some(format!("reading {}: {}", url, e));
                                continue;
                            }
                        }
                    }

                    if status.as_u16() == 404 || status.as_u16() == 410 {
                        return Err(ConvertError::payload(
                            source_id,
                            SkipReason::MissingBody,
                            format!("{} returned {}", url, status),
                        ));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(source_id, url, %status, attempt, "retrying body fetch");
                        last_err = Some(format!("{} returned {}", url, status));
                        continue;
                    }

                    return Err(ConvertError::payload(
                        source_id,
                        SkipReason::FetchFailed,
                        format!("{} returned {}", url, status),
                    ));
                }
                Err(e) => {
                    debug!(source_id, url, error = %e, attempt, "retrying body fetch");
                    last_err = Some(format!("{}: {}", url, e));
                }
            }
        }

        Err(ConvertError::payload(
            source_id,
            SkipReason::FetchFailed,
            last_err.unwrap_or_else(|| format!("{}: gave up after retries", url)),
        ))
    }

    async fn read_file(&self, source_id: &str, reference: &str) -> Result<Vec<u8>> {
        let path = self.resolve(reference);
        tokio::fs::read(&path).await.map_err(|e| {
            let reason = if e.kind() == std::io::ErrorKind::NotFound {
                SkipReason::MissingBody
            } else {
                SkipReason::FetchFailed
            };
            ConvertError::payload(source_id, reason, format!("{}: {}", path.display(), e))
        })
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let stripped = reference
            .strip_prefix("file://")
            .or_else(|| reference.strip_prefix("file:"))
            .unwrap_or(reference);
        let path = Path::new(stripped);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl BodyLoader for DefaultBodyLoader {
    async fn load(&self, snapshot: &SourceSnapshot) -> Result<Vec<u8>> {
        let bytes = match &snapshot.body {
            BodyRef::Inline(bytes) => bytes.clone(),
            BodyRef::Missing => {
                return Err(ConvertError::payload(
                    &snapshot.id,
                    SkipReason::MissingBody,
                    "no body stored",
                ))
            }
            BodyRef::Remote(reference) if is_http(reference) => {
                self.fetch_http(&snapshot.id, reference).await?
            }
            BodyRef::Remote(reference) => self.read_file(&snapshot.id, reference).await?,
        };
        verify_hash(snapshot, bytes)
    }
}

fn is_http(reference: &str) -> bool {
    let lower = reference.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Reject bytes that do not match the digest recorded with the snapshot.
pub fn verify_hash(snapshot: &SourceSnapshot, bytes: Vec<u8>) -> Result<Vec<u8>> {
    let Some(expected) = snapshot.body_hash.as_deref().map(str::trim).filter(|h| !h.is_empty())
    else {
        return Ok(bytes);
    };
    let actual = digest::sha256_hex(&bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(bytes)
    } else {
        Err(ConvertError::payload(
            &snapshot.id,
            SkipReason::MismatchedBody,
            format!("expected sha256 {}, got {}", expected, actual),
        ))
    }
}
