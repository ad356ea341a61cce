//! Redirect chain expansion.
//!
//! A snapshot whose metadata lists the redirects followed during capture is
//! flattened into one descriptor per hop. Hops `0..K` are synthetic `301`
//! responses with empty bodies (they were never fetched on their own) whose
//! `Location` points at the next hop; hop `K` carries the captured status,
//! headers, and body bound to the final URL. A chain that ends at an `ftp://`
//! URL ends in a listing rather than an HTTP response.
//!
//! Malformed chain metadata never drops a snapshot. Bad entries are skipped
//! and reported as [`ChainIssue`]s alongside the expanded hops.

use serde_json::Value;
use std::fmt;

use crate::identity::RecordIdentity;
use crate::models::{
    is_url_like, ArchivalContext, CaptureKind, InferredStatus, Provenance, RecordType,
    ResponseDescriptor, SourceSnapshot,
};
use crate::status::REDIRECT_STATUS;

/// Something wrong with a snapshot's redirect metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainIssue {
    /// A `redirects` entry that is null, empty, or not an absolute URL.
    InvalidEntry { index: usize, value: String },
    /// `redirect_url` is present but is not an absolute URL.
    InvalidRedirectUrl(String),
    /// The last valid redirect entry disagrees with `redirect_url`.
    FinalMismatch {
        redirect_url: String,
        last_entry: String,
    },
    /// `redirect_url` is present but there are no redirect entries.
    OrphanRedirectUrl(String),
}

impl fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainIssue::InvalidEntry { index, value } => {
                write!(f, "redirect entry {} is not a URL: {}", index, value)
            }
            ChainIssue::InvalidRedirectUrl(url) => {
                write!(f, "redirect_url is not a URL: {}", url)
            }
            ChainIssue::FinalMismatch {
                redirect_url,
                last_entry,
            } => write!(
                f,
                "last redirect entry {} differs from redirect_url {}; using redirect_url",
                last_entry, redirect_url
            ),
            ChainIssue::OrphanRedirectUrl(url) => {
                write!(f, "redirect_url {} given without any redirect entries", url)
            }
        }
    }
}

/// The hops of one snapshot, in order, plus anything odd found on the way.
#[derive(Debug, Clone)]
pub struct ExpandedChain {
    pub hops: Vec<ResponseDescriptor>,
    pub issues: Vec<ChainIssue>,
}

impl ExpandedChain {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RedirectChainExpander {
    identity: RecordIdentity,
}

impl RedirectChainExpander {
    pub fn new(identity: RecordIdentity) -> Self {
        Self { identity }
    }

    /// Expand a page capture into its redirect hops.
    pub fn expand(
        &self,
        snapshot: &SourceSnapshot,
        status: InferredStatus,
        body: Vec<u8>,
    ) -> ExpandedChain {
        let (history, issues) = resolve_history(snapshot);
        let last = history.len() - 1;
        let first_id = self.identity.urn(&snapshot.id, 0, RecordType::Response);

        let mut hops = Vec::with_capacity(history.len());
        let mut body = Some(body);
        for (index, url) in history.iter().enumerate() {
            let hop = index as u32;
            let mut descriptor = ResponseDescriptor {
                source_id: snapshot.id.clone(),
                hop,
                record_id: self.identity.urn(&snapshot.id, hop, RecordType::Response),
                concurrent_to: (index > 0).then(|| first_id.clone()),
                url: url.clone(),
                captured_at: snapshot.captured_at,
                kind: CaptureKind::Page,
                status: Some(InferredStatus::new(
                    REDIRECT_STATUS,
                    Provenance::InferredFromRedirect,
                )),
                location: None,
                media_type: None,
                headers: Default::default(),
                body: Vec::new(),
                context: ArchivalContext {
                    via: index.checked_sub(1).map(|prev| history[prev].clone()),
                    hops_from_seed: hop,
                    title: snapshot.title.clone(),
                    source_uri: snapshot.metadata.source_url.clone(),
                    annotations: Default::default(),
                },
            };

            if index == last {
                if index > 0 && CaptureKind::classify(None, url) == CaptureKind::Listing {
                    descriptor.kind = CaptureKind::Listing;
                    descriptor.record_id =
                        self.identity.urn(&snapshot.id, hop, RecordType::Resource);
                }
                descriptor.status = Some(status);
                descriptor.media_type = snapshot.media_type.clone();
                descriptor.headers = snapshot.headers.clone();
                descriptor.body = body.take().unwrap_or_default();
                descriptor.context.annotations = annotations(snapshot);
            } else {
                descriptor.location = Some(history[index + 1].clone());
            }
            hops.push(descriptor);
        }

        ExpandedChain { hops, issues }
    }

    /// A directory or file listing: one `resource` descriptor, no status.
    pub fn listing(&self, snapshot: &SourceSnapshot, body: Vec<u8>) -> ResponseDescriptor {
        ResponseDescriptor {
            source_id: snapshot.id.clone(),
            hop: 0,
            record_id: self.identity.urn(&snapshot.id, 0, RecordType::Resource),
            concurrent_to: None,
            url: snapshot.url.clone(),
            captured_at: snapshot.captured_at,
            kind: CaptureKind::Listing,
            status: None,
            location: None,
            media_type: snapshot.media_type.clone(),
            headers: snapshot.headers.clone(),
            body,
            context: ArchivalContext {
                title: snapshot.title.clone(),
                source_uri: snapshot.metadata.source_url.clone(),
                annotations: annotations(snapshot),
                ..Default::default()
            },
        }
    }
}

/// The ordered URLs visited for a snapshot, starting at the requested URL.
fn resolve_history(snapshot: &SourceSnapshot) -> (Vec<String>, Vec<ChainIssue>) {
    let mut issues = Vec::new();
    let mut history = vec![snapshot.url.clone()];

    for (index, entry) in snapshot.metadata.redirects.iter().enumerate() {
        match entry.as_str() {
            Some(url) if is_url_like(url) => history.push(url.trim().to_string()),
            _ => issues.push(ChainIssue::InvalidEntry {
                index,
                value: describe(entry),
            }),
        }
    }

    let redirect_url = match snapshot.metadata.redirect_url.as_deref() {
        Some(url) if is_url_like(url) => Some(url.trim()),
        Some(url) => {
            issues.push(ChainIssue::InvalidRedirectUrl(url.to_string()));
            None
        }
        None => None,
    };

    if let Some(final_url) = redirect_url {
        if history.len() == 1 {
            issues.push(ChainIssue::OrphanRedirectUrl(final_url.to_string()));
        } else if let Some(last) = history.last_mut() {
            if last.as_str() != final_url {
                issues.push(ChainIssue::FinalMismatch {
                    redirect_url: final_url.to_string(),
                    last_entry: last.clone(),
                });
                *last = final_url.to_string();
            }
        }
    }

    (history, issues)
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) if s.is_empty() => "(empty)".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn annotations(snapshot: &SourceSnapshot) -> std::collections::BTreeMap<String, String> {
    snapshot
        .metadata
        .extra
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}
