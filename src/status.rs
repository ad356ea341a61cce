//! Effective HTTP status inference.
//!
//! A verbatim status in the valid range always wins. Otherwise the
//! configured rules are tried in order and the first match decides; when
//! none match the capture is assumed to have been a successful fetch whose
//! status was simply never recorded.
//!
//! | Rule | Signal | Result |
//! |------|--------|--------|
//! | `redirect` | metadata lists an absolute redirect URL | 301 |
//! | `shape` | empty or near-empty body, no content type | 404 |
//! | `neighbor` | adjacent capture of the same URL with identical body | its status |
//! | (fallback) | nothing else | 200 |

use serde::Deserialize;

use crate::digest;
use crate::models::{explicit, InferredStatus, Neighbors, Provenance, SourceSnapshot};

pub const REDIRECT_STATUS: u16 = 301;
pub const MISSING_STATUS: u16 = 404;
pub const DEFAULT_STATUS: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceRule {
    Redirect,
    Shape,
    Neighbor,
}

impl InferenceRule {
    pub fn default_order() -> Vec<InferenceRule> {
        vec![
            InferenceRule::Redirect,
            InferenceRule::Shape,
            InferenceRule::Neighbor,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct StatusInferenceEngine {
    rules: Vec<InferenceRule>,
    near_empty_bytes: usize,
}

impl Default for StatusInferenceEngine {
    fn default() -> Self {
        Self::new(InferenceRule::default_order(), 16)
    }
}

impl StatusInferenceEngine {
    pub fn new(rules: Vec<InferenceRule>, near_empty_bytes: usize) -> Self {
        Self {
            rules,
            near_empty_bytes,
        }
    }

    pub fn infer(
        &self,
        snapshot: &SourceSnapshot,
        body: &[u8],
        neighbors: &Neighbors,
    ) -> InferredStatus {
        if let Some(code) = snapshot.explicit_status() {
            return InferredStatus::new(code, Provenance::Explicit);
        }

        let body_hash = digest::sha256_hex(body);
        self.rules
            .iter()
            .find_map(|rule| self.apply(*rule, snapshot, body, &body_hash, neighbors))
            .unwrap_or(InferredStatus::new(DEFAULT_STATUS, Provenance::Unknown))
    }

    /// Whether [`infer`](Self::infer) would consult neighbors for this
    /// snapshot. Lets callers skip the neighbor lookup entirely when an
    /// earlier signal already decides.
    pub fn requires_neighbors(&self, snapshot: &SourceSnapshot, body: &[u8]) -> bool {
        if snapshot.explicit_status().is_some() {
            return false;
        }
        for rule in &self.rules {
            match rule {
                InferenceRule::Neighbor => return true,
                InferenceRule::Redirect if self.redirect(snapshot).is_some() => return false,
                InferenceRule::Shape if self.shape(snapshot, body).is_some() => return false,
                _ => {}
            }
        }
        false
    }

    fn apply(
        &self,
        rule: InferenceRule,
        snapshot: &SourceSnapshot,
        body: &[u8],
        body_hash: &str,
        neighbors: &Neighbors,
    ) -> Option<InferredStatus> {
        match rule {
            InferenceRule::Redirect => self.redirect(snapshot),
            InferenceRule::Shape => self.shape(snapshot, body),
            InferenceRule::Neighbor => neighbor(body_hash, neighbors),
        }
    }

    fn redirect(&self, snapshot: &SourceSnapshot) -> Option<InferredStatus> {
        snapshot
            .metadata
            .has_redirects()
            .then(|| InferredStatus::new(REDIRECT_STATUS, Provenance::InferredFromRedirect))
    }

    fn shape(&self, snapshot: &SourceSnapshot, body: &[u8]) -> Option<InferredStatus> {
        let meaningful = body.iter().filter(|b| !b.is_ascii_whitespace()).count();
        (meaningful <= self.near_empty_bytes && !snapshot.has_content_type())
            .then(|| InferredStatus::new(MISSING_STATUS, Provenance::InferredFromShape))
    }
}

fn neighbor(body_hash: &str, neighbors: &Neighbors) -> Option<InferredStatus> {
    [&neighbors.previous, &neighbors.next]
        .into_iter()
        .flatten()
        .find_map(|n| {
            let code = explicit(n.status)?;
            n.body_hash
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(body_hash))
                .then(|| InferredStatus::new(code, Provenance::InferredFromNeighbor))
        })
}
