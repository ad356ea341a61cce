//! Error types for the conversion pipeline.
//!
//! Only two kinds abort a run: failing to read from the source and failing
//! to open, write, or close an archive file. Unreadable payloads are scoped
//! to a single snapshot and reported with its source ID so the skipped set
//! can be reprocessed separately.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvertError>;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// The query layer failed to yield a record.
    #[error("failed to read source snapshots: {0}")]
    SourceRead(#[source] anyhow::Error),

    /// Payload bytes could not be obtained, so no digest can be computed.
    #[error("{reason} for snapshot {source_id}: {detail}")]
    Payload {
        source_id: String,
        reason: SkipReason,
        detail: String,
    },

    /// An archive file could not be opened, written, or closed.
    #[error("archive file {}: {source}", path.display())]
    RotationIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    pub fn source_read(err: impl Into<anyhow::Error>) -> Self {
        ConvertError::SourceRead(err.into())
    }

    pub fn payload(source_id: &str, reason: SkipReason, detail: impl Into<String>) -> Self {
        ConvertError::Payload {
            source_id: source_id.to_string(),
            reason,
            detail: detail.into(),
        }
    }

    pub fn rotation_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvertError::RotationIo {
            path: path.into(),
            source,
        }
    }
}

/// Why a snapshot was left out of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    MissingBody,
    MismatchedBody,
    FetchFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingBody => "missing_body",
            SkipReason::MismatchedBody => "mismatched_body",
            SkipReason::FetchFailed => "fetch_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_message_names_file() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = ConvertError::rotation_io("/tmp/a.warc.open", io);
        assert_eq!(err.to_string(), "archive file /tmp/a.warc.open: disk full");
    }

    #[test]
    fn payload_message_names_source_id() {
        let err = ConvertError::payload("abc-123", SkipReason::MismatchedBody, "hash differs");
        assert_eq!(
            err.to_string(),
            "mismatched_body for snapshot abc-123: hash differs"
        );
    }
}
