//! Packing a conversion log into its own archive file.
//!
//! `snapwarc archive-log` writes one file next to the log, named
//! `<log stem>--<timestamp>.warc[.gz]`: a `warcinfo` record followed by the
//! whole log as a single `text/plain` `resource` record dated by the log's
//! modification time. The log then travels with the archives it describes.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Config;
use crate::fileset::{ArchiveFileSet, FileSetOptions};
use crate::identity::RecordIdentity;
use crate::models::{ArchivalContext, CaptureKind, ContainerRecord, RecordType, ResponseDescriptor};
use crate::record::RecordBuilder;

const LOG_MEDIA_TYPE: &str = "text/plain";
const LOG_DESCRIPTION: &str = "Processing log from converting stored web snapshots to WARC files.";

/// The `resource` record holding a log file's bytes.
pub fn log_record(
    identity: &RecordIdentity,
    file_name: &str,
    modified: DateTime<Utc>,
    body: Vec<u8>,
) -> ContainerRecord {
    let source_id = format!("log:{}", file_name);
    let descriptor = ResponseDescriptor {
        record_id: identity.urn(&source_id, 0, RecordType::Resource),
        source_id,
        hop: 0,
        concurrent_to: None,
        url: format!("file:{}", file_name),
        captured_at: modified,
        kind: CaptureKind::Listing,
        status: None,
        location: None,
        media_type: Some(LOG_MEDIA_TYPE.to_string()),
        headers: Default::default(),
        body,
        context: ArchivalContext::default(),
    };
    RecordBuilder::new(identity.clone()).build(&descriptor).primary
}

/// `snapwarc archive-log`: archive `path`, or `[logging].file` when no path
/// is given. Returns the written file.
pub fn run_archive_log(config: &Config, path: Option<&Path>, compress: bool) -> Result<PathBuf> {
    let log_path = match path.or(config.logging.file.as_deref()) {
        Some(p) => p.to_path_buf(),
        None => bail!("No log file given and [logging].file is not set"),
    };
    if !log_path.is_file() {
        bail!("No log file found at {}", log_path.display());
    }

    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Log path has no file name: {}", log_path.display()))?;
    let stem = log_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.clone());
    let directory = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let modified: DateTime<Utc> = fs::metadata(&log_path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat log file: {}", log_path.display()))?
        .into();
    let body = fs::read(&log_path)
        .with_context(|| format!("Failed to read log file: {}", log_path.display()))?;

    let mut warcinfo = config.warcinfo.fields();
    if !warcinfo.iter().any(|(k, _)| k == "description") {
        warcinfo.push(("description".to_string(), LOG_DESCRIPTION.to_string()));
    }

    let identity = RecordIdentity::new(&config.source.dataset)?;
    let record = log_record(&identity, &file_name, modified, body);
    let mut files = ArchiveFileSet::new(
        FileSetOptions {
            directory,
            prefix: format!("{}-", stem),
            max_file_size: u64::MAX,
            compress,
            warcinfo,
        },
        identity,
    );
    files.place(&record)?;
    files.finish()?;

    let written = files
        .files()
        .first()
        .map(|f| f.path.clone())
        .context("No archive file was written")?;
    info!(log = %log_path.display(), archive = %written.display(), "archived log file");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::warc::parse_records;
    use tempfile::TempDir;

    fn config(log: &Path) -> Config {
        parse_config(&format!(
            r#"
            [source]
            path = "unused.sqlite"
            dataset = "logs"

            [logging]
            file = "{}"
            "#,
            log.display()
        ))
        .unwrap()
    }

    #[test]
    fn log_becomes_single_text_resource() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("convert.log");
        fs::write(&log, "line one\nline two\n").unwrap();

        let written = run_archive_log(&config(&log), None, false).unwrap();
        let name = written.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("convert--"), "{}", name);
        assert!(name.ends_with(".warc"));
        assert_eq!(written.parent(), Some(tmp.path()));

        let records = parse_records(&fs::read(&written).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type(), Some("warcinfo"));
        assert!(String::from_utf8_lossy(&records[0].block).contains("description: Processing log"));
        assert_eq!(records[1].record_type(), Some("resource"));
        assert_eq!(records[1].fields.get("Content-Type"), Some("text/plain"));
        assert_eq!(records[1].block, b"line one\nline two\n");
    }

    #[test]
    fn missing_log_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("absent.log");
        let err = run_archive_log(&config(&log), None, false).unwrap_err();
        assert!(err.to_string().contains("No log file found"));
    }
}
