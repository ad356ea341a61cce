use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

use snapshot_warc::body::DefaultBodyLoader;
use snapshot_warc::config::BodiesConfig;
use snapshot_warc::error::{ConvertError, SkipReason};
use snapshot_warc::fileset::{ArchiveFileSet, FileSetOptions};
use snapshot_warc::identity::RecordIdentity;
use snapshot_warc::models::{
    BodyRef, CaptureKind, Neighbors, Provenance, SourceMetadata, SourceSnapshot,
};
use snapshot_warc::pipeline::{Pipeline, RunSummary};
use snapshot_warc::record::{self, RecordBuilder};
use snapshot_warc::redirect::RedirectChainExpander;
use snapshot_warc::source::{MemorySource, SnapshotSource};
use snapshot_warc::status::StatusInferenceEngine;
use snapshot_warc::verify::{read_archive, verify_file};
use snapshot_warc::warc::{parse_records, ParsedRecord};

const DATASET: &str = "pipeline";

fn captured() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap()
}

fn snapshot(id: &str, status: Option<i64>, body: &[u8]) -> SourceSnapshot {
    SourceSnapshot {
        id: id.to_string(),
        url: "http://example.gov/page".to_string(),
        captured_at: captured(),
        status,
        media_type: Some("text/html".to_string()),
        headers: BTreeMap::new(),
        body: BodyRef::Inline(body.to_vec()),
        body_hash: None,
        title: None,
        metadata: SourceMetadata::default(),
        kind: CaptureKind::Page,
    }
}

fn pipeline() -> Pipeline {
    let loader = DefaultBodyLoader::new(&BodiesConfig::default()).unwrap();
    Pipeline::new(
        RecordIdentity::new(DATASET).unwrap(),
        StatusInferenceEngine::default(),
        Box::new(loader),
    )
    .with_workers(3)
}

fn file_set(dir: &Path, max_file_size: u64) -> ArchiveFileSet {
    ArchiveFileSet::new(
        FileSetOptions {
            directory: dir.to_path_buf(),
            prefix: "test".to_string(),
            max_file_size,
            compress: false,
            warcinfo: vec![("operator".to_string(), "tests".to_string())],
        },
        RecordIdentity::new(DATASET).unwrap(),
    )
}

async fn convert(snapshots: Vec<SourceSnapshot>, dir: &Path, max: u64) -> RunSummary {
    let mut source = MemorySource::new(snapshots);
    let mut files = file_set(dir, max);
    pipeline().run(&mut source, &mut files).await.unwrap()
}

fn data_records(summary: &RunSummary) -> Vec<ParsedRecord> {
    summary
        .files
        .iter()
        .flat_map(|f| parse_records(&read_archive(&f.path).unwrap()).unwrap())
        .filter(|r| r.record_type() != Some("warcinfo"))
        .collect()
}

fn status_of(record: &ParsedRecord) -> String {
    let line_end = record.block.windows(2).position(|w| w == b"\r\n").unwrap();
    String::from_utf8_lossy(&record.block[..line_end]).into_owned()
}

fn http_body(record: &ParsedRecord) -> &[u8] {
    let at = record.block.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    &record.block[at + 4..]
}

#[tokio::test]
async fn explicit_status_single_response() {
    let tmp = TempDir::new().unwrap();
    let summary = convert(vec![snapshot("a", Some(200), b"<html>ok</html>")], tmp.path(), 1 << 20).await;

    assert_eq!(summary.archived, 1);
    assert_eq!(summary.provenance.get(&Provenance::Explicit), Some(&1));
    let records = data_records(&summary);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_type(), Some("response"));
    assert_eq!(status_of(&records[0]), "HTTP/1.1 200 OK");
    assert!(verify_file(&summary.files[0].path).unwrap().is_valid());
}

#[tokio::test]
async fn redirect_chain_becomes_three_hops() {
    let tmp = TempDir::new().unwrap();
    let mut s = snapshot("b", None, b"<html>final</html>");
    s.url = "http://a/".to_string();
    s.metadata = SourceMetadata::from_value(json!({
        "redirects": ["http://a/x", "http://a/y"],
        "redirect_url": "http://a/y",
    }));
    let summary = convert(vec![s], tmp.path(), 1 << 20).await;

    assert_eq!(summary.inconsistent_chains, 0);
    assert_eq!(summary.provenance.get(&Provenance::InferredFromRedirect), Some(&1));
    let responses: Vec<_> = data_records(&summary)
        .into_iter()
        .filter(|r| r.record_type() == Some("response"))
        .collect();
    assert_eq!(responses.len(), 3);

    let urls: Vec<_> = responses
        .iter()
        .map(|r| r.fields.get("WARC-Target-URI").unwrap().to_string())
        .collect();
    assert_eq!(urls, ["http://a/", "http://a/x", "http://a/y"]);
    for hop in &responses[..2] {
        assert_eq!(status_of(hop), "HTTP/1.1 301 Moved Permanently");
        assert!(http_body(hop).is_empty());
    }
    assert_eq!(http_body(&responses[2]), b"<html>final</html>");
    let first_id = responses[0].record_id().unwrap();
    assert_eq!(responses[2].fields.get("WARC-Concurrent-To"), Some(first_id));
}

#[tokio::test]
async fn fifteen_snapshots_rotate_ten_and_five() {
    let tmp = TempDir::new().unwrap();
    let identity = RecordIdentity::new(DATASET).unwrap();
    let snapshots: Vec<_> = (0..15)
        .map(|n| snapshot(&format!("c{:02}", n), Some(200), &[b'z'; 300]))
        .collect();

    let expander = RedirectChainExpander::new(identity.clone());
    let engine = StatusInferenceEngine::default();
    let sample = &snapshots[0];
    let status = engine.infer(sample, &[b'z'; 300], &Neighbors::default());
    let chain = expander.expand(sample, status, vec![b'z'; 300]);
    let built = RecordBuilder::new(identity.clone()).build(&chain.hops[0]);
    assert!(built.metadata.is_none());
    let len = built.primary.byte_len() as u64;
    let info = record::warcinfo(
        &identity,
        "test-20170101T000000.warc",
        captured(),
        &[("operator".to_string(), "tests".to_string())],
    );
    let bound = info.byte_len() as u64 + 10 * len + len / 2;

    let summary = convert(snapshots, tmp.path(), bound).await;
    let counts: Vec<_> = summary.files.iter().map(|f| f.records).collect();
    assert_eq!(counts, [10, 5]);
    for file in &summary.files {
        let report = verify_file(&file.path).unwrap();
        assert!(report.is_valid(), "{:?}", report.problems);
        assert_eq!(report.records, file.records + 1);
    }
}

#[tokio::test]
async fn empty_body_without_content_type_is_404() {
    let tmp = TempDir::new().unwrap();
    let mut s = snapshot("d", None, b"");
    s.media_type = None;
    let summary = convert(vec![s], tmp.path(), 1 << 20).await;

    assert_eq!(summary.provenance.get(&Provenance::InferredFromShape), Some(&1));
    let records = data_records(&summary);
    assert_eq!(status_of(&records[0]), "HTTP/1.1 404 Not Found");
}

#[tokio::test]
async fn neighbor_with_identical_body_lends_status() {
    let tmp = TempDir::new().unwrap();
    let body = b"<html>This page has been removed.</html>";
    let mut earlier = snapshot("n1", Some(410), body);
    earlier.captured_at = captured() - chrono::Duration::days(1);
    let later = snapshot("n2", None, body);
    let summary = convert(vec![earlier, later], tmp.path(), 1 << 20).await;

    assert_eq!(summary.provenance.get(&Provenance::InferredFromNeighbor), Some(&1));
    let records = data_records(&summary);
    assert_eq!(status_of(&records[1]), "HTTP/1.1 410 Gone");
}

#[tokio::test]
async fn listings_become_resources() {
    let tmp = TempDir::new().unwrap();
    let mut s = snapshot("l", None, b"README\npub/\n");
    s.url = "ftp://example.gov/".to_string();
    s.kind = CaptureKind::Listing;
    s.media_type = Some("text/plain".to_string());
    let summary = convert(vec![s], tmp.path(), 1 << 20).await;

    assert_eq!(summary.listings, 1);
    assert!(summary.provenance.is_empty());
    let records = data_records(&summary);
    assert_eq!(records[0].record_type(), Some("resource"));
    assert_eq!(records[0].block, b"README\npub/\n");
}

#[tokio::test]
async fn redirect_to_ftp_ends_in_resource() {
    let tmp = TempDir::new().unwrap();
    let mut s = snapshot("f", None, b"file contents");
    s.media_type = Some("text/plain".to_string());
    s.metadata = SourceMetadata::from_value(json!({"redirects": ["ftp://example.gov/pub/a.txt"]}));
    let summary = convert(vec![s], tmp.path(), 1 << 20).await;

    let records: Vec<_> = data_records(&summary)
        .into_iter()
        .filter(|r| r.record_type() != Some("metadata"))
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].record_type(), Some("response"));
    assert_eq!(status_of(&records[0]), "HTTP/1.1 301 Moved Permanently");
    assert_eq!(records[1].record_type(), Some("resource"));
    assert_eq!(records[1].fields.get("WARC-Target-URI"), Some("ftp://example.gov/pub/a.txt"));
    assert_eq!(records[1].block, b"file contents");
    assert!(verify_file(&summary.files[0].path).unwrap().is_valid());
}

#[tokio::test]
async fn relative_redirect_entry_is_not_a_redirect() {
    let tmp = TempDir::new().unwrap();
    let mut s = snapshot("rel", None, b"<html>a real page with content</html>");
    s.metadata = SourceMetadata::from_value(json!({"redirects": ["/moved"]}));
    let summary = convert(vec![s], tmp.path(), 1 << 20).await;

    assert_eq!(summary.inconsistent_chains, 1);
    assert_eq!(summary.provenance.get(&Provenance::Unknown), Some(&1));
    let records = data_records(&summary);
    assert_eq!(records[0].record_type(), Some("response"));
    assert_eq!(status_of(&records[0]), "HTTP/1.1 200 OK");
}

#[tokio::test]
async fn unreadable_bodies_are_skipped_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut missing = snapshot("m", Some(200), b"");
    missing.body = BodyRef::Missing;
    let mut tampered = snapshot("t", Some(200), b"changed");
    tampered.body_hash = Some("00".repeat(32));
    let fine = snapshot("f", Some(200), b"fine");

    let summary = convert(vec![missing, tampered, fine], tmp.path(), 1 << 20).await;
    assert_eq!(summary.archived, 1);
    assert_eq!(summary.rows_read, 3);
    assert_eq!(summary.skipped.get(&SkipReason::MissingBody), Some(&1));
    assert_eq!(summary.skipped.get(&SkipReason::MismatchedBody), Some(&1));
    assert_eq!(summary.skipped_ids, ["m", "t"]);
    assert_eq!(data_records(&summary).len(), 1);
}

#[tokio::test]
async fn limit_caps_rows() {
    let tmp = TempDir::new().unwrap();
    let snapshots: Vec<_> = (0..10)
        .map(|n| snapshot(&n.to_string(), Some(200), b"x"))
        .collect();
    let mut source = MemorySource::new(snapshots);
    let mut files = file_set(tmp.path(), 1 << 20);
    let summary = pipeline()
        .with_limit(Some(4))
        .run(&mut source, &mut files)
        .await
        .unwrap();

    assert_eq!(summary.rows_read, 4);
    assert_eq!(summary.archived, 4);
}

#[tokio::test]
async fn stop_flag_ends_run_cleanly() {
    let tmp = TempDir::new().unwrap();
    let snapshots: Vec<_> = (0..10)
        .map(|n| snapshot(&n.to_string(), Some(200), b"x"))
        .collect();
    let mut source = MemorySource::new(snapshots);
    let mut files = file_set(tmp.path(), 1 << 20);
    let summary = pipeline()
        .with_stop_flag(Arc::new(AtomicBool::new(true)))
        .run(&mut source, &mut files)
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.archived, 0);
    assert!(!files.is_open());
}

#[tokio::test]
async fn same_input_same_bytes() {
    let make = || {
        let mut b = snapshot("b", None, b"<html>final</html>");
        b.metadata = SourceMetadata::from_value(json!({
            "redirects": ["http://example.gov/next"],
            "note": "kept",
        }));
        vec![snapshot("a", Some(200), b"one"), b]
    };
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let one = convert(make(), first.path(), 1 << 20).await;
    let two = convert(make(), second.path(), 1 << 20).await;

    assert_eq!(one.files.len(), two.files.len());
    for (a, b) in one.files.iter().zip(&two.files) {
        assert_eq!(std::fs::read(&a.path).unwrap(), std::fs::read(&b.path).unwrap());
    }
}

/// Yields one snapshot, then fails.
struct FailingSource {
    served: bool,
}

#[async_trait]
impl SnapshotSource for FailingSource {
    async fn next_snapshot(&mut self) -> snapshot_warc::error::Result<Option<SourceSnapshot>> {
        if self.served {
            return Err(ConvertError::source_read(anyhow::anyhow!("connection reset")));
        }
        self.served = true;
        Ok(Some(snapshot("only", Some(200), b"body")))
    }

    async fn neighbors(&mut self, _: &SourceSnapshot) -> snapshot_warc::error::Result<Neighbors> {
        Ok(Neighbors::default())
    }
}

#[tokio::test]
async fn source_failure_aborts_after_closing_file() {
    let tmp = TempDir::new().unwrap();
    let mut source = FailingSource { served: false };
    let mut files = file_set(tmp.path(), 1 << 20);
    let pipeline = pipeline().with_workers(1);

    let err = pipeline.run(&mut source, &mut files).await.unwrap_err();
    assert!(matches!(err, ConvertError::SourceRead(_)));

    assert_eq!(files.files().len(), 1);
    let report = verify_file(&files.files()[0].path).unwrap();
    assert!(report.is_valid());
    assert_eq!(report.records, 2);
}

/// Serves its snapshots, then fails on the next read.
struct FailsAfter {
    rows: Vec<SourceSnapshot>,
}

#[async_trait]
impl SnapshotSource for FailsAfter {
    async fn next_snapshot(&mut self) -> snapshot_warc::error::Result<Option<SourceSnapshot>> {
        if self.rows.is_empty() {
            return Err(ConvertError::source_read(anyhow::anyhow!("database gone")));
        }
        Ok(Some(self.rows.remove(0)))
    }

    async fn neighbors(&mut self, _: &SourceSnapshot) -> snapshot_warc::error::Result<Neighbors> {
        Ok(Neighbors::default())
    }
}

#[tokio::test]
async fn rows_read_before_source_failure_are_archived() {
    let tmp = TempDir::new().unwrap();
    let mut source = FailsAfter {
        rows: vec![
            snapshot("r1", Some(200), b"first"),
            snapshot("r2", Some(200), b"second"),
        ],
    };
    let mut files = file_set(tmp.path(), 1 << 20);
    let pipeline = pipeline().with_workers(4);

    let err = pipeline.run(&mut source, &mut files).await.unwrap_err();
    assert!(matches!(err, ConvertError::SourceRead(_)));

    assert_eq!(files.files().len(), 1);
    let records = parse_records(&read_archive(&files.files()[0].path).unwrap()).unwrap();
    let ids: Vec<_> = records
        .iter()
        .filter(|r| r.record_type() == Some("response"))
        .map(|r| r.record_id().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0].ends_with(":r1>"));
    assert!(ids[1].ends_with(":r2>"));
}
