//! The ordered stream of snapshots to archive.
//!
//! [`SnapshotSource`] is the seam between the pipeline and wherever the
//! captures are stored. [`SqliteSource`] reads the `snapshots` table created
//! by `snapwarc init`; [`MemorySource`] serves a fixed list and is what
//! embedders and tests use.
//!
//! Rows are read best-effort: a header or metadata blob that fails to parse
//! is logged and treated as empty so the capture itself is still archived.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::{self, OpenMode};
use crate::digest;
use crate::error::{ConvertError, Result};
use crate::models::{
    BodyRef, CaptureKind, NeighborCapture, Neighbors, SourceMetadata, SourceSnapshot,
};

#[async_trait]
pub trait SnapshotSource: Send {
    /// Next snapshot in source order, or `None` when exhausted.
    async fn next_snapshot(&mut self) -> Result<Option<SourceSnapshot>>;

    /// Captures of the same URL immediately before and after `snapshot`.
    async fn neighbors(&mut self, snapshot: &SourceSnapshot) -> Result<Neighbors>;
}

const SELECT_COLUMNS: &str = "rowid, id, url, capture_time, status, media_type, headers, \
     body, body_url, body_hash, title, source_metadata, capture_kind";

/// Keyset-paged reader over the `snapshots` table, in insertion order.
pub struct SqliteSource {
    pool: SqlitePool,
    page_size: u32,
    since: Option<i64>,
    until: Option<i64>,
    cursor: i64,
    buffer: VecDeque<SourceSnapshot>,
    exhausted: bool,
}

impl SqliteSource {
    pub fn new(pool: SqlitePool, page_size: u32, since: Option<i64>, until: Option<i64>) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
            since,
            until,
            cursor: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config.source.path, OpenMode::Existing).await?;
        let (since, until) = config.time_range()?;
        Ok(Self::new(pool, config.source.page_size, since, until))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let sql = format!(
            "SELECT {} FROM snapshots \
             WHERE rowid > ? \
               AND (? IS NULL OR capture_time >= ?) \
               AND (? IS NULL OR capture_time <= ?) \
             ORDER BY rowid LIMIT ?",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(self.cursor)
            .bind(self.since)
            .bind(self.since)
            .bind(self.until)
            .bind(self.until)
            .bind(self.page_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(ConvertError::source_read)?;

        debug!(rows = rows.len(), after = self.cursor, "fetched snapshot page");
        if (rows.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        for row in &rows {
            let (rowid, snapshot) = snapshot_from_row(row).map_err(ConvertError::source_read)?;
            self.cursor = rowid;
            self.buffer.push_back(snapshot);
        }
        Ok(())
    }

    async fn adjacent(&self, snapshot: &SourceSnapshot, later: bool) -> Result<Option<NeighborCapture>> {
        let sql = if later {
            "SELECT status, body_hash, CASE WHEN body_hash IS NULL THEN body END AS body \
             FROM snapshots \
             WHERE url = ?1 AND id != ?3 AND (capture_time > ?2 OR (capture_time = ?2 AND \
                   rowid > (SELECT rowid FROM snapshots WHERE id = ?3))) \
             ORDER BY capture_time ASC, rowid ASC LIMIT 1"
        } else {
            "SELECT status, body_hash, CASE WHEN body_hash IS NULL THEN body END AS body \
             FROM snapshots \
             WHERE url = ?1 AND id != ?3 AND (capture_time < ?2 OR (capture_time = ?2 AND \
                   rowid < (SELECT rowid FROM snapshots WHERE id = ?3))) \
             ORDER BY capture_time DESC, rowid DESC LIMIT 1"
        };
        let row = sqlx::query(sql)
            .bind(&snapshot.url)
            .bind(snapshot.captured_at.timestamp())
            .bind(&snapshot.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ConvertError::source_read)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: Option<i64> = row.try_get("status").map_err(ConvertError::source_read)?;
        let body_hash: Option<String> =
            row.try_get("body_hash").map_err(ConvertError::source_read)?;
        let body: Option<Vec<u8>> = row.try_get("body").map_err(ConvertError::source_read)?;
        Ok(Some(NeighborCapture {
            status,
            body_hash: body_hash.or_else(|| body.as_deref().map(digest::sha256_hex)),
        }))
    }
}

#[async_trait]
impl SnapshotSource for SqliteSource {
    async fn next_snapshot(&mut self) -> Result<Option<SourceSnapshot>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn neighbors(&mut self, snapshot: &SourceSnapshot) -> Result<Neighbors> {
        Ok(Neighbors {
            previous: self.adjacent(snapshot, false).await?,
            next: self.adjacent(snapshot, true).await?,
        })
    }
}

fn snapshot_from_row(row: &SqliteRow) -> std::result::Result<(i64, SourceSnapshot), sqlx::Error> {
    let rowid: i64 = row.try_get("rowid")?;
    let id: String = row.try_get("id")?;
    let url: String = row.try_get("url")?;
    let capture_time: i64 = row.try_get("capture_time")?;
    let headers: Option<String> = row.try_get("headers")?;
    let body: Option<Vec<u8>> = row.try_get("body")?;
    let body_url: Option<String> = row.try_get("body_url")?;
    let metadata: Option<String> = row.try_get("source_metadata")?;
    let capture_kind: Option<String> = row.try_get("capture_kind")?;

    let captured_at = DateTime::<Utc>::from_timestamp(capture_time, 0).unwrap_or_else(|| {
        warn!(source_id = %id, capture_time, "capture time out of range, using epoch");
        DateTime::<Utc>::default()
    });

    let body = match (body, body_url) {
        (Some(bytes), _) => BodyRef::Inline(bytes),
        (None, Some(reference)) if !reference.trim().is_empty() => BodyRef::Remote(reference),
        _ => BodyRef::Missing,
    };

    let snapshot = SourceSnapshot {
        kind: CaptureKind::classify(capture_kind.as_deref(), &url),
        headers: parse_headers(&id, headers.as_deref()),
        metadata: parse_metadata(&id, metadata.as_deref()),
        status: row.try_get("status")?,
        media_type: row.try_get("media_type")?,
        body_hash: row.try_get("body_hash")?,
        title: row.try_get("title")?,
        id,
        url,
        captured_at,
        body,
    };
    Ok((rowid, snapshot))
}

/// Header JSON object to a flat map. Non-string values are kept in their
/// JSON text form.
fn parse_headers(source_id: &str, raw: Option<&str>) -> BTreeMap<String, String> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        Ok(Value::Null) => BTreeMap::new(),
        Ok(_) => {
            warn!(source_id, "headers are not a JSON object, ignoring");
            BTreeMap::new()
        }
        Err(e) => {
            warn!(source_id, error = %e, "unparseable headers, ignoring");
            BTreeMap::new()
        }
    }
}

fn parse_metadata(source_id: &str, raw: Option<&str>) -> SourceMetadata {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return SourceMetadata::default();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => SourceMetadata::from_value(value),
        Err(e) => {
            warn!(source_id, error = %e, "unparseable source metadata, ignoring");
            SourceMetadata::default()
        }
    }
}

/// A fixed, in-order list of snapshots.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    snapshots: Vec<SourceSnapshot>,
    position: usize,
}

impl MemorySource {
    pub fn new(snapshots: Vec<SourceSnapshot>) -> Self {
        Self {
            snapshots,
            position: 0,
        }
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    async fn next_snapshot(&mut self) -> Result<Option<SourceSnapshot>> {
        let next = self.snapshots.get(self.position).cloned();
        if next.is_some() {
            self.position += 1;
        }
        Ok(next)
    }

    async fn neighbors(&mut self, snapshot: &SourceSnapshot) -> Result<Neighbors> {
        let mut history: Vec<(usize, &SourceSnapshot)> = self
            .snapshots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.url == snapshot.url)
            .collect();
        history.sort_by_key(|(index, s)| (s.captured_at, *index));

        let Some(at) = history.iter().position(|(_, s)| s.id == snapshot.id) else {
            return Ok(Neighbors::default());
        };
        let capture = |s: &SourceSnapshot| NeighborCapture {
            status: s.status,
            body_hash: s.body_hash.clone().or_else(|| match &s.body {
                BodyRef::Inline(bytes) => Some(digest::sha256_hex(bytes)),
                _ => None,
            }),
        };
        Ok(Neighbors {
            previous: at.checked_sub(1).map(|i| capture(history[i].1)),
            next: history.get(at + 1).map(|&(_, s)| capture(s)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::migrate;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct TestRow<'a> {
        id: &'a str,
        url: &'a str,
        time: i64,
        status: Option<i64>,
        body: Option<&'a [u8]>,
        headers: &'a str,
        metadata: &'a str,
    }

    impl<'a> TestRow<'a> {
        fn new(id: &'a str, url: &'a str, time: i64) -> Self {
            Self {
                id,
                url,
                time,
                status: Some(200),
                body: Some(b"hello"),
                headers: "{}",
                metadata: "{}",
            }
        }
    }

    async fn setup(rows: &[TestRow<'_>]) -> (TempDir, Config, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("snapshots.sqlite");
        let config = parse_config(&format!(
            "[source]\npath = {:?}\ndataset = \"test\"\npage_size = 2\n",
            db_path.to_string_lossy()
        ))
        .unwrap();
        migrate::run_migrations(&config).await.unwrap();
        let pool = db::connect(&db_path, OpenMode::Create).await.unwrap();
        for row in rows {
            sqlx::query(
                "INSERT INTO snapshots (id, url, capture_time, status, headers, body, source_metadata) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.id)
            .bind(row.url)
            .bind(row.time)
            .bind(row.status)
            .bind(row.headers)
            .bind(row.body)
            .bind(row.metadata)
            .execute(&pool)
            .await
            .unwrap();
        }
        (tmp, config, pool)
    }

    async fn drain(source: &mut dyn SnapshotSource) -> Vec<SourceSnapshot> {
        let mut out = Vec::new();
        while let Some(s) = source.next_snapshot().await.unwrap() {
            out.push(s);
        }
        out
    }

    #[tokio::test]
    async fn pages_in_insertion_order() {
        let rows: Vec<TestRow> = ["e", "a", "d", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, id)| TestRow::new(id, "http://a/", 1000 - i as i64))
            .collect();
        let (_tmp, _config, pool) = setup(&rows).await;

        let mut source = SqliteSource::new(pool, 2, None, None);
        let ids: Vec<_> = drain(&mut source).await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["e", "a", "d", "b", "c"]);
    }

    #[tokio::test]
    async fn time_window_filters() {
        let rows = [
            TestRow::new("1", "http://a/", 100),
            TestRow::new("2", "http://a/", 200),
            TestRow::new("3", "http://a/", 300),
        ];
        let (_tmp, _config, pool) = setup(&rows).await;

        let mut source = SqliteSource::new(pool, 10, Some(150), Some(300));
        let ids: Vec<_> = drain(&mut source).await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["2", "3"]);
    }

    #[tokio::test]
    async fn malformed_json_is_tolerated() {
        let mut row = TestRow::new("1", "http://a/", 100);
        row.headers = "{not json";
        row.metadata = "[1, 2";
        row.status = None;
        row.body = None;
        let (_tmp, _config, pool) = setup(&[row]).await;

        let mut source = SqliteSource::new(pool, 10, None, None);
        let snapshot = source.next_snapshot().await.unwrap().unwrap();
        assert!(snapshot.headers.is_empty());
        assert_eq!(snapshot.metadata, SourceMetadata::default());
        assert_eq!(snapshot.status, None);
        assert_eq!(snapshot.body, BodyRef::Missing);
        assert_eq!(snapshot.kind, CaptureKind::Page);
        assert_eq!(snapshot.captured_at, Utc.timestamp_opt(100, 0).unwrap());
    }

    #[tokio::test]
    async fn headers_and_metadata_parsed() {
        let mut row = TestRow::new("1", "ftp://a/pub/", 100);
        row.headers = r#"{"Content-Type": "text/html", "X-Count": 3, "X-Null": null}"#;
        row.metadata = r#"{"redirects": ["http://a/b"], "redirect_url": "http://a/b", "diff": 1}"#;
        let (_tmp, _config, pool) = setup(&[row]).await;

        let mut source = SqliteSource::new(pool, 10, None, None);
        let snapshot = source.next_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.headers.get("Content-Type").map(String::as_str), Some("text/html"));
        assert_eq!(snapshot.headers.get("X-Count").map(String::as_str), Some("3"));
        assert!(!snapshot.headers.contains_key("X-Null"));
        assert!(snapshot.metadata.has_redirects());
        assert!(snapshot.metadata.extra.contains_key("diff"));
        assert_eq!(snapshot.kind, CaptureKind::Listing);
    }

    #[tokio::test]
    async fn neighbors_by_time_then_insertion() {
        let mut before = TestRow::new("before", "http://a/", 100);
        before.status = Some(404);
        let mut same_time = TestRow::new("same-time", "http://a/", 200);
        same_time.status = Some(500);
        let mut target = TestRow::new("target", "http://a/", 200);
        target.status = None;
        let later = TestRow::new("later", "http://a/", 300);
        let other = TestRow::new("other", "http://b/", 250);
        let (_tmp, _config, pool) = setup(&[later, before, same_time, target, other]).await;

        let mut source = SqliteSource::new(pool, 10, None, None);
        let snapshots = drain(&mut source).await;
        let target = snapshots.iter().find(|s| s.id == "target").unwrap();

        let neighbors = source.neighbors(target).await.unwrap();
        let previous = neighbors.previous.unwrap();
        assert_eq!(previous.status, Some(500));
        assert_eq!(previous.body_hash.as_deref(), Some(digest::sha256_hex(b"hello").as_str()));
        assert_eq!(neighbors.next.unwrap().status, Some(200));

        let first = snapshots.iter().find(|s| s.id == "before").unwrap();
        let neighbors = source.neighbors(first).await.unwrap();
        assert!(neighbors.previous.is_none());
        assert_eq!(neighbors.next.unwrap().status, Some(500));
    }

    #[tokio::test]
    async fn open_requires_existing_database() {
        let tmp = TempDir::new().unwrap();
        let config = parse_config(&format!(
            "[source]\npath = {:?}\ndataset = \"test\"\n",
            tmp.path().join("absent.sqlite").to_string_lossy()
        ))
        .unwrap();
        assert!(SqliteSource::open(&config).await.is_err());
    }

    fn snap(id: &str, url: &str, secs: i64, status: Option<i64>, body: &[u8]) -> SourceSnapshot {
        SourceSnapshot {
            id: id.to_string(),
            url: url.to_string(),
            captured_at: Utc.timestamp_opt(secs, 0).unwrap(),
            status,
            media_type: None,
            headers: BTreeMap::new(),
            body: BodyRef::Inline(body.to_vec()),
            body_hash: None,
            title: None,
            metadata: SourceMetadata::default(),
            kind: CaptureKind::Page,
        }
    }

    #[tokio::test]
    async fn memory_source_neighbors() {
        let mut source = MemorySource::new(vec![
            snap("3", "http://a/", 300, Some(200), b"x"),
            snap("1", "http://a/", 100, Some(404), b"y"),
            snap("2", "http://a/", 200, None, b"y"),
            snap("4", "http://b/", 150, Some(500), b"y"),
        ]);
        let all = drain(&mut source).await;
        assert_eq!(all.len(), 4);

        let neighbors = source.neighbors(&all[2]).await.unwrap();
        let previous = neighbors.previous.unwrap();
        assert_eq!(previous.status, Some(404));
        assert_eq!(previous.body_hash, Some(digest::sha256_hex(b"y")));
        assert_eq!(neighbors.next.unwrap().status, Some(200));
    }
}
