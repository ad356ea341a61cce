//! Conversion pipeline orchestration.
//!
//! Coordinates the full flow: source rows → body retrieval → status
//! inference → redirect expansion → record building → file placement.
//!
//! Bodies for up to `workers` snapshots are fetched concurrently; everything
//! after that runs strictly in source order, so output files preserve the
//! database order and [`ArchiveFileSet`] has a single writer. Each snapshot
//! is either fully built and placed or not attempted.
//!
//! Failures scoped to one snapshot (missing, unfetchable, or mismatched
//! bodies) are logged with the source ID and counted; the run continues.
//! Source read failures and file I/O failures abort the run after the open
//! file has been closed.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::body::{BodyLoader, DefaultBodyLoader};
use crate::config::Config;
use crate::error::{self, ConvertError, SkipReason};
use crate::fileset::{ArchiveFileSet, ClosedFile};
use crate::identity::RecordIdentity;
use crate::models::{CaptureKind, ContainerRecord, Neighbors, Provenance, SourceSnapshot};
use crate::progress::{format_number, ConvertProgressEvent, ConvertProgressReporter, NoProgress, ProgressMode};
use crate::record::RecordBuilder;
use crate::redirect::RedirectChainExpander;
use crate::source::{SnapshotSource, SqliteSource};
use crate::status::StatusInferenceEngine;

/// Counts and outputs of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub rows_read: u64,
    pub archived: u64,
    pub listings: u64,
    pub records_written: u64,
    pub provenance: BTreeMap<Provenance, u64>,
    pub inconsistent_chains: u64,
    pub skipped: BTreeMap<SkipReason, u64>,
    /// Source IDs of skipped snapshots, for reprocessing.
    pub skipped_ids: Vec<String>,
    pub files: Vec<ClosedFile>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn print(&self) {
        println!("convert");
        println!("  rows read: {}", format_number(self.rows_read));
        println!("  snapshots archived: {}", format_number(self.archived));
        println!("  listings: {}", format_number(self.listings));
        println!("  records written: {}", format_number(self.records_written));
        println!("  files: {}", self.files.len());
        for file in &self.files {
            println!(
                "    {}  {} bytes  {} records",
                file.path.display(),
                format_number(file.bytes),
                format_number(file.records as u64)
            );
        }
        if !self.provenance.is_empty() {
            println!("  status provenance:");
            for (provenance, count) in &self.provenance {
                println!("    {:<24} {}", provenance.as_str(), format_number(*count));
            }
        }
        println!("  inconsistent chains: {}", format_number(self.inconsistent_chains));
        let skipped: u64 = self.skipped.values().sum();
        println!("  skipped: {}", format_number(skipped));
        for (reason, count) in &self.skipped {
            println!("    {:<24} {}", reason.as_str(), format_number(*count));
        }
        if self.interrupted {
            println!("interrupted");
        } else {
            println!("ok");
        }
    }

    fn skip(&mut self, source_id: &str, reason: SkipReason) {
        *self.skipped.entry(reason).or_default() += 1;
        self.skipped_ids.push(source_id.to_string());
    }
}

pub struct Pipeline {
    engine: StatusInferenceEngine,
    expander: RedirectChainExpander,
    builder: RecordBuilder,
    loader: Box<dyn BodyLoader>,
    workers: usize,
    limit: Option<usize>,
    stop: Arc<AtomicBool>,
    progress: Box<dyn ConvertProgressReporter>,
}

impl Pipeline {
    pub fn new(
        identity: RecordIdentity,
        engine: StatusInferenceEngine,
        loader: Box<dyn BodyLoader>,
    ) -> Self {
        Self {
            engine,
            expander: RedirectChainExpander::new(identity.clone()),
            builder: RecordBuilder::new(identity),
            loader,
            workers: 1,
            limit: None,
            stop: Arc::new(AtomicBool::new(false)),
            progress: Box::new(NoProgress),
        }
    }

    pub fn from_config(config: &Config, loader: Box<dyn BodyLoader>) -> Result<Self> {
        let identity = RecordIdentity::new(&config.source.dataset)?;
        let engine = StatusInferenceEngine::new(
            config.inference.rules.clone(),
            config.inference.near_empty_bytes,
        );
        Ok(Self::new(identity, engine, loader)
            .with_workers(config.run.workers)
            .with_limit(config.run.limit))
    }

    /// Number of bodies fetched concurrently ahead of processing.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Stop after this many source rows.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Checked between snapshots; when set the run ends early.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ConvertProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Convert every snapshot `source` yields into `files`.
    ///
    /// On a fatal error the open file is closed before the error is
    /// returned, so every file left on disk is complete.
    pub async fn run(
        &self,
        source: &mut dyn SnapshotSource,
        files: &mut ArchiveFileSet,
    ) -> error::Result<RunSummary> {
        let mut summary = RunSummary::default();
        match self.convert(source, files, &mut summary).await {
            Ok(()) => {
                files.finish()?;
                self.report_closed(files, &mut summary);
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "conversion aborted");
                if let Err(close_err) = files.finish() {
                    error!(error = %close_err, "failed to close archive file after abort");
                }
                Err(e)
            }
        }
    }

    async fn convert(
        &self,
        source: &mut dyn SnapshotSource,
        files: &mut ArchiveFileSet,
        summary: &mut RunSummary,
    ) -> error::Result<()> {
        let mut exhausted = false;

        while !exhausted {
            let mut batch = Vec::with_capacity(self.workers);
            let mut read_error = None;
            while batch.len() < self.workers && !self.limit_reached(summary) {
                match source.next_snapshot().await {
                    Ok(Some(snapshot)) => {
                        summary.rows_read += 1;
                        batch.push(snapshot);
                    }
                    Ok(None) => {
                        exhausted = true;
                        break;
                    }
                    Err(e) => {
                        // Rows already read are still archived before aborting.
                        read_error = Some(e);
                        exhausted = true;
                        break;
                    }
                }
            }

            let bodies = join_all(batch.iter().map(|s| self.loader.load(s))).await;

            let mut pending = batch.into_iter().zip(bodies);
            while let Some((snapshot, body)) = pending.next() {
                if self.stop.load(Ordering::SeqCst) {
                    warn!("stop requested, finishing open archive file");
                    summary.interrupted = true;
                    for id in std::iter::once(snapshot.id).chain(pending.map(|(s, _)| s.id)) {
                        warn!(source_id = %id, "snapshot read but not archived before stop");
                    }
                    return read_error.map_or(Ok(()), Err);
                }

                let source_id = snapshot.id.clone();
                let outcome = match body {
                    Ok(body) => self.process(snapshot, body, source, files, summary).await,
                    Err(ConvertError::Payload {
                        source_id,
                        reason,
                        detail,
                    }) => {
                        error!(source_id = %source_id, reason = %reason, detail = %detail, "skipping snapshot");
                        summary.skip(&source_id, reason);
                        Ok(())
                    }
                    Err(fatal) => Err(fatal),
                };
                if let Err(e) = outcome {
                    error!(source_id = %source_id, error = %e, "snapshot not archived");
                    for (rest, _) in pending {
                        error!(source_id = %rest.id, "snapshot read but not archived before abort");
                    }
                    return Err(e);
                }
                self.report_closed(files, summary);
            }

            if let Some(e) = read_error {
                return Err(e);
            }

            self.progress.report(ConvertProgressEvent::Converting {
                rows: summary.rows_read,
                records: summary.records_written,
                files: (files.files().len() + usize::from(files.is_open())) as u64,
            });

            if self.limit_reached(summary) {
                info!(limit = ?self.limit, "row limit reached");
                break;
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        snapshot: SourceSnapshot,
        body: Vec<u8>,
        source: &mut dyn SnapshotSource,
        files: &mut ArchiveFileSet,
        summary: &mut RunSummary,
    ) -> error::Result<()> {
        let records = match snapshot.kind {
            CaptureKind::Listing => {
                summary.listings += 1;
                let descriptor = self.expander.listing(&snapshot, body);
                self.builder.build(&descriptor).into_vec()
            }
            CaptureKind::Page => self.page_records(snapshot, body, source, summary).await?,
        };

        for record in &records {
            files.place(record)?;
            summary.records_written += 1;
        }
        summary.archived += 1;
        Ok(())
    }

    async fn page_records(
        &self,
        snapshot: SourceSnapshot,
        body: Vec<u8>,
        source: &mut dyn SnapshotSource,
        summary: &mut RunSummary,
    ) -> error::Result<Vec<ContainerRecord>> {
        let neighbors = if self.engine.requires_neighbors(&snapshot, &body) {
            source.neighbors(&snapshot).await?
        } else {
            Neighbors::default()
        };

        let status = self.engine.infer(&snapshot, &body, &neighbors);
        *summary.provenance.entry(status.provenance).or_default() += 1;
        if status.provenance != Provenance::Explicit {
            info!(
                source_id = %snapshot.id,
                url = %snapshot.url,
                code = status.code,
                provenance = %status.provenance,
                "inferred status"
            );
        }

        let chain = self.expander.expand(&snapshot, status, body);
        if !chain.is_consistent() {
            summary.inconsistent_chains += 1;
            for issue in &chain.issues {
                warn!(source_id = %snapshot.id, issue = %issue, "inconsistent redirect chain");
            }
        }

        Ok(chain
            .hops
            .iter()
            .flat_map(|hop| self.builder.build(hop).into_vec())
            .collect())
    }

    fn limit_reached(&self, summary: &RunSummary) -> bool {
        self.limit
            .is_some_and(|limit| summary.rows_read >= limit as u64)
    }

    fn report_closed(&self, files: &ArchiveFileSet, summary: &mut RunSummary) {
        for file in &files.files()[summary.files.len()..] {
            self.progress.report(ConvertProgressEvent::FileClosed {
                path: file.path.display().to_string(),
                bytes: file.bytes,
                records: file.records as u64,
            });
            summary.files.push(file.clone());
        }
    }
}

/// `snapwarc convert`: read the configured database and write archive files.
pub async fn run_convert(config: &Config, progress: ProgressMode, stop: Arc<AtomicBool>) -> Result<()> {
    let identity = RecordIdentity::new(&config.source.dataset)?;
    let loader = DefaultBodyLoader::new(&config.bodies)?;
    let pipeline = Pipeline::from_config(config, Box::new(loader))?
        .with_progress(progress.reporter())
        .with_stop_flag(stop);

    let mut source = SqliteSource::open(config)
        .await
        .with_context(|| format!("Failed to open snapshots at {}", config.source.path.display()))?;
    let mut files = ArchiveFileSet::new(config.file_set_options(), identity);

    info!(
        dataset = %config.source.dataset,
        output = %config.output.directory.display(),
        max_file_size = config.output.max_file_size,
        compress = config.output.compress,
        "starting conversion"
    );
    let result = pipeline.run(&mut source, &mut files).await;
    source.close().await;

    let summary = result.context("Conversion aborted")?;
    summary.print();
    Ok(())
}
