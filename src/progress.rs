//! Conversion progress reporting.
//!
//! Reports observable progress during `snapwarc convert` so users can see how
//! many rows have been read and which archive files have been finished.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a conversion run.
#[derive(Clone, Debug)]
pub enum ConvertProgressEvent {
    /// `rows` source rows handled so far; `records` written across `files` files.
    Converting { rows: u64, records: u64, files: u64 },
    /// An archive file was closed and renamed to its final name.
    FileClosed {
        path: String,
        bytes: u64,
        records: u64,
    },
}

/// Reports conversion progress. Implementations write to stderr (human or JSON).
pub trait ConvertProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the pipeline between batches.
    fn report(&self, event: ConvertProgressEvent);
}

/// Human-friendly progress on stderr: "convert  1,234 rows  5,000 records  2 files".
pub struct StderrProgress;

impl ConvertProgressReporter for StderrProgress {
    fn report(&self, event: ConvertProgressEvent) {
        let line = match &event {
            ConvertProgressEvent::Converting {
                rows,
                records,
                files,
            } => format!(
                "convert  {} rows  {} records  {} files\n",
                format_number(*rows),
                format_number(*records),
                format_number(*files)
            ),
            ConvertProgressEvent::FileClosed {
                path,
                bytes,
                records,
            } => format!(
                "convert  closed {}  {} bytes  {} records\n",
                path,
                format_number(*bytes),
                format_number(*records)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ConvertProgressReporter for JsonProgress {
    fn report(&self, event: ConvertProgressEvent) {
        let obj = match &event {
            ConvertProgressEvent::Converting {
                rows,
                records,
                files,
            } => serde_json::json!({
                "event": "progress",
                "phase": "converting",
                "rows": rows,
                "records": records,
                "files": files
            }),
            ConvertProgressEvent::FileClosed {
                path,
                bytes,
                records,
            } => serde_json::json!({
                "event": "file_closed",
                "path": path,
                "bytes": bytes,
                "records": records
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ConvertProgressReporter for NoProgress {
    fn report(&self, _event: ConvertProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller passes it to the pipeline.
    pub fn reporter(&self) -> Box<dyn ConvertProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
