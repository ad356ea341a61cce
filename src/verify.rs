//! Standalone validation of finished archive files.
//!
//! Each file is checked on its own: framing and `Content-Length`, the
//! trailing separator, the fields every record must carry, block and payload
//! digests, unique record IDs, and a leading `warcinfo` record. Gzip input is
//! detected from the magic bytes and may hold any number of members.

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::digest;
use crate::models::RecordType;
use crate::warc::{parse_records, ParsedRecord, WARC_VERSION};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const REQUIRED_FIELDS: &[&str] = &[
    "WARC-Type",
    "WARC-Record-ID",
    "WARC-Date",
    "Content-Length",
    "Content-Type",
    "WARC-Block-Digest",
];

#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub path: PathBuf,
    pub records: usize,
    pub by_type: BTreeMap<String, usize>,
    pub problems: Vec<String>,
}

impl FileReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Read and decode a file, decompressing gzip members when present.
pub fn read_archive(path: &Path) -> Result<Vec<u8>> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        MultiGzDecoder::new(&raw[..])
            .read_to_end(&mut out)
            .with_context(|| format!("Failed to decompress {}", path.display()))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

pub fn verify_file(path: &Path) -> Result<FileReport> {
    let data = read_archive(path)?;
    let mut report = FileReport {
        path: path.to_path_buf(),
        ..Default::default()
    };

    let records = match parse_records(&data) {
        Ok(records) => records,
        Err(e) => {
            report.problems.push(format!("{:#}", e));
            return Ok(report);
        }
    };

    report.records = records.len();
    match records.first() {
        None => report.problems.push("file holds no records".to_string()),
        Some(first) if first.record_type() != Some(RecordType::Warcinfo.as_str()) => {
            report.problems.push(format!(
                "first record is {:?}, expected warcinfo",
                first.record_type().unwrap_or("untyped")
            ))
        }
        Some(_) => {}
    }

    let mut seen = HashSet::new();
    for (index, record) in records.iter().enumerate() {
        let record_type = record.record_type().unwrap_or("untyped");
        *report.by_type.entry(record_type.to_string()).or_default() += 1;

        if let Some(id) = record.record_id() {
            if !seen.insert(id.to_string()) {
                report.problems.push(format!("record {}: duplicate record ID {}", index, id));
            }
        }
        for problem in check_record(record) {
            report.problems.push(format!("record {} ({}): {}", index, record_type, problem));
        }
    }

    Ok(report)
}

fn check_record(record: &ParsedRecord) -> Vec<String> {
    let mut problems = Vec::new();

    if record.version != WARC_VERSION {
        problems.push(format!("unexpected version {}", record.version));
    }
    for name in REQUIRED_FIELDS {
        if record.fields.get(name).is_none() {
            problems.push(format!("missing {}", name));
        }
    }

    match record.record_type().and_then(RecordType::parse) {
        Some(RecordType::Response) | Some(RecordType::Resource) => {
            if record.fields.get("WARC-Target-URI").is_none() {
                problems.push("missing WARC-Target-URI".to_string());
            }
        }
        Some(RecordType::Metadata) => {
            if record.fields.get("WARC-Refers-To").is_none() {
                problems.push("missing WARC-Refers-To".to_string());
            }
        }
        Some(RecordType::Warcinfo) => {}
        None => problems.push("unknown WARC-Type".to_string()),
    }

    if let Some(expected) = record.fields.get("WARC-Block-Digest") {
        let actual = digest::labelled(&record.block);
        if actual != expected {
            problems.push(format!("block digest {} does not match {}", expected, actual));
        }
    }

    if let Some(expected) = record.fields.get("WARC-Payload-Digest") {
        let payload = match record.record_type() {
            Some("response") => http_entity(&record.block),
            _ => Some(record.block.as_slice()),
        };
        match payload.map(digest::labelled) {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                problems.push(format!("payload digest {} does not match {}", expected, actual))
            }
            None => problems.push("response block has no HTTP header terminator".to_string()),
        }
    }

    problems
}

/// Entity body of an `application/http` block.
fn http_entity(block: &[u8]) -> Option<&[u8]> {
    block
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| &block[at + 4..])
}

/// `snapwarc verify`: check each file and print a line per file.
pub fn run_verify(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        bail!("No files given to verify");
    }

    let mut invalid = 0;
    for path in paths {
        let report = verify_file(path)?;
        let types: Vec<String> = report
            .by_type
            .iter()
            .map(|(t, n)| format!("{} {}", n, t))
            .collect();
        if report.is_valid() {
            println!("{}: {} records ({}) ok", path.display(), report.records, types.join(", "));
        } else {
            invalid += 1;
            println!("{}: INVALID", path.display());
            for problem in &report.problems {
                println!("  {}", problem);
            }
        }
    }

    if invalid > 0 {
        bail!("{} of {} files failed verification", invalid, paths.len());
    }
    println!("ok");
    Ok(())
}
