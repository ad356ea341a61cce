//! Size-bounded series of archive files.
//!
//! [`ArchiveFileSet`] owns the single open output file. Records are placed
//! whole: before each write, if the open file already holds at least one
//! record and the incoming record would push it past `max_file_size`, the
//! file is closed and a new one started. A record larger than the bound
//! therefore lands alone in its own oversized file instead of being split or
//! rejected.
//!
//! Every file begins with a `warcinfo` record and is written under a
//! `.open` name, then renamed to its final name once flushed and synced, so
//! any final-named file is complete and readable on its own. A file whose
//! write failed partway keeps its `.open` name. With compression each
//! record is a separate gzip member and sizes are counted in compressed
//! bytes.
//!
//! The bound must leave room for the `warcinfo` record;
//! [`FileSetOptions::warcinfo_len`] gives the largest one a set can write.

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::error::{ConvertError, Result};
use crate::identity::RecordIdentity;
use crate::models::ContainerRecord;
use crate::record;

const PARTIAL_SUFFIX: &str = ".open";

#[derive(Debug, Clone)]
pub struct FileSetOptions {
    pub directory: PathBuf,
    pub prefix: String,
    pub max_file_size: u64,
    pub compress: bool,
    /// Extra fields for each file's `warcinfo` record.
    pub warcinfo: Vec<(String, String)>,
}

impl FileSetOptions {
    pub fn extension(&self) -> &'static str {
        if self.compress {
            ".warc.gz"
        } else {
            ".warc"
        }
    }

    /// Uncompressed length of the longest `warcinfo` record a file in this
    /// set can open with.
    pub fn warcinfo_len(&self, identity: &RecordIdentity) -> u64 {
        let name = format!("{}-99991231T235959-99999{}", self.prefix, self.extension());
        record::warcinfo(identity, &name, DateTime::<Utc>::default(), &self.warcinfo).byte_len()
            as u64
    }
}

/// A finished archive file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub path: PathBuf,
    pub bytes: u64,
    /// Records placed, not counting the leading `warcinfo`.
    pub records: usize,
}

/// Where an archive file's bytes go. Files in production; tests swap in
/// writers that fail on demand.
trait Sink: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
}

impl Sink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

fn file_sink(file: File) -> Box<dyn Sink> {
    Box::new(file)
}

struct ArchiveFile {
    path: PathBuf,
    partial_path: PathBuf,
    writer: BufWriter<Box<dyn Sink>>,
    bytes_written: u64,
    records: usize,
    /// Set once a write fails; the file may end inside a record.
    poisoned: bool,
}

impl ArchiveFile {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(e) = self.writer.write_all(bytes) {
            self.poisoned = true;
            return Err(ConvertError::rotation_io(&self.partial_path, e));
        }
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush, sync, and rename to the final name. A poisoned file keeps its
    /// `.open` name.
    fn close(mut self) -> Result<ClosedFile> {
        if self.poisoned {
            return Err(self.abandon());
        }
        let flushed = self.writer.flush().and_then(|_| self.writer.get_mut().sync());
        if let Err(e) = flushed {
            error!(path = %self.partial_path.display(), error = %e, "flush failed");
            return Err(self.abandon());
        }
        drop(self.writer);
        fs::rename(&self.partial_path, &self.path)
            .map_err(|e| ConvertError::rotation_io(&self.path, e))?;
        Ok(ClosedFile {
            path: self.path,
            bytes: self.bytes_written,
            records: self.records,
        })
    }

    fn abandon(self) -> ConvertError {
        let (sink, _) = self.writer.into_parts();
        drop(sink);
        error!(
            path = %self.partial_path.display(),
            records = self.records,
            "archive file left incomplete after failed write"
        );
        ConvertError::rotation_io(
            &self.partial_path,
            io::Error::other("incomplete after a failed write; not renamed"),
        )
    }
}

pub struct ArchiveFileSet {
    options: FileSetOptions,
    identity: RecordIdentity,
    current: Option<ArchiveFile>,
    closed: Vec<ClosedFile>,
    used_names: HashSet<String>,
    sink: fn(File) -> Box<dyn Sink>,
}

impl ArchiveFileSet {
    pub fn new(options: FileSetOptions, identity: RecordIdentity) -> Self {
        Self {
            options,
            identity,
            current: None,
            closed: Vec::new(),
            used_names: HashSet::new(),
            sink: file_sink,
        }
    }

    /// Write one record, rotating first if it would overflow the open file.
    pub fn place(&mut self, record: &ContainerRecord) -> Result<()> {
        if self.current.as_ref().is_some_and(|f| f.poisoned) {
            self.close_current()?;
        }
        let encoded = self
            .encode(record.as_bytes())
            .map_err(|e| ConvertError::rotation_io(&self.options.directory, e))?;
        let size = encoded.len() as u64;

        if let Some(open) = &self.current {
            if open.records > 0 && open.bytes_written + size > self.options.max_file_size {
                info!(
                    path = %open.path.display(),
                    bytes = open.bytes_written,
                    records = open.records,
                    incoming = size,
                    "size bound reached, rotating archive file"
                );
                self.close_current()?;
            }
        }

        let file = match self.current.take() {
            Some(file) => file,
            None => self.open(record.date())?,
        };
        let file = self.current.insert(file);
        file.write(&encoded)?;
        file.records += 1;
        Ok(())
    }

    /// Close whatever file is open. Safe to call more than once.
    pub fn finish(&mut self) -> Result<()> {
        self.close_current()
    }

    /// Files closed so far, in creation order.
    pub fn files(&self) -> &[ClosedFile] {
        &self.closed
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    fn close_current(&mut self) -> Result<()> {
        let Some(file) = self.current.take() else {
            return Ok(());
        };
        let closed = file.close()?;
        info!(
            path = %closed.path.display(),
            bytes = closed.bytes,
            records = closed.records,
            "closed archive file"
        );
        self.closed.push(closed);
        Ok(())
    }

    fn open(&mut self, date: DateTime<Utc>) -> Result<ArchiveFile> {
        let dir = &self.options.directory;
        fs::create_dir_all(dir).map_err(|e| ConvertError::rotation_io(dir, e))?;

        let base = format!("{}-{}", self.options.prefix, date.format("%Y%m%dT%H%M%S"));
        let ext = self.options.extension();
        let mut attempt = 1u32;
        let (name, path, partial_path, handle) = loop {
            let stem = if attempt == 1 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            attempt += 1;

            let name = format!("{}{}", stem, ext);
            let path = dir.join(&name);
            let partial_path = partial(&path);
            if self.used_names.contains(&name) || path.exists() {
                continue;
            }
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&partial_path)
            {
                Ok(handle) => break (name, path, partial_path, handle),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ConvertError::rotation_io(&partial_path, e)),
            }
        };
        self.used_names.insert(name.clone());
        info!(path = %path.display(), "creating archive file");

        let mut file = ArchiveFile {
            path,
            partial_path,
            writer: BufWriter::new((self.sink)(handle)),
            bytes_written: 0,
            records: 0,
            poisoned: false,
        };
        let info = record::warcinfo(&self.identity, &name, date, &self.options.warcinfo);
        let encoded = self
            .encode(info.as_bytes())
            .map_err(|e| ConvertError::rotation_io(&file.partial_path, e))?;
        file.write(&encoded)?;
        Ok(file)
    }

    fn encode(&self, bytes: &[u8]) -> io::Result<Vec<u8>> {
        if !self.options.compress {
            return Ok(bytes.to_vec());
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()
    }
}

impl Drop for ArchiveFileSet {
    fn drop(&mut self) {
        if let Err(e) = self.close_current() {
            error!(error = %e, "failed to close archive file on shutdown");
        }
    }
}

fn partial(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
