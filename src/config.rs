use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::fileset::FileSetOptions;
use crate::identity::{self, RecordIdentity};
use crate::status::InferenceRule;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub bodies: BodiesConfig,
    #[serde(default)]
    pub warcinfo: WarcinfoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub dataset: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_compress")]
    pub compress: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            prefix: None,
            max_file_size: default_max_file_size(),
            compress: default_compress(),
        }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from("./warcs")
}
fn default_max_file_size() -> u64 {
    (7.95 * GIB) as u64
}
fn default_compress() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            limit: None,
            since: None,
            until: None,
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "InferenceRule::default_order")]
    pub rules: Vec<InferenceRule>,
    #[serde(default = "default_near_empty_bytes")]
    pub near_empty_bytes: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            rules: InferenceRule::default_order(),
            near_empty_bytes: default_near_empty_bytes(),
        }
    }
}

fn default_near_empty_bytes() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct BodiesConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BodiesConfig {
    fn default() -> Self {
        Self {
            root: None,
            retries: default_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

/// Fields written into every file's `warcinfo` record.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct WarcinfoConfig {
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl WarcinfoConfig {
    pub fn fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        if let Some(operator) = &self.operator {
            fields.push(("operator".to_string(), operator.clone()));
        }
        if let Some(description) = &self.description {
            fields.push(("description".to_string(), description.clone()));
        }
        for (key, value) in &self.extra {
            fields.push((key.clone(), value.clone()));
        }
        fields
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// File-name prefix, defaulting to the dataset name.
    pub fn file_prefix(&self) -> &str {
        self.output
            .prefix
            .as_deref()
            .unwrap_or(&self.source.dataset)
    }

    /// Capture-time window from `run.since` / `run.until`, as unix seconds.
    pub fn time_range(&self) -> Result<(Option<i64>, Option<i64>)> {
        let since = self
            .run
            .since
            .as_deref()
            .map(|s| parse_bound(s, false))
            .transpose()
            .context("run.since")?;
        let until = self
            .run
            .until
            .as_deref()
            .map(|s| parse_bound(s, true))
            .transpose()
            .context("run.until")?;
        Ok((since.map(|t| t.timestamp()), until.map(|t| t.timestamp())))
    }

    pub fn file_set_options(&self) -> FileSetOptions {
        FileSetOptions {
            directory: self.output.directory.clone(),
            prefix: self.file_prefix().to_string(),
            max_file_size: self.output.max_file_size,
            compress: self.output.compress,
            warcinfo: self.warcinfo.fields(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        identity::validate_dataset(&self.source.dataset)
            .context("source.dataset is invalid")?;

        if self.source.page_size == 0 {
            bail!("source.page_size must be > 0");
        }

        if self.output.max_file_size == 0 {
            bail!("output.max_file_size must be > 0");
        }

        if let Some(prefix) = &self.output.prefix {
            if prefix.is_empty() || prefix.contains(['/', '\\']) {
                bail!("output.prefix must be a non-empty file name fragment");
            }
        }

        let identity = RecordIdentity::new(&self.source.dataset)?;
        let warcinfo_len = self.file_set_options().warcinfo_len(&identity);
        if self.output.max_file_size < warcinfo_len {
            bail!(
                "output.max_file_size must be at least {} bytes to hold the warcinfo record",
                warcinfo_len
            );
        }

        if self.run.workers == 0 {
            bail!("run.workers must be > 0");
        }

        let (since, until) = self.time_range()?;
        if let (Some(since), Some(until)) = (since, until) {
            if since > until {
                bail!("run.since must not be later than run.until");
            }
        }

        let mut seen = HashSet::new();
        for rule in &self.inference.rules {
            if !seen.insert(rule) {
                bail!("inference.rules lists {:?} more than once", rule);
            }
        }

        Ok(())
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub limit: Option<usize>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub output: Option<PathBuf>,
    /// Size bound in GiB.
    pub size_gb: Option<f64>,
    pub uncompressed: bool,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(limit) = self.limit {
            config.run.limit = Some(limit);
        }
        if let Some(since) = &self.since {
            config.run.since = Some(since.clone());
        }
        if let Some(until) = &self.until {
            config.run.until = Some(until.clone());
        }
        if let Some(output) = &self.output {
            config.output.directory = output.clone();
        }
        if let Some(size) = self.size_gb {
            if !(size.is_finite() && size > 0.0) {
                bail!("--size must be a positive number of GB");
            }
            config.output.max_file_size = ((size * GIB) as u64).max(1);
        }
        if self.uncompressed {
            config.output.compress = false;
        }
        config.validate()
    }
}

/// Parse a `YYYY-MM-DD` or RFC 3339 timestamp. Bare dates cover the whole
/// day: the start of it for a lower bound, the last second for an upper one.
pub fn parse_bound(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        return time
            .map(|t| t.and_utc())
            .with_context(|| format!("invalid date: {}", value));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("expected YYYY-MM-DD or RFC 3339, got '{}'", value))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
