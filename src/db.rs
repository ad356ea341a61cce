use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// How the snapshot database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `snapwarc init`: create the file and its parent directory if needed.
    Create,
    /// Conversion: a missing database is an error, not an empty run.
    Existing,
}

pub async fn connect(db_path: &Path, mode: OpenMode) -> Result<SqlitePool> {
    let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?;

    match mode {
        OpenMode::Create => {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            options = options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
        }
        OpenMode::Existing => {
            if !db_path.exists() {
                bail!("Snapshot database not found: {}", db_path.display());
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
