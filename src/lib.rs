//! # Snapshot WARC
//!
//! Converts web snapshots stored in a database into WARC 1.1 archive files.
//!
//! Each snapshot row (URL, capture time, possibly-missing status, headers,
//! body reference, redirect metadata) becomes one or more container
//! records: a `response` per redirect hop, a `resource` for directory
//! listings, and a paired `metadata` record for context that standard
//! headers cannot carry. Records are written to a series of size-bounded
//! files, each valid on its own.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │  Source   │──▶│  Status  │──▶│ Redirect  │──▶│  Record  │──▶│ Archive  │
//! │ SQLite/Mem│   │ Inference│   │ Expansion │   │ Builder  │   │ File Set │
//! └───────────┘   └──────────┘   └───────────┘   └──────────┘   └──────────┘
//!       ▲              body loading (bounded prefetch)
//!       └── neighbors
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! snapwarc init                  # create the snapshots table
//! snapwarc convert --limit 100   # write the first 100 rows
//! snapwarc verify warcs/*.warc.gz
//! snapwarc archive-log logs/convert.log
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and CLI overrides |
//! | [`models`] | Core data types |
//! | [`error`] | Per-record and fatal error kinds |
//! | [`source`] | Ordered snapshot stream (SQLite, in-memory) |
//! | [`body`] | Body retrieval and hash checks |
//! | [`status`] | Effective status inference |
//! | [`identity`] | Deterministic record URNs |
//! | [`redirect`] | Redirect chain expansion |
//! | [`record`] | Container record assembly |
//! | [`warc`] | WARC framing and parsing |
//! | [`digest`] | Content digests |
//! | [`fileset`] | Size-bounded output files |
//! | [`pipeline`] | Orchestration and run summary |
//! | [`verify`] | Standalone file validation |
//! | [`log_archive`] | Run log packed as an archive file |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod body;
pub mod config;
pub mod db;
pub mod digest;
pub mod error;
pub mod fileset;
pub mod identity;
pub mod log_archive;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod redirect;
pub mod source;
pub mod status;
pub mod verify;
pub mod warc;
