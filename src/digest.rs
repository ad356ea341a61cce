//! Content digests.
//!
//! Record digests are SHA-256 encoded as RFC 4648 base32 and tagged with the
//! algorithm (`sha256:...`), the labelled-digest form used by WARC. Body
//! hashes stored in the source database are plain lowercase hex SHA-256.

use data_encoding::BASE32;
use sha2::{Digest, Sha256};

pub const ALGORITHM: &str = "sha256";

/// Algorithm-tagged base32 digest of `bytes`.
pub fn labelled(bytes: &[u8]) -> String {
    format!("{}:{}", ALGORITHM, BASE32.encode(&Sha256::digest(bytes)))
}

/// Lowercase hex SHA-256 of `bytes`, as stored in `body_hash` columns.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Incremental form of [`labelled`] for blocks assembled from several parts.
pub struct BlockHasher(Sha256);

impl BlockHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> String {
        format!("{}:{}", ALGORITHM, BASE32.encode(&self.0.finalize()))
    }
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new()
    }
}
