use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::SkyDataError;
use crate::progress::{HashProgress, Throttle, percent};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IntegrityResult {
    Match { digest: String },
    Mismatch { computed: String, expected: String },
    /// The catalog carries no digest; the archive proceeds unverified.
    Unavailable,
}

impl IntegrityResult {
    pub fn is_match(&self) -> bool {
        matches!(self, IntegrityResult::Match { .. })
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self, IntegrityResult::Mismatch { .. })
    }

    pub fn computed(&self) -> Option<&str> {
        match self {
            IntegrityResult::Match { digest } => Some(digest),
            IntegrityResult::Mismatch { computed, .. } => Some(computed),
            IntegrityResult::Unavailable => None,
        }
    }
}

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn verify(path: &Path, expected: Option<&str>) -> Result<IntegrityResult, SkyDataError> {
        Self::verify_with_progress(path, expected, &mut |_| {})
    }

    pub fn verify_with_progress(
        path: &Path,
        expected: Option<&str>,
        on_progress: &mut dyn FnMut(HashProgress),
    ) -> Result<IntegrityResult, SkyDataError> {
        let Some(expected) = expected.map(normalize_digest).filter(|d| !d.is_empty()) else {
            return Ok(IntegrityResult::Unavailable);
        };
        let computed = sha256_file(path, on_progress)?;
        if computed == expected {
            Ok(IntegrityResult::Match { digest: computed })
        } else {
            Ok(IntegrityResult::Mismatch { computed, expected })
        }
    }
}

/// Streams the file through SHA-256 and returns the lowercase hex digest.
pub fn sha256_file(
    path: &Path,
    on_progress: &mut dyn FnMut(HashProgress),
) -> Result<String, SkyDataError> {
    let mut file = File::open(path)
        .map_err(|err| SkyDataError::Filesystem(format!("open {}: {err}", path.display())))?;
    let total = file
        .metadata()
        .map_err(|err| SkyDataError::Filesystem(err.to_string()))?
        .len();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut hashed = 0u64;
    let mut throttle = Throttle::default();
    loop {
        let count = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(SkyDataError::Filesystem(format!(
                    "read {}: {err}",
                    path.display()
                )));
            }
        };
        hasher.update(&buffer[..count]);
        hashed += count as u64;
        if throttle.ready() {
            on_progress(hash_progress(hashed, total));
        }
    }
    on_progress(hash_progress(hashed, total));
    Ok(hex::encode(hasher.finalize()))
}

fn hash_progress(hashed: u64, total: u64) -> HashProgress {
    HashProgress {
        bytes_hashed: hashed,
        bytes_total: total,
        percent: percent(hashed, Some(total)).unwrap_or(100.0),
    }
}

fn normalize_digest(digest: &str) -> String {
    digest.trim().to_ascii_lowercase()
}
