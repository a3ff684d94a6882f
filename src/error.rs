use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SkyDataError {
    #[error("invalid dataset key: {0}")]
    InvalidKey(String),

    #[error("dataset not found in catalog: {0}")]
    UnknownDataset(String),

    #[error("acquisition already in progress for dataset {0}")]
    AlreadyInProgress(String),

    #[error("offline mode is active, refusing to download {0}")]
    #[diagnostic(help("disable offline_mode in skydata.json or unset SKYDATA_OFFLINE"))]
    Offline(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to parse dataset catalog: {0}")]
    ManifestParse(String),

    #[error("failed to fetch dataset catalog from {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    #[error("download request failed: {0}")]
    Http(String),

    #[error("server returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    Integrity { expected: String, computed: String },

    #[error("not enough free space: {required} bytes needed, {available} available")]
    #[diagnostic(help("free some disk space or point temp_location/data_location elsewhere"))]
    InsufficientSpace { required: u64, available: u64 },

    #[error("archive extraction failed: {0}")]
    Extraction(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("acquisition worker for {0} panicked")]
    WorkerPanicked(String),
}
