use std::io::{self, Write};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::app::{CatalogResult, DeleteResult, FetchResult, ListResult, StatusResult};
use crate::coordinator::{AcquisitionListener, AcquisitionOutcome};
use crate::domain::DatasetKey;
use crate::progress::ProgressUpdate;
use crate::task::Stage;
use crate::verify::IntegrityResult;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_catalog(result: &CatalogResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_delete(result: &DeleteResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn render<T: Serialize>(value: &T) -> io::Result<String> {
        serde_json::to_string_pretty(value).map_err(io::Error::other)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = Self::render(value)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Reports acquisition events through `tracing`; used when no dashboard is
/// attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl AcquisitionListener for LogListener {
    fn on_stage(&self, key: &DatasetKey, stage: Stage) {
        info!("{key}: {stage}");
    }

    fn on_progress(&self, key: &DatasetKey, progress: &ProgressUpdate) {
        match progress.percent() {
            Some(percent) => debug!("{key}: {percent:.1}% {}", progress.label()),
            None => debug!("{key}: {}", progress.label()),
        }
    }

    fn on_integrity(&self, key: &DatasetKey, result: &IntegrityResult) {
        match result {
            IntegrityResult::Match { digest } => info!("{key}: checksum ok ({digest})"),
            IntegrityResult::Unavailable => warn!("{key}: no checksum available"),
            IntegrityResult::Mismatch { computed, expected } => {
                error!("{key}: checksum mismatch, expected {expected}, computed {computed}")
            }
        }
    }

    fn on_finished(&self, outcome: &AcquisitionOutcome) {
        match outcome {
            AcquisitionOutcome::Installed { key, verified } => {
                info!("{key}: installed (verified: {verified})")
            }
            AcquisitionOutcome::Failed { key, reason } => error!("{key}: failed: {reason}"),
            AcquisitionOutcome::Cancelled { key } => info!("{key}: cancelled"),
        }
    }
}
