use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::domain::DatasetKey;
use crate::progress::percent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Downloading,
    Verifying,
    Extracting,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Downloading => "downloading",
            Stage::Verifying => "verifying",
            Stage::Extracting => "extracting",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Cooperative cancellation flag shared between a task and its requester.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One in-flight acquisition, owned by the coordinator's registry.
#[derive(Debug)]
pub struct AcquisitionTask {
    key: DatasetKey,
    staging_path: PathBuf,
    stage: Stage,
    bytes_done: u64,
    bytes_total: Option<u64>,
    cancel: CancelToken,
}

impl AcquisitionTask {
    pub fn new(key: DatasetKey, staging_path: PathBuf) -> Self {
        Self {
            key,
            staging_path,
            stage: Stage::Downloading,
            bytes_done: 0,
            bytes_total: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn key(&self) -> &DatasetKey {
        &self.key
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.bytes_done = 0;
        self.bytes_total = None;
    }

    pub(crate) fn set_progress(&mut self, done: u64, total: Option<u64>) {
        self.bytes_done = done;
        self.bytes_total = total;
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            key: self.key.clone(),
            staging_path: self.staging_path.display().to_string(),
            stage: self.stage,
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            percent: percent(self.bytes_done, self.bytes_total),
            cancel_requested: self.cancel.is_cancelled(),
        }
    }
}

/// Read-only view of a task handed out to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub key: DatasetKey,
    pub staging_path: String,
    pub stage: Stage,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub percent: Option<f64>,
    pub cancel_requested: bool,
}
