#![allow(dead_code)]

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use skydata_manager::config::Settings;
use skydata_manager::coordinator::{AcquisitionListener, AcquisitionOutcome};
use skydata_manager::domain::DatasetKey;
use skydata_manager::error::SkyDataError;
use skydata_manager::progress::{ProgressUpdate, TransferProgress};
use skydata_manager::task::{CancelToken, Stage};
use skydata_manager::transfer::{TransferClient, TransferOutcome, TransferRequest, stream_to_writer};
use skydata_manager::verify::IntegrityResult;

pub fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Archive whose single entry is named verbatim, bypassing the builder's
/// path validation.
pub fn tar_gz_raw_name(name: &str, data: &[u8]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_old();
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, data).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn settings(root: &Path) -> Settings {
    Settings::with_data_root(Utf8PathBuf::from_path_buf(root.join("data")).unwrap())
}

pub fn key(value: &str) -> DatasetKey {
    value.parse().unwrap()
}

/// Serves a fixed payload in chunks, sleeping between reads.
pub struct SlowReader<'a> {
    data: &'a [u8],
    position: usize,
    chunk: usize,
    delay: Duration,
}

impl<'a> SlowReader<'a> {
    pub fn new(data: &'a [u8], chunk: usize, delay: Duration) -> Self {
        Self {
            data,
            position: 0,
            chunk,
            delay,
        }
    }
}

impl Read for SlowReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.data.len() {
            return Ok(0);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let end = (self.position + self.chunk.min(buf.len())).min(self.data.len());
        let count = end - self.position;
        buf[..count].copy_from_slice(&self.data[self.position..end]);
        self.position = end;
        Ok(count)
    }
}

/// Transfer client that writes an in-memory payload to the staging file.
pub struct PayloadTransfer {
    payload: Vec<u8>,
    chunk: usize,
    delay: Duration,
    gate: Option<Barrier>,
    cancel_when_done: bool,
    calls: AtomicUsize,
}

impl PayloadTransfer {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            chunk: 16 * 1024,
            delay: Duration::ZERO,
            gate: None,
            cancel_when_done: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(payload: Vec<u8>, chunk: usize, delay: Duration) -> Self {
        Self {
            chunk,
            delay,
            ..Self::new(payload)
        }
    }

    /// Each fetch blocks until the test thread also waits on the barrier.
    pub fn gated(payload: Vec<u8>) -> Self {
        Self {
            gate: Some(Barrier::new(2)),
            ..Self::new(payload)
        }
    }

    /// Completes the transfer, then flips the task's cancel token.
    pub fn cancelling(payload: Vec<u8>) -> Self {
        Self {
            cancel_when_done: true,
            ..Self::new(payload)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransferClient for PayloadTransfer {
    fn fetch(
        &self,
        request: &TransferRequest,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferOutcome, SkyDataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        let mut file = File::create(&request.destination)
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        let mut reader = SlowReader::new(&self.payload, self.chunk, self.delay);
        let outcome = stream_to_writer(
            &mut reader,
            &mut file,
            0,
            Some(self.payload.len() as u64),
            cancel,
            on_progress,
        )
        .map_err(|err| SkyDataError::Http(format!("{err:?}")))?;
        if self.cancel_when_done {
            cancel.cancel();
        }
        Ok(outcome)
    }
}

/// Writes a few bytes, then fails the way a server error would.
#[derive(Default)]
pub struct FailingTransfer {
    calls: AtomicUsize,
}

impl FailingTransfer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransferClient for FailingTransfer {
    fn fetch(
        &self,
        request: &TransferRequest,
        _cancel: &CancelToken,
        _on_progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferOutcome, SkyDataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(&request.destination, b"partial")
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        Err(SkyDataError::HttpStatus {
            status: 503,
            url: request.url.clone(),
        })
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub stages: Mutex<Vec<Stage>>,
    pub progress: Mutex<Vec<ProgressUpdate>>,
    pub integrity: Mutex<Vec<IntegrityResult>>,
    pub outcomes: Mutex<Vec<AcquisitionOutcome>>,
    pub finished_on: Mutex<Option<thread::ThreadId>>,
}

impl RecordingListener {
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<AcquisitionOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl AcquisitionListener for RecordingListener {
    fn on_stage(&self, _key: &DatasetKey, stage: Stage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_progress(&self, _key: &DatasetKey, progress: &ProgressUpdate) {
        self.progress.lock().unwrap().push(progress.clone());
    }

    fn on_integrity(&self, _key: &DatasetKey, result: &IntegrityResult) {
        self.integrity.lock().unwrap().push(result.clone());
    }

    fn on_finished(&self, outcome: &AcquisitionOutcome) {
        self.outcomes.lock().unwrap().push(outcome.clone());
        *self.finished_on.lock().unwrap() = Some(thread::current().id());
    }
}
