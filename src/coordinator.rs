use std::sync::Arc;
use std::thread::{self, JoinHandle};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::domain::{DatasetKey, DatasetManifestEntry};
use crate::error::SkyDataError;
use crate::extract::{ArchiveExtractor, ExtractOutcome};
use crate::manifest::Manifest;
use crate::progress::ProgressUpdate;
use crate::registry::TaskRegistry;
use crate::store::{DataStore, InstallRecord, remove_file_quietly};
use crate::task::{AcquisitionTask, CancelToken, Stage, TaskSnapshot};
use crate::transfer::{TransferClient, TransferOutcome, TransferRequest};
use crate::verify::{IntegrityResult, IntegrityVerifier};

/// Everything the pipeline needs to know about one dataset, with the
/// download URL already resolved against the mirror.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub key: DatasetKey,
    pub name: String,
    pub url: String,
    pub sha256: Option<String>,
    pub version: u32,
    /// Archive size from the catalog; enables the free-space check.
    pub size_bytes: Option<u64>,
}

impl AcquireRequest {
    pub fn from_entry(entry: &DatasetManifestEntry, mirror: &str) -> Self {
        Self {
            key: entry.key.clone(),
            name: entry.name.clone(),
            url: Manifest::resolve_url(&entry.url, mirror),
            sha256: entry.sha256.clone(),
            version: entry.version,
            size_bytes: entry.size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum AcquisitionOutcome {
    Installed { key: DatasetKey, verified: bool },
    Failed { key: DatasetKey, reason: String },
    Cancelled { key: DatasetKey },
}

impl AcquisitionOutcome {
    pub fn key(&self) -> &DatasetKey {
        match self {
            AcquisitionOutcome::Installed { key, .. }
            | AcquisitionOutcome::Failed { key, .. }
            | AcquisitionOutcome::Cancelled { key } => key,
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, AcquisitionOutcome::Installed { .. })
    }
}

/// Callbacks for one acquisition. Always invoked through the coordinator's
/// dispatcher; `on_finished` fires exactly once.
pub trait AcquisitionListener: Send + Sync + 'static {
    fn on_stage(&self, _key: &DatasetKey, _stage: Stage) {}
    fn on_progress(&self, _key: &DatasetKey, _progress: &ProgressUpdate) {}
    fn on_integrity(&self, _key: &DatasetKey, _result: &IntegrityResult) {}
    fn on_finished(&self, outcome: &AcquisitionOutcome);
}

#[derive(Debug)]
enum HandleState {
    Ready(AcquisitionOutcome),
    Running(JoinHandle<AcquisitionOutcome>),
}

#[derive(Debug)]
pub struct AcquisitionHandle {
    key: DatasetKey,
    state: HandleState,
}

impl AcquisitionHandle {
    pub fn key(&self) -> &DatasetKey {
        &self.key
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Running(worker) => worker.is_finished(),
        }
    }

    /// Blocks until the worker ends. The listener has already been handed
    /// the same outcome through the dispatcher.
    pub fn join(self) -> Result<AcquisitionOutcome, SkyDataError> {
        match self.state {
            HandleState::Ready(outcome) => Ok(outcome),
            HandleState::Running(worker) => worker
                .join()
                .map_err(|_| SkyDataError::WorkerPanicked(self.key.to_string())),
        }
    }
}

enum Flow {
    Installed { verified: bool },
    Cancelled,
}

struct Inner<T> {
    settings: Settings,
    store: DataStore,
    registry: TaskRegistry,
    transfer: Arc<T>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Drives download, verification and extraction for each requested dataset
/// on its own worker thread, at most one task per key.
pub struct AcquisitionCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AcquisitionCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> AcquisitionCoordinator<T>
where
    T: TransferClient + 'static,
{
    pub fn new(settings: Settings, transfer: Arc<T>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let store = DataStore::new(&settings);
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                registry: TaskRegistry::new(),
                transfer,
                dispatcher,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &DataStore {
        &self.inner.store
    }

    /// Starts the pipeline for `request.key`. Fails synchronously only when
    /// a task for the same key is already registered.
    pub fn acquire(
        &self,
        request: AcquireRequest,
        listener: Arc<dyn AcquisitionListener>,
    ) -> Result<AcquisitionHandle, SkyDataError> {
        let key = request.key.clone();
        if self.inner.settings.offline {
            let reason = SkyDataError::Offline(key.to_string()).to_string();
            warn!("{reason}");
            let outcome = AcquisitionOutcome::Failed {
                key: key.clone(),
                reason,
            };
            self.inner.post_finished(&listener, outcome.clone());
            return Ok(AcquisitionHandle {
                key,
                state: HandleState::Ready(outcome),
            });
        }

        let staging = self.inner.store.staging_path(&key, &request.url);
        let task = AcquisitionTask::new(key.clone(), staging.clone().into_std_path_buf());
        let cancel = self.inner.registry.register(task)?;
        info!("acquiring {key} from {}", request.url);

        let inner = self.inner.clone();
        let worker = thread::Builder::new()
            .name(format!("acquire-{key}"))
            .spawn(move || inner.run(request, staging, cancel, listener));
        match worker {
            Ok(worker) => Ok(AcquisitionHandle {
                key,
                state: HandleState::Running(worker),
            }),
            Err(err) => {
                self.inner.registry.remove(&key);
                Err(SkyDataError::Filesystem(format!("spawn worker: {err}")))
            }
        }
    }

    pub fn cancel(&self, key: &DatasetKey) -> bool {
        let found = self.inner.registry.cancel(key);
        if found {
            info!("cancellation requested for {key}");
        }
        found
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.registry.cancel_all()
    }

    pub fn status(&self, key: &DatasetKey) -> Option<TaskSnapshot> {
        self.inner.registry.snapshot(key)
    }

    pub fn active(&self) -> Vec<TaskSnapshot> {
        self.inner.registry.snapshots()
    }

    pub fn is_active(&self, key: &DatasetKey) -> bool {
        self.inner.registry.contains(key)
    }
}

/// Removes the registry entry if the worker unwinds before reaching its
/// terminal outcome.
struct RegistryGuard<'a> {
    registry: &'a TaskRegistry,
    key: &'a DatasetKey,
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.key);
    }
}

impl<T> Inner<T>
where
    T: TransferClient + 'static,
{
    fn run(
        &self,
        request: AcquireRequest,
        staging: Utf8PathBuf,
        cancel: CancelToken,
        listener: Arc<dyn AcquisitionListener>,
    ) -> AcquisitionOutcome {
        let key = request.key.clone();
        let guard = RegistryGuard {
            registry: &self.registry,
            key: &key,
        };

        let outcome = match self.pipeline(&request, &staging, &cancel, &listener) {
            Ok(Flow::Installed { verified }) => {
                info!("installed {key} (verified: {verified})");
                self.registry.set_stage(&key, Stage::Completed);
                AcquisitionOutcome::Installed {
                    key: key.clone(),
                    verified,
                }
            }
            Ok(Flow::Cancelled) => {
                info!("acquisition of {key} cancelled");
                self.registry.set_stage(&key, Stage::Cancelled);
                self.cleanup(&staging);
                AcquisitionOutcome::Cancelled { key: key.clone() }
            }
            Err(err) => {
                error!("acquisition of {key} failed: {err}");
                self.registry.set_stage(&key, Stage::Failed);
                self.cleanup(&staging);
                AcquisitionOutcome::Failed {
                    key: key.clone(),
                    reason: err.to_string(),
                }
            }
        };

        drop(guard);
        self.post_finished(&listener, outcome.clone());
        outcome
    }

    fn pipeline(
        &self,
        request: &AcquireRequest,
        staging: &Utf8PathBuf,
        cancel: &CancelToken,
        listener: &Arc<dyn AcquisitionListener>,
    ) -> Result<Flow, SkyDataError> {
        let key = &request.key;

        self.enter_stage(key, Stage::Downloading, listener);
        self.store.ensure_temp_dir()?;
        if let Some(size) = request.size_bytes {
            self.store.ensure_free_space(size)?;
        }
        let transfer_request = TransferRequest {
            url: request.url.clone(),
            destination: staging.clone().into_std_path_buf(),
            resume_if_partial: true,
        };
        let fetched = self.transfer.fetch(&transfer_request, cancel, &mut |progress| {
            self.registry
                .set_progress(key, progress.bytes_read, progress.bytes_total);
            self.post_progress(listener, key, ProgressUpdate::Transfer(progress));
        })?;
        match fetched {
            TransferOutcome::Completed { bytes } => info!("downloaded {key}: {bytes} bytes"),
            TransferOutcome::Cancelled => return Ok(Flow::Cancelled),
        }
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        self.enter_stage(key, Stage::Verifying, listener);
        let integrity = IntegrityVerifier::verify_with_progress(
            staging.as_std_path(),
            request.sha256.as_deref(),
            &mut |progress| {
                self.registry
                    .set_progress(key, progress.bytes_hashed, Some(progress.bytes_total));
                self.post_progress(listener, key, ProgressUpdate::Verify(progress));
            },
        )?;
        // Hashing is not interruptible; a cancel that arrived meanwhile wins.
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.post_integrity(listener, key, integrity.clone());
        let verified = match &integrity {
            IntegrityResult::Match { .. } => true,
            IntegrityResult::Unavailable => {
                warn!("no checksum published for {key}, installing unverified");
                false
            }
            IntegrityResult::Mismatch { computed, expected } => {
                return Err(SkyDataError::Integrity {
                    expected: expected.clone(),
                    computed: computed.clone(),
                });
            }
        };

        self.enter_stage(key, Stage::Extracting, listener);
        self.store.ensure_data_root()?;
        let extracted = ArchiveExtractor::extract(
            staging.as_std_path(),
            self.store.data_root().as_std_path(),
            cancel,
            &mut |progress| {
                self.registry.set_progress(
                    key,
                    progress.compressed_read,
                    Some(progress.compressed_total),
                );
                self.post_progress(listener, key, ProgressUpdate::Extract(progress));
            },
        )?;
        let files = match extracted {
            ExtractOutcome::Completed {
                files,
                bytes_written,
            } => {
                info!("extracted {files} files ({bytes_written} bytes) for {key}");
                files
            }
            ExtractOutcome::Cancelled => return Ok(Flow::Cancelled),
        };

        remove_file_quietly(staging.as_std_path())?;
        let digest = integrity.computed().filter(|_| verified).map(str::to_string);
        let record = InstallRecord::new(
            key.clone(),
            request.name.clone(),
            request.version,
            digest,
            files,
        );
        self.store.write_install_record(&record)?;
        Ok(Flow::Installed { verified })
    }

    fn cleanup(&self, staging: &Utf8PathBuf) {
        if let Err(err) = remove_file_quietly(staging.as_std_path()) {
            warn!("failed to remove staging file {staging}: {err}");
        }
    }

    fn enter_stage(
        &self,
        key: &DatasetKey,
        stage: Stage,
        listener: &Arc<dyn AcquisitionListener>,
    ) {
        info!("{key}: {stage}");
        self.registry.set_stage(key, stage);
        let listener = listener.clone();
        let key = key.clone();
        self.dispatcher
            .post(Box::new(move || listener.on_stage(&key, stage)));
    }

    fn post_progress(
        &self,
        listener: &Arc<dyn AcquisitionListener>,
        key: &DatasetKey,
        progress: ProgressUpdate,
    ) {
        let listener = listener.clone();
        let key = key.clone();
        self.dispatcher
            .post(Box::new(move || listener.on_progress(&key, &progress)));
    }

    fn post_integrity(
        &self,
        listener: &Arc<dyn AcquisitionListener>,
        key: &DatasetKey,
        result: IntegrityResult,
    ) {
        let listener = listener.clone();
        let key = key.clone();
        self.dispatcher
            .post(Box::new(move || listener.on_integrity(&key, &result)));
    }
}

impl<T> Inner<T> {
    fn post_finished(
        &self,
        listener: &Arc<dyn AcquisitionListener>,
        outcome: AcquisitionOutcome,
    ) {
        let listener = listener.clone();
        self.dispatcher
            .post(Box::new(move || listener.on_finished(&outcome)));
    }
}
