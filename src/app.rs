use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::coordinator::{
    AcquireRequest, AcquisitionCoordinator, AcquisitionHandle, AcquisitionListener,
    AcquisitionOutcome,
};
use crate::domain::{DEFAULT_DATASET_KEY, DatasetKey, DatasetManifestEntry, DatasetStatus};
use crate::error::SkyDataError;
use crate::manifest::Manifest;
use crate::progress::human_bytes;
use crate::store::InstallRecord;
use crate::task::TaskSnapshot;
use crate::transfer::TransferClient;

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Re-acquire datasets that are already installed and up to date.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogResult {
    pub source: String,
    pub types: Vec<String>,
    pub recommended: Vec<DatasetKey>,
    pub datasets: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub key: DatasetKey,
    pub name: String,
    pub dataset_type: String,
    pub version: u32,
    pub installed_version: Option<u32>,
    pub status: DatasetStatus,
    pub size: Option<String>,
    pub checksum: bool,
    pub base_data: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub data_root: String,
    pub datasets: Vec<InstallRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub key: DatasetKey,
    pub status: DatasetStatus,
    pub catalog_version: u32,
    pub installed_version: Option<u32>,
    pub record: Option<InstallRecord>,
    pub task: Option<TaskSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub key: DatasetKey,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub items: Vec<FetchItemResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchItemResult {
    pub key: DatasetKey,
    pub action: String,
    pub outcome: Option<AcquisitionOutcome>,
}

/// Acquisitions started by [`App::start_fetch`]; datasets that were already
/// current are listed in `skipped`, those another caller is already
/// acquiring in `in_progress`.
#[derive(Default)]
pub struct FetchPlan {
    pub handles: Vec<AcquisitionHandle>,
    pub skipped: Vec<DatasetKey>,
    pub in_progress: Vec<DatasetKey>,
}

impl FetchPlan {
    /// Waits for every started acquisition and reports one item per key.
    pub fn finish(self) -> Result<FetchResult, SkyDataError> {
        let mut items = Vec::new();
        let reported = [(self.skipped, "up-to-date"), (self.in_progress, "in-progress")];
        for (keys, action) in reported {
            items.extend(keys.into_iter().map(|key| FetchItemResult {
                key,
                action: action.to_string(),
                outcome: None,
            }));
        }
        for handle in self.handles {
            let key = handle.key().clone();
            let outcome = handle.join()?;
            items.push(FetchItemResult {
                key,
                action: action_label(&outcome).to_string(),
                outcome: Some(outcome),
            });
        }
        Ok(FetchResult { items })
    }
}

pub struct App<T: TransferClient> {
    coordinator: AcquisitionCoordinator<T>,
}

impl<T: TransferClient + 'static> App<T> {
    pub fn new(coordinator: AcquisitionCoordinator<T>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &AcquisitionCoordinator<T> {
        &self.coordinator
    }

    pub fn settings(&self) -> &Settings {
        self.coordinator.settings()
    }

    pub fn load_manifest(&self) -> Result<Manifest, SkyDataError> {
        Manifest::load(&self.settings().catalog_url, self.settings())
    }

    pub fn catalog(
        &self,
        manifest: &Manifest,
        filter: Option<&str>,
    ) -> Result<CatalogResult, SkyDataError> {
        let mut datasets = Vec::new();
        for entry in manifest.filter(filter.unwrap_or_default()) {
            let installed_version = self.coordinator.store().installed_version(entry)?;
            datasets.push(CatalogEntry {
                key: entry.key.clone(),
                name: entry.name.clone(),
                dataset_type: entry.dataset_type.clone(),
                version: entry.version,
                installed_version,
                status: self.resolve_status(entry, installed_version),
                size: entry.size_bytes.map(human_bytes),
                checksum: entry.sha256.is_some(),
                base_data: entry.base_data,
            });
        }
        Ok(CatalogResult {
            source: self.settings().catalog_url.clone(),
            types: manifest.types().to_vec(),
            recommended: manifest.recommended().to_vec(),
            datasets,
        })
    }

    pub fn list(&self) -> Result<ListResult, SkyDataError> {
        let store = self.coordinator.store();
        Ok(ListResult {
            data_root: store.data_root().to_string(),
            datasets: store.list_install_records()?,
        })
    }

    pub fn status(
        &self,
        manifest: &Manifest,
        key: &DatasetKey,
    ) -> Result<StatusResult, SkyDataError> {
        let entry = lookup(manifest, key)?;
        let store = self.coordinator.store();
        let installed_version = store.installed_version(entry)?;
        Ok(StatusResult {
            key: key.clone(),
            status: self.resolve_status(entry, installed_version),
            catalog_version: entry.version,
            installed_version,
            record: store.read_install_record(key)?,
            task: self.coordinator.status(key),
        })
    }

    /// Removes an installed dataset. Refused while the dataset is being
    /// acquired.
    pub fn delete(
        &self,
        manifest: &Manifest,
        key: &DatasetKey,
    ) -> Result<DeleteResult, SkyDataError> {
        let entry = lookup(manifest, key)?;
        if self.coordinator.is_active(key) {
            return Err(SkyDataError::AlreadyInProgress(key.to_string()));
        }
        let removed = self.coordinator.store().delete_dataset(entry)?;
        Ok(DeleteResult {
            key: key.clone(),
            removed: removed.into_iter().map(|path| path.to_string()).collect(),
        })
    }

    /// Starts one acquisition per requested key (the base data pack when
    /// none is given). Unknown keys fail before anything starts.
    pub fn start_fetch(
        &self,
        manifest: &Manifest,
        keys: &[DatasetKey],
        options: FetchOptions,
        listener: Arc<dyn AcquisitionListener>,
    ) -> Result<FetchPlan, SkyDataError> {
        let mut requested: Vec<DatasetKey> = Vec::new();
        if keys.is_empty() {
            requested.push(DEFAULT_DATASET_KEY.parse()?);
        }
        for key in keys {
            if !requested.contains(key) {
                requested.push(key.clone());
            }
        }

        let mut entries = Vec::new();
        for key in &requested {
            entries.push(lookup(manifest, key)?);
        }

        let mirror = self.settings().mirror_url.clone();
        let mut plan = FetchPlan::default();
        for entry in entries {
            if let Err(err) = self.plan_entry(entry, &mirror, options, &listener, &mut plan) {
                self.abandon(plan);
                return Err(err);
            }
        }
        Ok(plan)
    }

    fn plan_entry(
        &self,
        entry: &DatasetManifestEntry,
        mirror: &str,
        options: FetchOptions,
        listener: &Arc<dyn AcquisitionListener>,
        plan: &mut FetchPlan,
    ) -> Result<(), SkyDataError> {
        let installed = self.coordinator.store().installed_version(entry)?;
        let current = matches!(
            DatasetStatus::resolve(entry.version, installed, false),
            DatasetStatus::Installed
        );
        if current && !options.force {
            info!("{} is up to date (version {})", entry.key, entry.version);
            plan.skipped.push(entry.key.clone());
            return Ok(());
        }
        let request = AcquireRequest::from_entry(entry, mirror);
        match self.coordinator.acquire(request, listener.clone()) {
            Ok(handle) => plan.handles.push(handle),
            Err(SkyDataError::AlreadyInProgress(_)) => {
                info!("{} is already being acquired", entry.key);
                plan.in_progress.push(entry.key.clone());
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Cancels and joins acquisitions started by a plan that failed midway.
    fn abandon(&self, plan: FetchPlan) {
        for handle in &plan.handles {
            self.coordinator.cancel(handle.key());
        }
        for handle in plan.handles {
            let key = handle.key().clone();
            if let Err(err) = handle.join() {
                warn!("abandoned acquisition of {key} ended badly: {err}");
            }
        }
    }

    /// Runs [`App::start_fetch`] and waits for every acquisition to end.
    pub fn fetch(
        &self,
        manifest: &Manifest,
        keys: &[DatasetKey],
        options: FetchOptions,
        listener: Arc<dyn AcquisitionListener>,
    ) -> Result<FetchResult, SkyDataError> {
        self.start_fetch(manifest, keys, options, listener)?.finish()
    }

    fn resolve_status(
        &self,
        entry: &DatasetManifestEntry,
        installed: Option<u32>,
    ) -> DatasetStatus {
        DatasetStatus::resolve(
            entry.version,
            installed,
            self.coordinator.is_active(&entry.key),
        )
    }
}

pub fn action_label(outcome: &AcquisitionOutcome) -> &'static str {
    match outcome {
        AcquisitionOutcome::Installed { verified: true, .. } => "installed",
        AcquisitionOutcome::Installed { verified: false, .. } => "installed-unverified",
        AcquisitionOutcome::Failed { .. } => "failed",
        AcquisitionOutcome::Cancelled { .. } => "cancelled",
    }
}

fn lookup<'a>(
    manifest: &'a Manifest,
    key: &DatasetKey,
) -> Result<&'a DatasetManifestEntry, SkyDataError> {
    manifest
        .get(key)
        .ok_or_else(|| SkyDataError::UnknownDataset(key.to_string()))
}
