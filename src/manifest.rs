use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain::{DEFAULT_DATASET_KEY, DatasetKey, DatasetManifestEntry};
use crate::error::SkyDataError;
use crate::task::CancelToken;
use crate::transfer::{HttpTransferClient, send_with_retries};

/// Placeholder in catalog URLs replaced by the configured mirror base.
pub const MIRROR_TOKEN: &str = "@mirror-url@";

/// Prefix catalogs use for paths relative to the data root.
const DATA_LOCATION_TOKEN: &str = "$data/";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    recommended: Option<Value>,
    #[serde(default)]
    files: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    key: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(rename = "type")]
    dataset_type: Option<String>,
    file: Option<String>,
    size: Option<i64>,
    sha256: Option<String>,
    #[serde(default)]
    version: u32,
    mingsversion: Option<u32>,
    files: Option<Vec<String>>,
    data: Option<Value>,
    check: Option<String>,
    releasenotes: Option<String>,
}

/// Parsed dataset catalog. Entries keep first-seen order; when a key shows
/// up more than once the highest version replaces the earlier one in place.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<DatasetManifestEntry>,
    types: Vec<String>,
    recommended: Vec<DatasetKey>,
}

impl Manifest {
    /// Accepts plain or gzip-compressed JSON. Entries requiring an
    /// application version newer than `app_version` are dropped.
    pub fn from_slice(bytes: &[u8], app_version: Option<u32>) -> Result<Self, SkyDataError> {
        let raw: RawCatalog = if bytes.starts_with(&GZIP_MAGIC) {
            let mut decoded = Vec::new();
            GzDecoder::new(bytes)
                .read_to_end(&mut decoded)
                .map_err(|err| SkyDataError::ManifestParse(format!("gzip: {err}")))?;
            serde_json::from_slice::<RawCatalog>(&decoded)
        } else {
            serde_json::from_slice::<RawCatalog>(bytes)
        }
        .map_err(|err| SkyDataError::ManifestParse(err.to_string()))?;

        let mut entries: Vec<DatasetManifestEntry> = Vec::new();
        let mut index: HashMap<DatasetKey, usize> = HashMap::new();
        for value in raw.files {
            let raw_entry: RawEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping malformed catalog entry: {err}");
                    continue;
                }
            };
            if let (Some(required), Some(current)) = (raw_entry.mingsversion, app_version) {
                if required > current {
                    debug!(
                        "skipping {:?}: requires version {required}",
                        raw_entry.key.as_ref().or(raw_entry.name.as_ref())
                    );
                    continue;
                }
            }
            let Some(entry) = convert_entry(raw_entry) else {
                continue;
            };
            match index.get(&entry.key) {
                Some(&position) => {
                    if entry.version > entries[position].version {
                        entries[position] = entry;
                    }
                }
                None => {
                    index.insert(entry.key.clone(), entries.len());
                    entries.push(entry);
                }
            }
        }

        let mut types: Vec<String> = Vec::new();
        for entry in &entries {
            if !types.contains(&entry.dataset_type) {
                types.push(entry.dataset_type.clone());
            }
        }

        let recommended: Vec<DatasetKey> = raw
            .recommended
            .as_ref()
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|key| key.parse::<DatasetKey>().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            entries,
            types,
            recommended,
        })
    }

    pub fn from_path(path: &Path, app_version: Option<u32>) -> Result<Self, SkyDataError> {
        let bytes = fs::read(path)
            .map_err(|err| SkyDataError::Filesystem(format!("read {}: {err}", path.display())))?;
        Self::from_slice(&bytes, app_version)
    }

    /// Loads the catalog from an `http(s)://` URL, a `file://` URL or a
    /// plain path. Remote catalogs are refused in offline mode.
    pub fn load(source: &str, settings: &Settings) -> Result<Self, SkyDataError> {
        if let Some(path) = source.strip_prefix("file://") {
            return Self::from_path(Path::new(path), settings.app_version);
        }
        if !(source.starts_with("http://") || source.starts_with("https://")) {
            return Self::from_path(Path::new(source), settings.app_version);
        }
        if settings.offline {
            return Err(SkyDataError::Offline(source.to_string()));
        }

        info!("fetching dataset catalog from {source}");
        let fetch_error = |reason: String| SkyDataError::ManifestFetch {
            url: source.to_string(),
            reason,
        };
        let transfer = HttpTransferClient::new(settings)?;
        let response = send_with_retries(&CancelToken::new(), || transfer.client().get(source))
            .map_err(|err| fetch_error(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("status {}", status.as_u16())));
        }
        let bytes = response.bytes().map_err(|err| fetch_error(err.to_string()))?;
        Self::from_slice(&bytes, settings.app_version)
    }

    /// Replaces the mirror token with `mirror`.
    pub fn resolve_url(url: &str, mirror: &str) -> String {
        url.replace(MIRROR_TOKEN, mirror)
    }

    pub fn entries(&self) -> &[DatasetManifestEntry] {
        &self.entries
    }

    pub fn get(&self, key: &DatasetKey) -> Option<&DatasetManifestEntry> {
        self.entries.iter().find(|entry| &entry.key == key)
    }

    /// Type tags in first-seen order.
    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn recommended(&self) -> &[DatasetKey] {
        &self.recommended
    }

    pub fn filter<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a DatasetManifestEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.matches_filter(text))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn convert_entry(raw: RawEntry) -> Option<DatasetManifestEntry> {
    let Some(url) = raw.file.filter(|file| !file.trim().is_empty()) else {
        warn!(
            "skipping catalog entry without download file: {:?}",
            raw.key.as_ref().or(raw.name.as_ref())
        );
        return None;
    };

    let has_key = raw.key.is_some();
    let key = match (&raw.key, &raw.name) {
        (Some(key), _) => key.parse::<DatasetKey>(),
        (None, Some(name)) => DatasetKey::from_name(name),
        (None, None) => {
            warn!("skipping catalog entry without key or name: {url}");
            return None;
        }
    };
    let key = match key {
        Ok(key) => key,
        Err(err) => {
            warn!("skipping catalog entry: {err}");
            return None;
        }
    };

    let mut name = raw.name.unwrap_or_else(|| key.to_string());
    let mut description = raw.description;
    // Old catalogs without keys pack "name - description" into description.
    if !has_key {
        if let Some((head, tail)) = description.as_deref().and_then(|d| d.split_once('-')) {
            name = head.trim().to_string();
            description = Some(tail.trim().to_string());
        }
    }

    let files = match raw.files {
        Some(files) => files,
        None => raw
            .data
            .as_ref()
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };

    Some(DatasetManifestEntry {
        base_data: key.as_str() == DEFAULT_DATASET_KEY,
        key,
        name,
        description,
        url,
        size_bytes: raw.size.and_then(|size| u64::try_from(size).ok()),
        sha256: raw.sha256.filter(|digest| !digest.trim().is_empty()),
        files: files.iter().map(|file| strip_data_token(file)).collect(),
        version: raw.version,
        min_app_version: raw.mingsversion,
        dataset_type: raw.dataset_type.unwrap_or_else(|| "other".to_string()),
        release_notes: raw.releasenotes,
        check: raw.check.map(|check| strip_data_token(&check)),
    })
}

fn strip_data_token(path: &str) -> String {
    path.strip_prefix(DATA_LOCATION_TOKEN)
        .unwrap_or(path)
        .to_string()
}
