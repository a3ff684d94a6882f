use std::fs;
use std::io::{self, Write};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain::{DatasetKey, DatasetManifestEntry, archive_file_name};
use crate::error::SkyDataError;

const RECORDS_DIR: &str = ".installed";

/// Layout of the shared data root and its staging area.
#[derive(Debug, Clone)]
pub struct DataStore {
    data_root: Utf8PathBuf,
    temp_dir: Utf8PathBuf,
}

impl DataStore {
    pub fn new(settings: &Settings) -> Self {
        Self::new_with_paths(settings.data_root.clone(), settings.temp_dir.clone())
    }

    pub fn new_with_paths(data_root: Utf8PathBuf, temp_dir: Utf8PathBuf) -> Self {
        Self {
            data_root,
            temp_dir,
        }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn temp_dir(&self) -> &Utf8Path {
        &self.temp_dir
    }

    pub fn ensure_data_root(&self) -> Result<(), SkyDataError> {
        fs::create_dir_all(self.data_root.as_std_path())
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))
    }

    pub fn ensure_temp_dir(&self) -> Result<(), SkyDataError> {
        fs::create_dir_all(self.temp_dir.as_std_path())
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))
    }

    /// Refuses a download of `size` bytes unless the disk holding the temp
    /// directory has room for the archive plus its unpacked contents.
    pub fn ensure_free_space(&self, size: u64) -> Result<(), SkyDataError> {
        match available_space(self.temp_dir.as_std_path()) {
            Some(available) => check_free_space(size, available),
            None => {
                warn!("unable to determine free space for {}", self.temp_dir);
                Ok(())
            }
        }
    }

    /// Staging file for one dataset; the key prefix keeps two datasets with
    /// the same archive name apart.
    pub fn staging_path(&self, key: &DatasetKey, url: &str) -> Utf8PathBuf {
        self.temp_dir
            .join(format!("{key}-{}.part", archive_file_name(url)))
    }

    pub fn install_record_path(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.data_root
            .join(RECORDS_DIR)
            .join(format!("{}.json", key.as_str()))
    }

    pub fn write_install_record(&self, record: &InstallRecord) -> Result<(), SkyDataError> {
        let path = self.install_record_path(&record.key);
        let parent = path
            .parent()
            .ok_or_else(|| SkyDataError::Filesystem("invalid record path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("skydata-record")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn read_install_record(
        &self,
        key: &DatasetKey,
    ) -> Result<Option<InstallRecord>, SkyDataError> {
        let path = self.install_record_path(key);
        match fs::read_to_string(path.as_std_path()) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|err| SkyDataError::Filesystem(format!("{path}: {err}"))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SkyDataError::Filesystem(err.to_string())),
        }
    }

    pub fn list_install_records(&self) -> Result<Vec<InstallRecord>, SkyDataError> {
        let records_dir = self.data_root.join(RECORDS_DIR);
        if !records_dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(records_dir.as_std_path())
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        for entry in entries {
            let path = entry
                .map_err(|err| SkyDataError::Filesystem(err.to_string()))?
                .path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let content = fs::read_to_string(&path)
                    .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
                match serde_json::from_str::<InstallRecord>(&content) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        warn!("ignoring unreadable install record {}: {err}", path.display())
                    }
                }
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Installed version of a catalog entry: the install record when one
    /// exists, otherwise the `version` field of its check file (0 when the
    /// check file exists but carries none).
    pub fn installed_version(
        &self,
        entry: &DatasetManifestEntry,
    ) -> Result<Option<u32>, SkyDataError> {
        if let Some(record) = self.read_install_record(&entry.key)? {
            return Ok(Some(record.version));
        }
        let Some(check) = entry.check.as_deref() else {
            return Ok(None);
        };
        let check_path = self.resolve_relative(check)?;
        if !check_path.as_std_path().is_file() {
            return Ok(None);
        }
        Ok(Some(check_file_version(check_path.as_std_path())))
    }

    /// Explicit user action: removes every path the catalog lists for the
    /// dataset (last segment may hold `*`/`?` wildcards), or the check file
    /// when no list is given, plus the install record.
    pub fn delete_dataset(
        &self,
        entry: &DatasetManifestEntry,
    ) -> Result<Vec<Utf8PathBuf>, SkyDataError> {
        let mut removed = Vec::new();
        if !entry.files.is_empty() {
            for pattern in &entry.files {
                removed.extend(self.remove_matching(pattern)?);
            }
        } else if let Some(check) = entry.check.as_deref() {
            let path = self.resolve_relative(check)?;
            if remove_path(path.as_std_path())? {
                removed.push(path);
            }
        }
        remove_file_quietly(self.install_record_path(&entry.key).as_std_path())?;
        info!("deleted dataset {} ({} paths)", entry.key, removed.len());
        Ok(removed)
    }

    fn remove_matching(&self, pattern: &str) -> Result<Vec<Utf8PathBuf>, SkyDataError> {
        let trimmed = pattern.trim_end_matches('/');
        let (parent, name) = match trimmed.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", trimmed),
        };
        let directory = if parent.is_empty() {
            self.data_root.clone()
        } else {
            self.resolve_relative(parent)?
        };
        if !directory.as_std_path().is_dir() {
            return Ok(Vec::new());
        }

        let matcher = wildcard_regex(name)?;
        let mut removed = Vec::new();
        let entries = fs::read_dir(directory.as_std_path())
            .map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
        for item in entries {
            let item = item.map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
            let file_name = item.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if matcher.is_match(file_name) {
                let path = directory.join(file_name);
                if remove_path(path.as_std_path())? {
                    removed.push(path);
                }
            }
        }
        Ok(removed)
    }

    fn resolve_relative(&self, relative: &str) -> Result<Utf8PathBuf, SkyDataError> {
        let relative = Utf8Path::new(relative.trim_start_matches("./"));
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|component| component.as_str() == "..");
        if escapes {
            return Err(SkyDataError::Filesystem(format!(
                "path outside data root: {relative}"
            )));
        }
        Ok(self.data_root.join(relative))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub key: DatasetKey,
    pub name: String,
    pub version: u32,
    pub installed_at: String,
    pub verified: bool,
    pub sha256: Option<String>,
    pub files: usize,
    pub tool: String,
}

impl InstallRecord {
    pub fn new(
        entry_key: DatasetKey,
        name: String,
        version: u32,
        sha256: Option<String>,
        files: usize,
    ) -> Self {
        Self {
            key: entry_key,
            name,
            version,
            installed_at: chrono::Utc::now().to_rfc3339(),
            verified: sha256.is_some(),
            sha256,
            files,
            tool: Settings::user_agent(),
        }
    }
}

/// Deletes a file, treating "already gone" as success. Returns whether a
/// file was actually removed.
pub fn remove_file_quietly(path: &Path) -> Result<bool, SkyDataError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(SkyDataError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

/// Archive plus one and a half times its size for the extracted files.
pub fn required_space(size: u64) -> u64 {
    size.saturating_add(size.saturating_mul(3) / 2)
}

pub fn check_free_space(size: u64, available: u64) -> Result<(), SkyDataError> {
    let required = required_space(size);
    if required >= available {
        return Err(SkyDataError::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(())
}

/// Free bytes on the disk whose mount point is the longest prefix of `path`.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = fs::canonicalize(path).ok()?;
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())?;
    debug!(
        "{} is on {} ({} bytes free)",
        path.display(),
        disk.mount_point().display(),
        disk.available_space()
    );
    Some(disk.available_space())
}

fn remove_path(path: &Path) -> Result<bool, SkyDataError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .map(|_| true)
            .map_err(|err| SkyDataError::Filesystem(format!("remove {}: {err}", path.display()))),
        Ok(_) => remove_file_quietly(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(SkyDataError::Filesystem(err.to_string())),
    }
}

fn wildcard_regex(pattern: &str) -> Result<Regex, SkyDataError> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).map_err(|err| SkyDataError::Filesystem(err.to_string()))
}

fn check_file_version(path: &Path) -> u32 {
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json {
        return 0;
    }
    fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|value| value.get("version").and_then(|v| v.as_u64()))
        .and_then(|version| u32::try_from(version).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_path_is_key_scoped() {
        let store = DataStore::new_with_paths(
            Utf8PathBuf::from("/data"),
            Utf8PathBuf::from("/data/tmp"),
        );
        let key: DatasetKey = "hip".parse().unwrap();
        let path = store.staging_path(&key, "https://mirror/hip/catalog.tar.gz");
        assert_eq!(path, Utf8PathBuf::from("/data/tmp/hip-catalog.tar.gz.part"));
    }

    #[test]
    fn wildcard_matches_whole_name() {
        let matcher = wildcard_regex("dr3-*.bin").unwrap();
        assert!(matcher.is_match("dr3-000.bin"));
        assert!(!matcher.is_match("xdr3-000.bin.bak"));
    }

    #[test]
    fn free_space_covers_archive_and_contents() {
        assert_eq!(required_space(1000), 2500);
        assert_eq!(required_space(u64::MAX), u64::MAX);
        assert!(check_free_space(1000, 2501).is_ok());
        assert!(matches!(
            check_free_space(1000, 2500),
            Err(SkyDataError::InsufficientSpace {
                required: 2500,
                available: 2500
            })
        ));
        assert!(check_free_space(0, 0).is_err());
    }

    #[test]
    fn relative_paths_cannot_escape() {
        let store = DataStore::new_with_paths(
            Utf8PathBuf::from("/data"),
            Utf8PathBuf::from("/data/tmp"),
        );
        assert!(store.resolve_relative("../etc").is_err());
        assert_eq!(
            store.resolve_relative("./hip/dataset.json").unwrap(),
            Utf8PathBuf::from("/data/hip/dataset.json")
        );
    }
}
