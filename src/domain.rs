use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SkyDataError;

/// Key of the base data pack every installation needs.
pub const DEFAULT_DATASET_KEY: &str = "default-data";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetKey(String);

impl DatasetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives a key from a human-readable name, the way catalogs without
    /// explicit keys are indexed: whitespace runs become dashes.
    pub fn from_name(name: &str) -> Result<Self, SkyDataError> {
        name.split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .parse()
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetKey {
    type Err = SkyDataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed != "."
            && trimmed != ".."
            && !trimmed
                .chars()
                .any(|ch| ch.is_whitespace() || ch == '/' || ch == '\\');
        if !is_valid {
            return Err(SkyDataError::InvalidKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for DatasetKey {
    type Error = SkyDataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetKey> for String {
    fn from(value: DatasetKey) -> Self {
        value.0
    }
}

/// One installable dataset as advertised by a catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetManifestEntry {
    pub key: DatasetKey,
    pub name: String,
    pub description: Option<String>,
    /// Download location; may still contain the mirror token.
    pub url: String,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
    /// Paths relative to the data root that the archive produces.
    pub files: Vec<String>,
    pub version: u32,
    pub min_app_version: Option<u32>,
    pub dataset_type: String,
    pub base_data: bool,
    pub release_notes: Option<String>,
    /// Relative path whose presence marks the dataset as installed.
    pub check: Option<String>,
}

impl DatasetManifestEntry {
    /// Case-insensitive match against name, description, key and type.
    pub fn matches_filter(&self, text: &str) -> bool {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.name.to_lowercase().contains(&needle)
            || self
                .description
                .as_ref()
                .map(|desc| desc.to_lowercase().contains(&needle))
                .unwrap_or(false)
            || self.key.as_str().to_lowercase().contains(&needle)
            || self.dataset_type.to_lowercase().contains(&needle)
    }

    pub fn is_star_dataset(&self) -> bool {
        matches!(
            self.dataset_type.as_str(),
            "catalog-lod" | "catalog-gaia" | "catalog-star"
        )
    }

    /// Last path segment of the download URL, without query or fragment.
    pub fn archive_file_name(&self) -> String {
        archive_file_name(&self.url)
    }
}

pub fn archive_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("dataset.tar.gz")
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Available,
    Installed,
    Outdated,
    Downloading,
}

impl DatasetStatus {
    pub fn resolve(catalog_version: u32, installed: Option<u32>, downloading: bool) -> Self {
        if downloading {
            return DatasetStatus::Downloading;
        }
        match installed {
            Some(local) if catalog_version > local => DatasetStatus::Outdated,
            Some(_) => DatasetStatus::Installed,
            None => DatasetStatus::Available,
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetStatus::Available => write!(f, "available"),
            DatasetStatus::Installed => write!(f, "installed"),
            DatasetStatus::Outdated => write!(f, "outdated"),
            DatasetStatus::Downloading => write!(f, "downloading"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_key_trims() {
        let key: DatasetKey = "  hipparcos ".parse().unwrap();
        assert_eq!(key.as_str(), "hipparcos");
    }

    #[test]
    fn parse_key_rejects_separators() {
        assert_matches!(
            "../etc".parse::<DatasetKey>(),
            Err(SkyDataError::InvalidKey(_))
        );
        assert_matches!("a b".parse::<DatasetKey>(), Err(SkyDataError::InvalidKey(_)));
        assert_matches!("".parse::<DatasetKey>(), Err(SkyDataError::InvalidKey(_)));
    }

    #[test]
    fn key_from_name() {
        let key = DatasetKey::from_name("Gaia  DR3   small").unwrap();
        assert_eq!(key.as_str(), "Gaia-DR3-small");
    }

    #[test]
    fn file_name_strips_query() {
        assert_eq!(
            archive_file_name("https://host/repo/dr3-small.tar.gz?token=1"),
            "dr3-small.tar.gz"
        );
    }

    #[test]
    fn status_resolution() {
        assert_eq!(DatasetStatus::resolve(3, None, false), DatasetStatus::Available);
        assert_eq!(DatasetStatus::resolve(3, Some(3), false), DatasetStatus::Installed);
        assert_eq!(DatasetStatus::resolve(4, Some(3), false), DatasetStatus::Outdated);
        assert_eq!(DatasetStatus::resolve(4, Some(3), true), DatasetStatus::Downloading);
    }
}
