use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::SkyDataError;

pub const DEFAULT_MIRROR: &str = "https://gaia.ari.uni-heidelberg.de/gaiasky/files/repository/";
pub const DEFAULT_CONFIG_FILE: &str = "skydata.json";
pub const OFFLINE_ENV: &str = "SKYDATA_OFFLINE";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// On-disk configuration; every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_location: Option<String>,
    #[serde(default)]
    pub temp_location: Option<String>,
    #[serde(default)]
    pub offline_mode: Option<bool>,
    #[serde(default)]
    pub data_mirror: Option<String>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub app_version: Option<u32>,
}

/// Immutable configuration snapshot handed to the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: Utf8PathBuf,
    pub temp_dir: Utf8PathBuf,
    pub offline: bool,
    pub mirror_url: String,
    pub catalog_url: String,
    pub http_timeout: Duration,
    /// Catalog entries requiring a newer application version are hidden.
    pub app_version: Option<u32>,
}

impl Settings {
    pub fn with_data_root(data_root: Utf8PathBuf) -> Self {
        let temp_dir = data_root.join("tmp");
        Self {
            data_root,
            temp_dir,
            offline: false,
            mirror_url: DEFAULT_MIRROR.to_string(),
            catalog_url: default_catalog_url(DEFAULT_MIRROR),
            http_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            app_version: None,
        }
    }

    pub fn user_agent() -> String {
        format!("skydata/{}", env!("CARGO_PKG_VERSION"))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `skydata.json` in the working directory when it
    /// exists, and applies the `SKYDATA_OFFLINE` override.
    pub fn resolve(path: Option<&str>) -> Result<Settings, SkyDataError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| SkyDataError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| SkyDataError::ConfigParse(err.to_string()))?
        };

        let mut settings = Self::resolve_config(config)?;
        if offline_from_env() {
            settings.offline = true;
        }
        Ok(settings)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, SkyDataError> {
        let data_root = match config.data_location {
            Some(location) => Utf8PathBuf::from(location),
            None => default_data_root()?,
        };
        let temp_dir = config
            .temp_location
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| data_root.join("tmp"));
        let mirror_url = config
            .data_mirror
            .unwrap_or_else(|| DEFAULT_MIRROR.to_string());
        let catalog_url = config
            .catalog_url
            .unwrap_or_else(|| default_catalog_url(&mirror_url));
        let timeout = config.http_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout == 0 {
            return Err(SkyDataError::ConfigParse(
                "http_timeout_secs must be positive".to_string(),
            ));
        }

        Ok(Settings {
            data_root,
            temp_dir,
            offline: config.offline_mode.unwrap_or(false),
            mirror_url,
            catalog_url,
            http_timeout: Duration::from_secs(timeout),
            app_version: config.app_version,
        })
    }
}

pub fn default_catalog_url(mirror: &str) -> String {
    format!("{mirror}gaiasky-data.json.gz")
}

fn default_data_root() -> Result<Utf8PathBuf, SkyDataError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("skydata")).ok())
        .ok_or_else(|| SkyDataError::Filesystem("unable to resolve data directory".to_string()))
}

fn offline_from_env() -> bool {
    std::env::var(OFFLINE_ENV)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
