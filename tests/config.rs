use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use skydata_manager::config::{Config, ConfigLoader, DEFAULT_MIRROR, default_catalog_url};
use skydata_manager::error::SkyDataError;

#[test]
fn explicit_config_file_is_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("skydata.json");
    std::fs::write(
        &path,
        r#"{
            "data_location": "/srv/sky/data",
            "temp_location": "/srv/sky/tmp",
            "offline_mode": false,
            "data_mirror": "https://mirror.example/repo/",
            "http_timeout_secs": 5,
            "app_version": 30500
        }"#,
    )
    .unwrap();

    let settings = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(settings.data_root, Utf8PathBuf::from("/srv/sky/data"));
    assert_eq!(settings.temp_dir, Utf8PathBuf::from("/srv/sky/tmp"));
    assert_eq!(settings.mirror_url, "https://mirror.example/repo/");
    assert_eq!(
        settings.catalog_url,
        "https://mirror.example/repo/gaiasky-data.json.gz"
    );
    assert_eq!(settings.http_timeout, Duration::from_secs(5));
    assert_eq!(settings.app_version, Some(30500));
}

#[test]
fn explicit_catalog_url_wins_over_mirror() {
    let config = Config {
        data_location: Some("/data".to_string()),
        data_mirror: Some("https://mirror.example/".to_string()),
        catalog_url: Some("file:///srv/catalog.json".to_string()),
        ..Config::default()
    };
    let settings = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(settings.catalog_url, "file:///srv/catalog.json");
    assert_eq!(settings.mirror_url, "https://mirror.example/");
}

#[test]
fn defaults_point_at_public_mirror() {
    let config = Config {
        data_location: Some("/data".to_string()),
        ..Config::default()
    };
    let settings = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(settings.mirror_url, DEFAULT_MIRROR);
    assert_eq!(settings.catalog_url, default_catalog_url(DEFAULT_MIRROR));
    assert_eq!(settings.app_version, None);
}

#[test]
fn missing_explicit_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(Some(path.to_str().unwrap())),
        Err(SkyDataError::ConfigRead(reported)) if reported == path
    );
}

#[test]
fn malformed_config_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("skydata.json");
    std::fs::write(&path, "{ data_location: ").unwrap();
    assert_matches!(
        ConfigLoader::resolve(Some(path.to_str().unwrap())),
        Err(SkyDataError::ConfigParse(_))
    );
}

#[test]
fn zero_timeout_is_rejected() {
    let config = Config {
        data_location: Some("/data".to_string()),
        http_timeout_secs: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(SkyDataError::ConfigParse(_))
    );
}
