//! Integration tests for configuration loading
//!
//! Covers TOML file loading and environment variable overrides.

use serial_test::serial;
use singsync_common::config::{load_toml_config, TomlConfig};
use singsync_common::Error;
use tempfile::TempDir;

#[test]
fn test_load_full_toml_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("singsync.toml");
    std::fs::write(
        &path,
        r#"
        port = 9100
        global_timeout_secs = 8
        merge_priority = ["acoustid", "whisper_genius"]

        [logging]
        level = "debug"

        [engines.acoustid]
        enabled = false
        api_key = "toml-key"

        [engines.whisper_genius]
        language = "it"

        [genius]
        api_token = "genius-token"
        max_results = 3
        "#,
    )
    .unwrap();

    let config = load_toml_config(&path).unwrap();

    assert_eq!(config.port, 9100);
    assert_eq!(config.global_timeout_secs, 8);
    assert_eq!(config.merge_priority, vec!["acoustid", "whisper_genius"]);
    assert_eq!(config.logging.level, "debug");
    assert!(!config.engines.acoustid.enabled);
    assert_eq!(config.engines.acoustid.api_key.as_deref(), Some("toml-key"));
    assert_eq!(config.engines.whisper_genius.language.as_deref(), Some("it"));
    assert_eq!(config.genius.max_results, 3);
}

#[test]
fn test_explicit_missing_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let result = TomlConfig::load(Some(&missing));
    assert!(result.is_err(), "Explicit config path must exist");
}

#[test]
fn test_malformed_toml_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "port = \"not a number\"").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("Parse TOML failed"));
}

#[test]
#[serial]
fn test_process_env_overrides_toml() {
    std::env::set_var("ACOUSTID_API_KEY", "env-key");
    std::env::set_var("ENABLE_FEATURES", "1");

    let mut config = TomlConfig::default();
    config.engines.acoustid.api_key = Some("toml-key".to_string());
    config.apply_env_overrides();

    std::env::remove_var("ACOUSTID_API_KEY");
    std::env::remove_var("ENABLE_FEATURES");

    assert_eq!(config.engines.acoustid.api_key.as_deref(), Some("env-key"));
    assert!(config.engines.features.enabled);
}
