//! Tests for config loading

use std::path::Path;

use serial_test::serial;
use yeoul::config::Config;
use yeoul::quota::Tier;

#[test]
fn test_config_file_exists() {
    let config_path = Path::new("config.toml");
    assert!(
        config_path.exists(),
        "config.toml should exist in project root"
    );
}

#[test]
fn test_config_toml_readable() {
    let content =
        std::fs::read_to_string("config.toml").expect("Should be able to read config.toml");

    assert!(
        content.contains("[quota]"),
        "config.toml should have [quota] section"
    );
    assert!(
        content.contains("[pipeline]"),
        "config.toml should have [pipeline] section"
    );
    assert!(
        content.contains("[provider]"),
        "config.toml should have [provider] section"
    );
    assert!(
        content.contains("[storage]"),
        "config.toml should have [storage] section"
    );
    assert!(
        content.contains("[logging]"),
        "config.toml should have [logging] section"
    );
}

#[test]
fn test_config_file_parses_and_validates() {
    let config = Config::from_file(Path::new("config.toml")).expect("config.toml should parse");

    assert_eq!(config.quota.tier, Tier::Free);
    assert_eq!(config.pipeline.chunk_seconds, 300);
    assert_eq!(config.pipeline.research_prompts.len(), 2);
    assert!(config.validate().is_ok());
}

// Reads process environment; keep serialized against other env-sensitive tests
#[test]
#[serial]
fn test_env_defaults_match_shipped_config() {
    let from_env = Config::from_env().unwrap();
    let from_file = Config::from_file(Path::new("config.toml")).unwrap();

    assert_eq!(from_env.quota.tier, from_file.quota.tier);
    assert_eq!(
        from_env.pipeline.chunk_seconds,
        from_file.pipeline.chunk_seconds
    );
    assert_eq!(
        from_env.housekeeping.daily_cleanup_time,
        from_file.housekeeping.daily_cleanup_time
    );
}
