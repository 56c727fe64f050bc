// Config file handling and environment overrides

use omxenc::config::{Config, START_DELAY_ENV};
use std::time::Duration;

#[test]
fn test_defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.defaults.buffer_count, 9);
    assert_eq!(config.defaults.log_level, "info");
    assert_eq!(config.timing.event_timeout_ms, 10_000);
    assert_eq!(config.timing.start_delay_us, 100_000);
}

#[test]
fn test_config_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.defaults.buffer_count = 4;
    config.defaults.component = "OMX.sim.other".to_string();
    config.timing.eos_drain_timeout_ms = 1_234;
    config.save_to(&path).unwrap();

    let loaded = Config::load_from(&path).unwrap();
    assert_eq!(loaded.defaults.buffer_count, 4);
    assert_eq!(loaded.defaults.component, "OMX.sim.other");
    assert_eq!(loaded.timing.eos_drain_timeout_ms, 1_234);
}

#[test]
fn test_malformed_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[timing\nevent_timeout_ms = ").unwrap();
    assert!(Config::load_from(&path).is_err());
}

#[test]
fn test_start_delay_env_overrides_config() {
    // Zero keeps every other session in this binary unaffected.
    unsafe { std::env::set_var(START_DELAY_ENV, "0") };
    let config = Config::default();
    assert_eq!(config.timing.start_delay(), Duration::ZERO);
}
