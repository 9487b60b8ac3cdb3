//! Config error-message and atomic-save integration tests.

use std::fs;
use std::path::PathBuf;

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use tether_core::{
    config::{self, Config, TransportConfig},
    paths, ConfigError, DeviceTag, OwnerId,
};

fn spool_config() -> Config {
    let mut cfg = Config::new(
        DeviceTag::from("phone"),
        TransportConfig::Spool {
            dir: PathBuf::from("/var/spool/tether"),
        },
    );
    cfg.owners = vec![OwnerId::from("P1"), OwnerId::from("P2")];
    cfg
}

#[test]
fn corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".tether");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("config.yaml"), b": : corrupt : yaml : !!!\n  - [unclosed").expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn unknown_transport_kind_is_a_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".tether/config.yaml")
        .write_str("device: phone\ntransport:\n  kind: carrier-pigeon\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

#[test]
fn invalid_values_are_rejected_on_load() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".tether/config.yaml")
        .write_str("device: phone\nbatch_size: 5000\ntransport:\n  kind: spool\n  dir: /tmp/x\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    assert!(err.to_string().contains("batch_size"));
}

#[test]
fn saved_config_is_readable_yaml_with_owners() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &spool_config()).expect("save");

    home.child(".tether/config.yaml")
        .assert(predicate::str::contains("device: phone"))
        .assert(predicate::str::contains("- P2"))
        .assert(predicate::str::contains("kind: spool"));
    assert_eq!(
        paths::config_path(home.path()),
        home.path().join(".tether").join("config.yaml")
    );
}

#[test]
fn second_save_replaces_first() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &spool_config()).expect("save");

    let mut updated = spool_config();
    updated.transport = TransportConfig::Http {
        endpoint: "https://collector.example/upload".to_string(),
    };
    config::save_at(home.path(), &updated).expect("save again");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.transport, updated.transport);
}
