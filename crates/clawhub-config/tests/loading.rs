use std::path::Path;

use clawhub_config::{generate_config, BotManifest, Environment};

#[test]
fn load_valid_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/alpha.yml");
    let manifest = BotManifest::load(&path).expect("should load without error");
    assert_eq!(manifest.metadata.name, "alpha");
    assert_eq!(manifest.metadata.environment, Environment::Dev);
    assert_eq!(manifest.metadata.labels.get("team").map(String::as_str), Some("support"));
}

#[test]
fn load_legacy_fixture_wraps_envelope() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/legacy.yml");
    let manifest = BotManifest::load(&path).expect("should load without error");
    assert_eq!(manifest.api_version, "v2");
    assert_eq!(manifest.metadata.name, "default");
    assert_eq!(manifest.openclaw_config["gateway"]["port"], 9100);
}

#[test]
fn missing_file_returns_error() {
    let path = Path::new("/nonexistent/manifest.yml");
    assert!(BotManifest::load(path).is_err());
}

#[test]
fn fixture_generates_stable_hash() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/alpha.yml");
    let manifest = BotManifest::load(&path).unwrap();

    let first = generate_config(&manifest, None, None).expect("generate");
    let token = first.auth_token.clone().expect("auto token");
    let second = generate_config(&manifest, None, Some(&token)).expect("generate");

    assert_eq!(first.config_hash, second.config_hash);
    assert_eq!(first.config_hash.len(), 64);
    // The slack channel's enabled flag is presence-only and must not reach
    // the agent.
    assert!(first.config["channels"]["slack"].get("enabled").is_none());
}
