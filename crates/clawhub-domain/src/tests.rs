use chrono::Utc;

use crate::error::validate_config_hash;
use crate::types::*;

fn instance() -> BotInstance {
    BotInstance::new("bot-1", "alpha", DeploymentType::LocalDocker, Utc::now())
}

#[test]
fn new_instance_is_pending_and_unknown() {
    let inst = instance();
    assert_eq!(inst.status, InstanceStatus::Pending);
    assert_eq!(inst.health, HealthState::Unknown);
    assert!(inst.is_new());
}

#[test]
fn mark_running_clears_error_state() {
    let mut inst = instance();
    inst.mark_error(Utc::now(), "boom");
    assert_eq!(inst.error_count, 1);
    assert_eq!(inst.status, InstanceStatus::Error);

    inst.mark_running(Utc::now(), "a".repeat(64), HealthState::Healthy);
    assert_eq!(inst.status, InstanceStatus::Running);
    assert!(inst.running_since.is_some());
    assert!(inst.last_error.is_none());
    assert_eq!(inst.error_count, 0);
    assert!(!inst.is_new());
}

#[test]
fn mark_reconciling_clears_running_since() {
    let mut inst = instance();
    inst.mark_running(Utc::now(), "a".repeat(64), HealthState::Healthy);
    inst.mark_reconciling(Utc::now());
    assert_eq!(inst.status, InstanceStatus::Reconciling);
    assert!(inst.running_since.is_none());
}

#[test]
fn mark_stopped_clears_runtime_fingerprint() {
    let mut inst = instance();
    inst.mark_running(Utc::now(), "a".repeat(64), HealthState::Healthy);
    inst.mark_stopped(Utc::now());
    assert_eq!(inst.status, InstanceStatus::Stopped);
    assert!(inst.running_since.is_none());
    assert!(inst.config_hash.is_none());
    // Still classified as existing: the resume path goes through update's
    // gateway probe and the provision fallback, not first-boot provision.
    assert!(!inst.is_new());
}

#[test]
fn error_count_accumulates() {
    let mut inst = instance();
    inst.mark_error(Utc::now(), "one");
    inst.mark_error(Utc::now(), "two");
    assert_eq!(inst.error_count, 2);
    assert_eq!(inst.last_error.as_deref(), Some("two"));
}

#[test]
fn creating_status_classifies_as_new() {
    let mut inst = instance();
    inst.status = InstanceStatus::Creating;
    // Even with a prior hash, Creating forces the new path.
    inst.config_hash = Some("a".repeat(64));
    assert!(inst.is_new());
}

#[test]
fn profile_layout_derives_from_name() {
    let p = OpenClawProfile::for_profile(&InstanceId::new("bot-1"), "alpha", 18789);
    assert_eq!(p.config_path, "/var/lib/openclaw/alpha/config.json");
    assert_eq!(p.state_dir, "/var/lib/openclaw/alpha/state");
    assert_eq!(p.workspace_dir, "/var/lib/openclaw/alpha/workspace");
}

#[test]
fn config_hash_validation() {
    assert!(validate_config_hash(&"a".repeat(64)).is_ok());
    assert!(validate_config_hash(&"0123456789abcdef".repeat(4)).is_ok());
    assert!(validate_config_hash("short").is_err());
    assert!(validate_config_hash(&"A".repeat(64)).is_err());
    assert!(validate_config_hash(&"g".repeat(64)).is_err());
}

#[test]
fn instance_serializes_camel_case() {
    let inst = instance();
    let v = serde_json::to_value(&inst).unwrap();
    assert!(v.get("configHash").is_some());
    assert!(v.get("deploymentType").is_some());
    assert!(v.get("lastReconcileAt").is_some());
    assert_eq!(v["deploymentType"], "local_docker");
}
