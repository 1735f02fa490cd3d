use clawhub_domain::DeploymentType;
use serde_json::{json, Value};

/// Agent config keys that never reach a deployed agent: internal markers and
/// fields the agent's strict schema rejects.
const DEPRECATED_SKILL_KEYS: &[&str] = &["legacyEnabled"];

/// Per-backend adjustments layered onto the shared transformation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOverrides {
    /// Containers must listen on all interfaces: loopback inside the
    /// container is unreachable from the host's bridge network.
    pub force_bind_all: bool,
}

impl TransformOverrides {
    /// The override set for a backend. Containers force the all-interfaces
    /// listen mode; VM backends keep the manifest's address.
    pub fn for_deployment(deployment_type: DeploymentType) -> Self {
        Self {
            force_bind_all: matches!(deployment_type, DeploymentType::LocalDocker),
        }
    }
}

/// The configuration transformation every adapter applies before deployment.
///
/// The input is never mutated; the returned value is a deep clone with:
/// 1. the listen-address alias renamed to the agent's canonical `bind` field,
/// 2. a root-level `sandbox` block relocated under `agents.defaults`,
/// 3. redundant `enabled: true` channel markers stripped,
/// 4. deprecated and internal-only keys dropped.
pub fn prepare_agent_config(config: &Value, overrides: TransformOverrides) -> Value {
    let mut out = config.clone();
    let Some(root) = out.as_object_mut() else { return out };

    // 1. listenAddress → bind
    if let Some(gateway) = root.get_mut("gateway").and_then(Value::as_object_mut) {
        if let Some(addr) = gateway.remove("listenAddress") {
            gateway.entry("bind").or_insert(addr);
        }
        if overrides.force_bind_all {
            gateway.insert("bind".to_string(), json!("0.0.0.0"));
        }
    }

    // 2. root sandbox → agents.defaults.sandbox (nested location wins)
    if let Some(sandbox) = root.remove("sandbox") {
        let agents = root.entry("agents").or_insert_with(|| json!({}));
        if let Some(agents) = agents.as_object_mut() {
            let defaults = agents.entry("defaults").or_insert_with(|| json!({}));
            if let Some(defaults) = defaults.as_object_mut() {
                defaults.entry("sandbox").or_insert(sandbox);
            }
        }
    }

    // 3. channel `enabled: true` is presence-only
    if let Some(channels) = root.get_mut("channels").and_then(Value::as_object_mut) {
        for (_, channel) in channels.iter_mut() {
            if let Some(obj) = channel.as_object_mut() {
                if obj.get("enabled").and_then(Value::as_bool) == Some(true) {
                    obj.remove("enabled");
                }
            }
        }
    }

    // 4. deprecated + internal-only keys
    if let Some(skills) = root.get_mut("skills").and_then(Value::as_object_mut) {
        for key in DEPRECATED_SKILL_KEYS {
            skills.remove(*key);
        }
    }
    let internal: Vec<String> = root
        .keys()
        .filter(|k| k.starts_with("x-clawhub-"))
        .cloned()
        .collect();
    for key in internal {
        root.remove(&key);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renames_listen_address_to_bind() {
        let config = json!({ "gateway": { "listenAddress": "127.0.0.1", "port": 18789 } });
        let out = prepare_agent_config(&config, TransformOverrides::default());
        assert_eq!(out["gateway"]["bind"], "127.0.0.1");
        assert!(out["gateway"].get("listenAddress").is_none());
    }

    #[test]
    fn container_override_forces_all_interfaces() {
        let config = json!({ "gateway": { "listenAddress": "127.0.0.1" } });
        let out = prepare_agent_config(&config, TransformOverrides { force_bind_all: true });
        assert_eq!(out["gateway"]["bind"], "0.0.0.0");
    }

    #[test]
    fn relocates_root_sandbox() {
        let config = json!({ "sandbox": { "mode": "all" } });
        let out = prepare_agent_config(&config, TransformOverrides::default());
        assert_eq!(out["agents"]["defaults"]["sandbox"]["mode"], "all");
        assert!(out.get("sandbox").is_none());
    }

    #[test]
    fn strips_channel_enabled_true_only() {
        let config = json!({
            "channels": {
                "slack": { "enabled": true, "token": "x" },
                "email": { "enabled": false }
            }
        });
        let out = prepare_agent_config(&config, TransformOverrides::default());
        assert!(out["channels"]["slack"].get("enabled").is_none());
        assert_eq!(out["channels"]["email"]["enabled"], false);
    }

    #[test]
    fn drops_internal_keys_and_deprecated_flags() {
        let config = json!({
            "x-clawhub-managed": true,
            "skills": { "legacyEnabled": true, "search": {} }
        });
        let out = prepare_agent_config(&config, TransformOverrides::default());
        assert!(out.get("x-clawhub-managed").is_none());
        assert!(out["skills"].get("legacyEnabled").is_none());
        assert!(out["skills"].get("search").is_some());
    }

    #[test]
    fn input_is_not_mutated() {
        let config = json!({ "sandbox": { "mode": "all" } });
        let _ = prepare_agent_config(&config, TransformOverrides::default());
        assert!(config.get("sandbox").is_some());
    }

    #[test]
    fn override_set_per_backend() {
        assert!(TransformOverrides::for_deployment(DeploymentType::LocalDocker).force_bind_all);
        for vm in [
            DeploymentType::AwsEc2,
            DeploymentType::GcpCompute,
            DeploymentType::AzureVm,
        ] {
            assert!(!TransformOverrides::for_deployment(vm).force_bind_all);
        }
    }

    #[test]
    fn transform_is_idempotent() {
        // The desired-config pipeline transforms before hashing; adapters
        // apply the same transformation again at configure time. The second
        // application must be a no-op or the delivered config would diverge
        // from the fingerprint.
        let config = json!({
            "gateway": { "listenAddress": "127.0.0.1" },
            "sandbox": { "mode": "all" },
            "channels": { "slack": { "enabled": true, "token": "x" } },
        });
        let overrides = TransformOverrides::for_deployment(DeploymentType::LocalDocker);
        let once = prepare_agent_config(&config, overrides);
        let twice = prepare_agent_config(&once, overrides);
        assert_eq!(once, twice);
    }
}
