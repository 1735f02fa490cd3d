use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::canonical::canonical_hash;
use crate::error::ConfigError;
use crate::manifest::BotManifest;

/// Default port the agent's gateway listens on when the manifest is silent.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Keys the agent's strict schema rejects; dropped before hashing so they can
/// never cause spurious drift.
const DEPRECATED_KEYS: &[&str] = &["legacyEnabled"];

/// Optional AI-gateway provider settings, injected into every generated
/// config when enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiGatewaySettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Output of the config generator: the full on-wire agent config, its
/// canonical hash, and the effective gateway auth token (if token auth is in
/// play).
#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub config: Value,
    pub config_hash: String,
    pub auth_token: Option<String>,
}

/// Pure transform: `(manifest, ai-gateway settings, previously issued token)
/// → full agent config`.
///
/// `existing_token` is the token stored on the instance's gateway connection
/// from a prior reconcile. Reusing it keeps generation deterministic: an
/// unchanged manifest always hashes to the same value, so reconcile stays
/// idempotent and drift scans stay quiet.
pub fn generate_config(
    manifest: &BotManifest,
    ai_gateway: Option<&AiGatewaySettings>,
    existing_token: Option<&str>,
) -> Result<GeneratedConfig, ConfigError> {
    // Deep clone: the manifest's subtree is never mutated here.
    let mut config = manifest.openclaw_config.clone();
    if !config.is_object() {
        return Err(ConfigError::InvalidManifest(
            "spec.openclawConfig must be an object".to_string(),
        ));
    }

    hoist_sandbox(&mut config);
    apply_environment_defaults(manifest, &mut config);
    inject_ai_gateway(&mut config, ai_gateway);
    normalize_agent_keys(&mut config);
    let auth_token = enforce_secure_defaults(manifest, &mut config, existing_token);

    let config_hash = canonical_hash(&config);
    debug!(name = %manifest.metadata.name, hash = %config_hash, "generated agent config");

    Ok(GeneratedConfig {
        config,
        config_hash,
        auth_token,
    })
}

/// A root-level `sandbox` block belongs under `agents.defaults`. The nested
/// location wins if both are present.
fn hoist_sandbox(config: &mut Value) {
    let Some(root) = config.as_object_mut() else { return };
    let Some(sandbox) = root.remove("sandbox") else { return };

    let agents = root
        .entry("agents")
        .or_insert_with(|| json!({}));
    if let Some(defaults) = agents
        .as_object_mut()
        .map(|a| a.entry("defaults").or_insert_with(|| json!({})))
    {
        if let Some(d) = defaults.as_object_mut() {
            d.entry("sandbox").or_insert(sandbox);
        }
    }
}

fn apply_environment_defaults(manifest: &BotManifest, config: &mut Value) {
    let env = manifest.metadata.environment;

    let logging = ensure_object(config, "logging");
    logging
        .entry("level")
        .or_insert_with(|| json!(env.default_log_level()));

    let gateway = ensure_object(config, "gateway");
    gateway
        .entry("port")
        .or_insert_with(|| json!(DEFAULT_GATEWAY_PORT));
}

fn inject_ai_gateway(config: &mut Value, settings: Option<&AiGatewaySettings>) {
    let Some(s) = settings else { return };
    if !s.enabled {
        return;
    }
    let mut block = json!({ "baseUrl": s.base_url });
    if let Some(key) = &s.api_key {
        block["apiKey"] = json!(key);
    }
    if let Some(model) = &s.model {
        block["model"] = json!(model);
    }
    let providers = ensure_object(config, "providers");
    providers.insert("aiGateway".to_string(), block);
}

/// Normalize keys for the agent's strict schema: the listen-address alias
/// becomes the canonical `bind` field (the value must survive into the
/// hashed config), deprecated skill flags and redundant `enabled: true`
/// channel markers are dropped.
fn normalize_agent_keys(config: &mut Value) {
    if let Some(gateway) = config.get_mut("gateway").and_then(Value::as_object_mut) {
        if let Some(addr) = gateway.remove("listenAddress") {
            gateway.entry("bind").or_insert(addr);
        }
    }

    if let Some(skills) = config.get_mut("skills").and_then(Value::as_object_mut) {
        for key in DEPRECATED_KEYS {
            skills.remove(*key);
        }
    }

    if let Some(channels) = config.get_mut("channels").and_then(Value::as_object_mut) {
        for (_, channel) in channels.iter_mut() {
            if let Some(obj) = channel.as_object_mut() {
                if obj.get("enabled").and_then(Value::as_bool) == Some(true) {
                    obj.remove("enabled");
                }
            }
        }
    }
}

/// Returns the effective gateway auth token, when token auth applies.
fn enforce_secure_defaults(
    manifest: &BotManifest,
    config: &mut Value,
    existing_token: Option<&str>,
) -> Option<String> {
    let overrides = manifest.metadata.security_overrides;
    let hardened = manifest.metadata.environment.is_hardened();

    // 1. No auth at all and no explicit opt-out → issue (or reuse) a token.
    let auth_token = {
        let gateway = ensure_object(config, "gateway");
        let auth = gateway
            .entry("auth")
            .or_insert_with(|| json!({}));
        let auth_obj = auth.as_object_mut();

        match auth_obj {
            Some(auth) => {
                let has_token = auth.get("token").and_then(Value::as_str).is_some();
                let has_password = auth.get("password").and_then(Value::as_str).is_some();
                if has_token {
                    auth.get("token").and_then(Value::as_str).map(String::from)
                } else if has_password || overrides.allow_open_gateway {
                    None
                } else {
                    let token = existing_token
                        .map(String::from)
                        .unwrap_or_else(generate_auth_token);
                    auth.insert("token".to_string(), json!(token));
                    Some(token)
                }
            }
            None => None,
        }
    };

    // 2. Sandbox off in staging/prod is forced to "all" unless overridden.
    if hardened && !overrides.allow_sandbox_off {
        if let Some(mode) = config
            .pointer_mut("/agents/defaults/sandbox/mode")
            .filter(|m| m.as_str() == Some("off"))
        {
            *mode = json!("all");
        }
    }

    // 3. Elevated tools with an empty allow-list are disabled outright.
    if let Some(elevated) = config
        .pointer_mut("/tools/elevated")
        .and_then(Value::as_object_mut)
    {
        let enabled = elevated.get("enabled").and_then(Value::as_bool) == Some(true);
        let allow_empty = elevated
            .get("allow")
            .and_then(Value::as_array)
            .map_or(true, |a| a.is_empty());
        if enabled && allow_empty {
            elevated.insert("enabled".to_string(), json!(false));
        }
    }

    // 4. Log redaction defaults to redacting tool output.
    let logging = ensure_object(config, "logging");
    logging.entry("redact").or_insert_with(|| json!("tools"));

    auth_token
}

fn ensure_object<'a>(config: &'a mut Value, key: &str) -> &'a mut serde_json::Map<String, Value> {
    let entry = config
        .as_object_mut()
        .expect("config validated as object")
        .entry(key.to_string())
        .or_insert_with(|| json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    entry.as_object_mut().expect("just ensured object")
}

/// 32 random bytes, hex-encoded (64 chars), matching the agent's token
/// format.
pub fn generate_auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BotManifest;
    use serde_json::json;

    fn manifest(environment: &str, config: Value) -> BotManifest {
        BotManifest::parse(&json!({
            "apiVersion": "v2",
            "metadata": { "name": "t", "environment": environment },
            "spec": { "openclawConfig": config }
        }))
        .unwrap()
    }

    fn manifest_with_overrides(environment: &str, config: Value, overrides: Value) -> BotManifest {
        BotManifest::parse(&json!({
            "apiVersion": "v2",
            "metadata": {
                "name": "t",
                "environment": environment,
                "securityOverrides": overrides,
            },
            "spec": { "openclawConfig": config }
        }))
        .unwrap()
    }

    #[test]
    fn generates_token_when_gateway_open() {
        let m = manifest("dev", json!({}));
        let g = generate_config(&m, None, None).unwrap();
        let token = g.auth_token.expect("token generated");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(g.config["gateway"]["auth"]["token"], json!(token));
    }

    #[test]
    fn reuses_existing_token_for_deterministic_hash() {
        let m = manifest("dev", json!({}));
        let first = generate_config(&m, None, None).unwrap();
        let token = first.auth_token.clone().unwrap();
        let second = generate_config(&m, None, Some(&token)).unwrap();
        assert_eq!(first.config_hash, second.config_hash);
        assert_eq!(second.auth_token.as_deref(), Some(token.as_str()));
    }

    #[test]
    fn respects_allow_open_gateway() {
        let m = manifest_with_overrides("dev", json!({}), json!({ "allowOpenGateway": true }));
        let g = generate_config(&m, None, None).unwrap();
        assert!(g.auth_token.is_none());
        assert!(g.config["gateway"]["auth"].get("token").is_none());
    }

    #[test]
    fn keeps_manifest_supplied_token() {
        let m = manifest("dev", json!({ "gateway": { "auth": { "token": "tok-123" } } }));
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.auth_token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn password_auth_suppresses_token_generation() {
        let m = manifest("dev", json!({ "gateway": { "auth": { "password": "hunter2" } } }));
        let g = generate_config(&m, None, None).unwrap();
        assert!(g.auth_token.is_none());
    }

    #[test]
    fn prod_forces_sandbox_all() {
        let m = manifest("prod", json!({ "sandbox": { "mode": "off" } }));
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["agents"]["defaults"]["sandbox"]["mode"], "all");
    }

    #[test]
    fn sandbox_off_allowed_with_override() {
        let m = manifest_with_overrides(
            "prod",
            json!({ "sandbox": { "mode": "off" } }),
            json!({ "allowSandboxOff": true }),
        );
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["agents"]["defaults"]["sandbox"]["mode"], "off");
    }

    #[test]
    fn dev_keeps_sandbox_off() {
        let m = manifest("dev", json!({ "sandbox": { "mode": "off" } }));
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["agents"]["defaults"]["sandbox"]["mode"], "off");
    }

    #[test]
    fn elevated_tools_without_allow_list_disabled() {
        let m = manifest("dev", json!({ "tools": { "elevated": { "enabled": true } } }));
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["tools"]["elevated"]["enabled"], false);
    }

    #[test]
    fn elevated_tools_with_allow_list_kept() {
        let m = manifest(
            "dev",
            json!({ "tools": { "elevated": { "enabled": true, "allow": ["deploy"] } } }),
        );
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["tools"]["elevated"]["enabled"], true);
    }

    #[test]
    fn log_defaults_follow_environment() {
        for (env, level) in [("local", "debug"), ("dev", "debug"), ("staging", "info"), ("prod", "warn")] {
            let g = generate_config(&manifest(env, json!({})), None, None).unwrap();
            assert_eq!(g.config["logging"]["level"], level, "env {}", env);
            assert_eq!(g.config["logging"]["redact"], "tools");
        }
    }

    #[test]
    fn explicit_log_level_wins() {
        let m = manifest("prod", json!({ "logging": { "level": "trace" } }));
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["logging"]["level"], "trace");
    }

    #[test]
    fn gateway_port_defaults() {
        let g = generate_config(&manifest("dev", json!({})), None, None).unwrap();
        assert_eq!(g.config["gateway"]["port"], 18789);

        let g = generate_config(&manifest("dev", json!({ "gateway": { "port": 9000 } })), None, None)
            .unwrap();
        assert_eq!(g.config["gateway"]["port"], 9000);
    }

    #[test]
    fn renames_listen_address_and_strips_channel_flags() {
        let m = manifest(
            "dev",
            json!({
                "gateway": { "listenAddress": "127.0.0.1" },
                "skills": { "legacyEnabled": true, "search": {} },
                "channels": { "slack": { "enabled": true, "token": "x" }, "email": { "enabled": false } }
            }),
        );
        let g = generate_config(&m, None, None).unwrap();
        // The alias is renamed, not dropped: the address is part of the
        // hashed config and reaches the deployed agent.
        assert!(g.config["gateway"].get("listenAddress").is_none());
        assert_eq!(g.config["gateway"]["bind"], "127.0.0.1");
        assert!(g.config["skills"].get("legacyEnabled").is_none());
        assert!(g.config["skills"].get("search").is_some());
        assert!(g.config["channels"]["slack"].get("enabled").is_none());
        assert!(g.config["channels"]["slack"].get("token").is_some());
        // enabled:false is semantic (channel present but off); kept as-is.
        assert_eq!(g.config["channels"]["email"]["enabled"], false);
    }

    #[test]
    fn canonical_bind_field_wins_over_alias() {
        let m = manifest(
            "dev",
            json!({ "gateway": { "bind": "10.0.0.1", "listenAddress": "127.0.0.1" } }),
        );
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["gateway"]["bind"], "10.0.0.1");
        assert!(g.config["gateway"].get("listenAddress").is_none());
    }

    #[test]
    fn injects_ai_gateway_when_enabled() {
        let settings = AiGatewaySettings {
            enabled: true,
            base_url: "https://llm.internal".to_string(),
            api_key: Some("k".to_string()),
            model: None,
        };
        let g = generate_config(&manifest("dev", json!({})), Some(&settings), None).unwrap();
        assert_eq!(g.config["providers"]["aiGateway"]["baseUrl"], "https://llm.internal");
        assert_eq!(g.config["providers"]["aiGateway"]["apiKey"], "k");

        let disabled = AiGatewaySettings { enabled: false, ..settings };
        let g = generate_config(&manifest("dev", json!({})), Some(&disabled), None).unwrap();
        assert!(g.config.get("providers").is_none());
    }

    #[test]
    fn nested_sandbox_wins_over_root() {
        let m = manifest(
            "dev",
            json!({
                "sandbox": { "mode": "off" },
                "agents": { "defaults": { "sandbox": { "mode": "workspace" } } }
            }),
        );
        let g = generate_config(&m, None, None).unwrap();
        assert_eq!(g.config["agents"]["defaults"]["sandbox"]["mode"], "workspace");
        assert!(g.config.get("sandbox").is_none());
    }

    #[test]
    fn hash_reflects_enforced_defaults() {
        // The audit and the drift detector must both see the hardened config,
        // so the hash is computed after enforcement.
        let off = manifest("prod", json!({ "sandbox": { "mode": "off" } }));
        let all = manifest("prod", json!({ "sandbox": { "mode": "all" } }));
        let g_off = generate_config(&off, None, Some("t")).unwrap();
        let g_all = generate_config(&all, None, Some("t")).unwrap();
        assert_eq!(g_off.config_hash, g_all.config_hash);
    }
}
