use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawManifest, RawMetadata, RawSecurityOverrides, RawSpec};

// ── Environment ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Staging and prod get the hardened defaults.
    pub fn is_hardened(&self) -> bool {
        matches!(self, Environment::Staging | Environment::Prod)
    }

    /// Default agent log level for this environment.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Environment::Local | Environment::Dev => "debug",
            Environment::Staging => "info",
            Environment::Prod => "warn",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Environment::Local => "local",
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        };
        write!(f, "{}", s)
    }
}

// ── Manifest ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecurityOverrides {
    pub allow_open_gateway: bool,
    pub allow_sandbox_off: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub name: String,
    pub workspace: Option<String>,
    pub environment: Environment,
    pub labels: HashMap<String, String>,
    pub deployment_target: Option<String>,
    pub security_overrides: SecurityOverrides,
}

/// The validated manifest envelope: the declarative input to reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    /// Opaque agent config subtree. Preprocessors mutate this in place before
    /// generation so their output participates in the canonical hash.
    pub openclaw_config: Value,
}

impl BotManifest {
    /// Parse a manifest from its stored JSON form.
    ///
    /// Accepts the v2 envelope, or a legacy flat document (the agent config
    /// alone), which is wrapped into the envelope with default metadata.
    pub fn parse(doc: &Value) -> Result<Self, ConfigError> {
        let is_envelope = doc.get("apiVersion").is_some() && doc.get("spec").is_some();
        if is_envelope {
            let raw: RawManifest = serde_json::from_value(doc.clone()).map_err(|e| {
                ConfigError::InvalidManifest(format!("envelope does not match schema: {}", e))
            })?;
            Self::from_raw(raw)
        } else {
            debug!("wrapping legacy flat manifest into v2 envelope");
            if !doc.is_object() {
                return Err(ConfigError::InvalidManifest(
                    "manifest must be a JSON object".to_string(),
                ));
            }
            Self::from_raw(RawManifest {
                api_version: "v2".to_string(),
                kind: None,
                metadata: RawMetadata {
                    name: "default".to_string(),
                    workspace: None,
                    environment: None,
                    labels: HashMap::new(),
                    deployment_target: None,
                    security_overrides: None,
                },
                spec: RawSpec {
                    openclaw_config: doc.clone(),
                },
            })
        }
    }

    /// Load a manifest from a YAML file (CLI / fixture path).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let doc: Value =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?;
        Self::parse(&doc)
    }

    fn from_raw(raw: RawManifest) -> Result<Self, ConfigError> {
        match raw.api_version.as_str() {
            "v1" | "v2" => {}
            other => {
                return Err(ConfigError::InvalidManifest(format!(
                    "unsupported apiVersion '{}'",
                    other
                )))
            }
        }
        if raw.metadata.name.trim().is_empty() {
            return Err(ConfigError::InvalidManifest(
                "metadata.name must not be empty".to_string(),
            ));
        }
        if !raw.spec.openclaw_config.is_object() {
            return Err(ConfigError::InvalidManifest(
                "spec.openclawConfig must be an object".to_string(),
            ));
        }

        let environment = match raw.metadata.environment.as_deref() {
            None => Environment::default(),
            Some("local") => Environment::Local,
            Some("dev") => Environment::Dev,
            Some("staging") => Environment::Staging,
            Some("prod") => Environment::Prod,
            Some(other) => {
                return Err(ConfigError::InvalidManifest(format!(
                    "unknown environment '{}'",
                    other
                )))
            }
        };

        let overrides = raw
            .metadata
            .security_overrides
            .unwrap_or_default();

        Ok(Self {
            api_version: raw.api_version,
            kind: raw.kind.unwrap_or_else(|| "BotInstance".to_string()),
            metadata: ManifestMetadata {
                name: raw.metadata.name,
                workspace: raw.metadata.workspace,
                environment,
                labels: raw.metadata.labels,
                deployment_target: raw.metadata.deployment_target,
                security_overrides: SecurityOverrides {
                    allow_open_gateway: overrides.allow_open_gateway,
                    allow_sandbox_off: overrides.allow_sandbox_off,
                },
            },
            openclaw_config: raw.spec.openclaw_config,
        })
    }
}

impl From<RawSecurityOverrides> for SecurityOverrides {
    fn from(raw: RawSecurityOverrides) -> Self {
        Self {
            allow_open_gateway: raw.allow_open_gateway,
            allow_sandbox_off: raw.allow_sandbox_off,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_v2_envelope() {
        let doc = json!({
            "apiVersion": "v2",
            "metadata": { "name": "alpha", "environment": "dev" },
            "spec": { "openclawConfig": { "gateway": { "port": 18789 } } }
        });
        let m = BotManifest::parse(&doc).unwrap();
        assert_eq!(m.metadata.name, "alpha");
        assert_eq!(m.metadata.environment, Environment::Dev);
        assert_eq!(m.kind, "BotInstance");
        assert_eq!(m.openclaw_config["gateway"]["port"], 18789);
    }

    #[test]
    fn wraps_legacy_flat_manifest() {
        let doc = json!({ "gateway": { "port": 1234 } });
        let m = BotManifest::parse(&doc).unwrap();
        assert_eq!(m.api_version, "v2");
        assert_eq!(m.metadata.name, "default");
        assert_eq!(m.metadata.environment, Environment::Local);
        assert_eq!(m.openclaw_config["gateway"]["port"], 1234);
    }

    #[test]
    fn rejects_unknown_api_version() {
        let doc = json!({
            "apiVersion": "v9",
            "metadata": { "name": "x" },
            "spec": { "openclawConfig": {} }
        });
        assert!(BotManifest::parse(&doc).is_err());
    }

    #[test]
    fn rejects_empty_name() {
        let doc = json!({
            "apiVersion": "v2",
            "metadata": { "name": "  " },
            "spec": { "openclawConfig": {} }
        });
        assert!(BotManifest::parse(&doc).is_err());
    }

    #[test]
    fn rejects_non_object_config() {
        let doc = json!({
            "apiVersion": "v2",
            "metadata": { "name": "x" },
            "spec": { "openclawConfig": [1, 2, 3] }
        });
        assert!(BotManifest::parse(&doc).is_err());
    }

    #[test]
    fn rejects_unknown_environment() {
        let doc = json!({
            "apiVersion": "v2",
            "metadata": { "name": "x", "environment": "qa" },
            "spec": { "openclawConfig": {} }
        });
        assert!(BotManifest::parse(&doc).is_err());
    }

    #[test]
    fn security_overrides_default_to_false() {
        let doc = json!({
            "apiVersion": "v2",
            "metadata": { "name": "x" },
            "spec": { "openclawConfig": {} }
        });
        let m = BotManifest::parse(&doc).unwrap();
        assert!(!m.metadata.security_overrides.allow_open_gateway);
        assert!(!m.metadata.security_overrides.allow_sandbox_off);
    }
}
