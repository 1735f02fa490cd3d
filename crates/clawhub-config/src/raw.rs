use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Raw serde representation of the v2 manifest envelope, before validation.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawManifest {
    pub api_version: String,
    /// Defaults to "BotInstance" when absent.
    pub kind: Option<String>,
    pub metadata: RawMetadata,
    pub spec: RawSpec,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetadata {
    pub name: String,
    pub workspace: Option<String>,
    /// "local", "dev", "staging", or "prod".
    pub environment: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub deployment_target: Option<String>,
    pub security_overrides: Option<RawSecurityOverrides>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSecurityOverrides {
    #[serde(default)]
    pub allow_open_gateway: bool,
    #[serde(default)]
    pub allow_sandbox_off: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSpec {
    /// Opaque agent config subtree; validated against the agent's schema only
    /// at apply time.
    pub openclaw_config: Value,
}
