use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound JSON-RPC frame. Requests are correlated to responses by `id`.
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// Inbound JSON-RPC frame.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    pub code: Option<i64>,
    pub message: String,
}

// ── Typed method results (§ agent protocol) ──────────────────────────────────

/// `config.get` — the agent's current config and its canonical hash,
/// computed agent-side with the same sorted-key SHA-256 rule the generator
/// uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigGetResult {
    pub hash: String,
    pub config: Value,
}

/// `config.apply` parameters. `base_hash` must equal the agent's current hash
/// or the apply is rejected (optimistic concurrency).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigApplyParams {
    pub raw: String,
    pub base_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigApplyResult {
    pub ok: bool,
    pub success: Option<bool>,
    pub validation_errors: Option<Vec<String>>,
}

impl ConfigApplyResult {
    /// Apply succeeded when `ok` and, if present, `success` agree.
    pub fn applied(&self) -> bool {
        self.ok && self.success.unwrap_or(true)
    }
}

/// `health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResult {
    pub ok: bool,
    #[serde(default)]
    pub uptime: f64,
}

/// `status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub state: String,
    pub config_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_jsonrpc_shape() {
        let req = RpcRequest::new(7, "config.get", None);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "config.get");
        assert!(v.get("params").is_none());
    }

    #[test]
    fn apply_params_use_camel_case() {
        let params = ConfigApplyParams {
            raw: "{}".to_string(),
            base_hash: "abc".to_string(),
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["baseHash"], "abc");
    }

    #[test]
    fn apply_result_success_defaults_to_ok() {
        let r: ConfigApplyResult =
            serde_json::from_value(json!({ "ok": true })).unwrap();
        assert!(r.applied());

        let r: ConfigApplyResult =
            serde_json::from_value(json!({ "ok": true, "success": false })).unwrap();
        assert!(!r.applied());
    }

    #[test]
    fn status_tolerates_missing_hash() {
        let r: StatusResult = serde_json::from_value(json!({ "state": "starting" })).unwrap();
        assert_eq!(r.state, "starting");
        assert!(r.config_hash.is_none());
    }
}
