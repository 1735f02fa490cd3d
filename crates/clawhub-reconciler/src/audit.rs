use async_trait::async_trait;
use clawhub_config::{BotManifest, Environment};
use serde_json::Value;

/// One security-audit finding.
#[derive(Debug, Clone)]
pub struct AuditFinding {
    pub rule: String,
    pub message: String,
}

/// The audit's verdict over a manifest plus its final generated config.
#[derive(Debug, Clone, Default)]
pub struct AuditVerdict {
    pub blockers: Vec<AuditFinding>,
    pub warnings: Vec<AuditFinding>,
}

impl AuditVerdict {
    pub fn allowed(&self) -> bool {
        self.blockers.is_empty()
    }

    pub fn blocker_summary(&self) -> String {
        self.blockers
            .iter()
            .map(|f| format!("[{}] {}", f.rule, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Security policy checked once per reconcile, against the *post-generation*
/// config so that enforced defaults are visible to the rules.
#[async_trait]
pub trait SecurityAudit: Send + Sync + 'static {
    async fn audit(&self, manifest: &BotManifest, config: &Value) -> AuditVerdict;
}

/// Built-in policy: blocks configurations that would expose an unauthenticated
/// or unsandboxed agent to production traffic.
#[derive(Debug, Default)]
pub struct PolicyAudit;

#[async_trait]
impl SecurityAudit for PolicyAudit {
    async fn audit(&self, manifest: &BotManifest, config: &Value) -> AuditVerdict {
        let mut verdict = AuditVerdict::default();
        let env = manifest.metadata.environment;
        let hardened = env.is_hardened();

        let has_auth = config
            .pointer("/gateway/auth/token")
            .and_then(Value::as_str)
            .is_some()
            || config
                .pointer("/gateway/auth/password")
                .and_then(Value::as_str)
                .is_some();
        if !has_auth {
            let finding = AuditFinding {
                rule: "open-gateway".to_string(),
                message: format!("gateway has no auth token or password (environment {})", env),
            };
            if hardened {
                verdict.blockers.push(finding);
            } else {
                verdict.warnings.push(finding);
            }
        }

        if hardened
            && config.pointer("/agents/defaults/sandbox/mode").and_then(Value::as_str)
                == Some("off")
        {
            // Reaching this state requires the explicit allowSandboxOff
            // override; surface it loudly but let the override stand.
            verdict.warnings.push(AuditFinding {
                rule: "sandbox-off".to_string(),
                message: "sandbox disabled via securityOverrides.allowSandboxOff".to_string(),
            });
        }

        let elevated_enabled =
            config.pointer("/tools/elevated/enabled").and_then(Value::as_bool) == Some(true);
        let wildcard_allow = config
            .pointer("/tools/elevated/allow")
            .and_then(Value::as_array)
            .map_or(false, |a| a.iter().any(|v| v.as_str() == Some("*")));
        if elevated_enabled && wildcard_allow {
            verdict.blockers.push(AuditFinding {
                rule: "elevated-wildcard".to_string(),
                message: "elevated tools must not use a wildcard allow-list".to_string(),
            });
        }

        if config.pointer("/logging/redact").and_then(Value::as_str) == Some("off")
            && env == Environment::Prod
        {
            verdict.warnings.push(AuditFinding {
                rule: "redaction-off".to_string(),
                message: "log redaction disabled in prod".to_string(),
            });
        }

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawhub_config::generate_config;
    use serde_json::json;

    fn manifest(env: &str, config: Value) -> BotManifest {
        BotManifest::parse(&json!({
            "apiVersion": "v2",
            "metadata": { "name": "t", "environment": env },
            "spec": { "openclawConfig": config }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn generated_config_passes_in_prod() {
        // The generator's secure defaults are what make a bare manifest
        // audit-clean: token injected, sandbox forced on.
        let m = manifest("prod", json!({ "sandbox": { "mode": "off" } }));
        let g = generate_config(&m, None, None).unwrap();
        let verdict = PolicyAudit.audit(&m, &g.config).await;
        assert!(verdict.allowed(), "blockers: {}", verdict.blocker_summary());
    }

    #[tokio::test]
    async fn missing_auth_blocks_in_prod_only() {
        let m = manifest("prod", json!({}));
        let config = json!({ "gateway": {} });
        let verdict = PolicyAudit.audit(&m, &config).await;
        assert!(!verdict.allowed());
        assert_eq!(verdict.blockers[0].rule, "open-gateway");

        let m = manifest("dev", json!({}));
        let verdict = PolicyAudit.audit(&m, &config).await;
        assert!(verdict.allowed());
        assert_eq!(verdict.warnings.len(), 1);
    }

    #[tokio::test]
    async fn wildcard_elevated_tools_block_everywhere() {
        let m = manifest("dev", json!({}));
        let config = json!({
            "gateway": { "auth": { "token": "t" } },
            "tools": { "elevated": { "enabled": true, "allow": ["*"] } }
        });
        let verdict = PolicyAudit.audit(&m, &config).await;
        assert!(!verdict.allowed());
        assert_eq!(verdict.blockers[0].rule, "elevated-wildcard");
    }

    #[tokio::test]
    async fn blocker_summary_concatenates_rules() {
        let m = manifest("prod", json!({}));
        let config = json!({
            "gateway": {},
            "tools": { "elevated": { "enabled": true, "allow": ["*"] } }
        });
        let verdict = PolicyAudit.audit(&m, &config).await;
        let summary = verdict.blocker_summary();
        assert!(summary.contains("[open-gateway]"));
        assert!(summary.contains("[elevated-wildcard]"));
    }
}
