use clawhub_domain::{DriftFinding, HealthState, InstanceId};
use serde::{Deserialize, Serialize};

/// What a reconcile did, sufficient for an operator to reconstruct the run
/// without reading logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub instance_id: InstanceId,
    pub success: bool,
    pub message: String,
    /// Ordered change descriptions ("Provisioned instance", "Config already
    /// up-to-date", …).
    pub changes: Vec<String>,
    pub duration_ms: u64,
}

impl ReconcileResult {
    pub fn failure(instance_id: InstanceId, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            instance_id,
            success: false,
            message: message.into(),
            changes: Vec::new(),
            duration_ms,
        }
    }
}

/// How `update` concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing to do; the reason is surfaced as a change description.
    NoOp(String),
    /// `config.apply` succeeded.
    Applied,
}

/// One instance's drift check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub instance_id: InstanceId,
    pub findings: Vec<DriftFinding>,
    pub health: HealthState,
}

impl DriftReport {
    pub fn has_critical(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == clawhub_domain::FindingSeverity::Critical)
    }
}

/// Combined infra + agent view returned by the lifecycle manager's
/// `get_status`.
#[derive(Debug, Clone)]
pub struct LifecycleStatus {
    pub infra: clawhub_target::InfraStatus,
    pub gateway_connected: bool,
    pub gateway_healthy: Option<bool>,
    pub config_hash: Option<String>,
}
