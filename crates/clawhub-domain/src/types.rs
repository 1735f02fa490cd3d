use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(s: impl Into<String>) -> Self {
        InstanceId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// The lifecycle state of a managed bot instance.
///
/// Transitions:
///   Creating | Pending → Reconciling → Running | Error
///   Running | Degraded | Error → Reconciling → Running | Error
///   Running → Stopped → Reconciling → Running
///   any → Deleting (terminal; followed by row removal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created with immediate provisioning requested; no reconcile yet.
    Creating,
    /// Created without provisioning; waiting for scheduler pickup.
    Pending,
    /// A reconcile pipeline is in flight.
    Reconciling,
    /// Last reconcile succeeded; the agent should be serving.
    Running,
    /// Agent reachable but reporting unhealthy or drifted.
    Degraded,
    /// Last reconcile failed; `last_error` is populated.
    Error,
    /// Explicitly stopped by an operator; resumed via reconcile.
    Stopped,
    /// Teardown in flight. Monotonic: never leaves this state.
    Deleting,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Pending => "pending",
            InstanceStatus::Reconciling => "reconciling",
            InstanceStatus::Running => "running",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Error => "error",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Deleting => "deleting",
        };
        write!(f, "{}", s)
    }
}

/// Rolled-up health as classified by the drift detector and the
/// post-provision verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Most recent drift scan produced zero findings.
    Healthy,
    /// Agent reachable; non-critical findings present.
    Degraded,
    /// Critical finding present or the agent reports unhealthy.
    Unhealthy,
    /// Agent unreachable, or no scan has run yet.
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Which deployment-target adapter manages an instance's compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    /// Container on the control plane's own Docker daemon.
    LocalDocker,
    /// EC2 virtual machine.
    AwsEc2,
    /// Compute Engine virtual machine.
    GcpCompute,
    /// Azure virtual machine.
    AzureVm,
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentType::LocalDocker => "local_docker",
            DeploymentType::AwsEc2 => "aws_ec2",
            DeploymentType::GcpCompute => "gcp_compute",
            DeploymentType::AzureVm => "azure_vm",
        };
        write!(f, "{}", s)
    }
}

/// Connection status of the persistent gateway record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Severity of a single drift finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FindingSeverity::Info => "info",
            FindingSeverity::Warning => "warning",
            FindingSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

// ── BotInstance ───────────────────────────────────────────────────────────────

/// The central entity: one managed bot instance.
///
/// The external API writes the initial row and `desired_manifest`; the
/// reconciler owns every subsequent mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotInstance {
    pub id: InstanceId,
    pub name: String,
    pub status: InstanceStatus,
    pub health: HealthState,
    /// Declarative source of truth for what the instance should run.
    pub desired_manifest: Option<Value>,
    /// Canonical hash of the most recently applied config (64 hex chars).
    pub config_hash: Option<String>,
    pub deployment_type: DeploymentType,
    /// Reference to a shared [`DeploymentTargetRecord`], if any.
    pub deployment_target_id: Option<String>,
    pub profile_name: String,
    pub gateway_port: u16,
    pub openclaw_version: String,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub restart_count: u32,
    pub running_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Provider-specific credentials and overrides, passed through opaquely.
    #[serde(default)]
    pub metadata: Value,
}

impl BotInstance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        deployment_type: DeploymentType,
        now: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        Self {
            id: InstanceId::new(id),
            profile_name: name.clone(),
            name,
            status: InstanceStatus::Pending,
            health: HealthState::Unknown,
            desired_manifest: None,
            config_hash: None,
            deployment_type,
            deployment_target_id: None,
            gateway_port: 18789,
            openclaw_version: "latest".to_string(),
            last_reconcile_at: None,
            last_health_check_at: None,
            last_error: None,
            error_count: 0,
            restart_count: 0,
            running_since: None,
            created_at: now,
            updated_at: now,
            metadata: Value::Null,
        }
    }

    /// Transition into the in-flight reconcile state.
    pub fn mark_reconciling(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Reconciling;
        self.running_since = None;
        self.updated_at = now;
    }

    /// Terminal success write: Running, hash stamped, error counters cleared.
    pub fn mark_running(&mut self, now: DateTime<Utc>, config_hash: String, health: HealthState) {
        self.status = InstanceStatus::Running;
        self.health = health;
        self.config_hash = Some(config_hash);
        self.running_since = Some(now);
        self.last_reconcile_at = Some(now);
        self.last_error = None;
        self.error_count = 0;
        self.updated_at = now;
    }

    /// Terminal failure write: Error, message recorded, counter bumped.
    pub fn mark_error(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        self.status = InstanceStatus::Error;
        self.running_since = None;
        self.last_error = Some(message.into());
        self.error_count += 1;
        self.updated_at = now;
    }

    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Stopped;
        self.running_since = None;
        // A stopped agent no longer serves the applied config; the next
        // reconcile re-establishes the fingerprint over the wire.
        self.config_hash = None;
        self.updated_at = now;
    }

    /// Destruction is monotonic: once Deleting, only deletion follows.
    pub fn mark_deleting(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Deleting;
        self.running_since = None;
        self.updated_at = now;
    }

    /// An instance is reconciled as *new* when it was just created or has
    /// never completed a reconcile (no marker from a prior pass).
    pub fn is_new(&self) -> bool {
        self.status == InstanceStatus::Creating
            || (self.last_reconcile_at.is_none() && self.config_hash.is_none())
    }
}

// ── GatewayConnection ─────────────────────────────────────────────────────────

/// Persistent record of the agent endpoint for one instance.
///
/// `config_hash` mirrors the agent's most recent `config.get` response at the
/// time of `last_heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConnection {
    pub instance_id: InstanceId,
    pub host: String,
    pub port: u16,
    pub protocol: GatewayProtocol,
    pub auth_token: String,
    pub status: ConnectionStatus,
    pub config_hash: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatewayProtocol {
    #[default]
    Ws,
    Wss,
}

impl std::fmt::Display for GatewayProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayProtocol::Ws => write!(f, "ws"),
            GatewayProtocol::Wss => write!(f, "wss"),
        }
    }
}

// ── OpenClawProfile ───────────────────────────────────────────────────────────

/// On-target filesystem layout for one instance's agent. Deleted on destroy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClawProfile {
    pub instance_id: InstanceId,
    pub profile_name: String,
    pub config_path: String,
    pub state_dir: String,
    pub workspace_dir: String,
    pub base_port: u16,
}

impl OpenClawProfile {
    /// Standard on-target layout derived from the profile name.
    pub fn for_profile(instance_id: &InstanceId, profile_name: &str, base_port: u16) -> Self {
        let root = format!("/var/lib/openclaw/{}", profile_name);
        Self {
            instance_id: instance_id.clone(),
            profile_name: profile_name.to_string(),
            config_path: format!("{}/config.json", root),
            state_dir: format!("{}/state", root),
            workspace_dir: format!("{}/workspace", root),
            base_port,
        }
    }
}

// ── DeploymentTargetRecord ────────────────────────────────────────────────────

/// Optional shared configuration for a target environment. Many instances may
/// reference one record; the record owns no cloud state of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTargetRecord {
    pub id: String,
    pub name: String,
    pub deployment_type: DeploymentType,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub network_id: Option<String>,
    pub subnet_id: Option<String>,
    /// Provider credentials and extra settings, passed through opaquely.
    #[serde(default)]
    pub credentials: Value,
}

// ── A2A keys ──────────────────────────────────────────────────────────────────

/// Per-instance credential authenticating one bot's calls to another.
///
/// Only the SHA-256 hash and a display prefix are stored; plaintext is
/// returned exactly once at generation. At most one key per (instance, label)
/// is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aKey {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub key_hash: String,
    pub key_prefix: String,
    pub label: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ── Transient diagnostic records ──────────────────────────────────────────────

/// One entry in a drift report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftFinding {
    pub instance_id: InstanceId,
    /// Which fingerprint or probe disagreed (`configHash`,
    /// `gatewayConnection`, `remoteConfigHash`, `health`, `state`).
    pub field: String,
    pub severity: FindingSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl DriftFinding {
    pub fn new(
        instance_id: &InstanceId,
        field: &str,
        severity: FindingSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.clone(),
            field: field.to_string(),
            severity,
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    pub fn with_values(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

/// Result of one diagnostic probe from the `doctor` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}
