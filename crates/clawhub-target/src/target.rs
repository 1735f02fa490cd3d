use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clawhub_domain::GatewayProtocol;
use serde_json::Value;

use crate::error::TargetError;

/// Options for [`DeploymentTarget::install`].
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub profile_name: String,
    pub version: String,
    pub port: u16,
    pub env_vars: HashMap<String, String>,
    pub auth_token: Option<String>,
}

/// Result of a successful install.
#[derive(Debug, Clone)]
pub struct InstallResult {
    /// Opaque provider-side identifier for the compute (container id,
    /// EC2 instance id, GCE self-link, ARM resource id).
    pub instance_ref: String,
}

/// Infrastructure-level state of the compute, as distinct from the agent's
/// own health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraStatus {
    Running,
    Stopped,
    NotInstalled,
    Error(String),
    Unknown,
}

impl InfraStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InfraStatus::Running => "running",
            InfraStatus::Stopped => "stopped",
            InfraStatus::NotInstalled => "not-installed",
            InfraStatus::Error(_) => "error",
            InfraStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InfraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfraStatus::Error(msg) => write!(f, "error: {}", msg),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Where the agent is reachable once the compute is running.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: GatewayProtocol,
}

/// Requested compute resources for [`DeploymentTarget::update_resources`].
#[derive(Debug, Clone, Default)]
pub struct ResourceSpec {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

/// Outcome of a resource update.
#[derive(Debug, Clone)]
pub struct ResourceUpdateOutcome {
    pub restart_required: bool,
    pub estimated_downtime_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Callback receiving streamed progress lines during long operations.
pub type LogCallback = Arc<dyn Fn(&str, LogStream) + Send + Sync>;

/// Options for [`DeploymentTarget::get_logs`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Last N lines; provider default when unset.
    pub tail: Option<u32>,
}

/// One managed instance's compute backend.
///
/// A target is constructed per instance by a [`TargetProvider`]
/// (crate::registry) and is interchangeable across backends: the lifecycle
/// manager drives the same sequence against a local container and a cloud VM.
///
/// Every operation is idempotent. `destroy` must tolerate resources that are
/// already gone, and must leave shared infrastructure (VPC, subnet, firewall)
/// intact while any other managed instance still references it.
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    /// Idempotently ensure the compute and supporting infrastructure exist:
    /// image or machine image resolved, network path open, secret slot
    /// present, boot configuration in place.
    async fn install(&self, opts: &InstallOptions) -> Result<InstallResult, TargetError>;

    /// Persist the agent config in whatever storage bootstraps the agent on
    /// this backend (bind-mounted file, cloud secret store).
    async fn configure(
        &self,
        profile_name: &str,
        port: u16,
        config: &Value,
        env: &HashMap<String, String>,
    ) -> Result<(), TargetError>;

    /// Bring the compute to the running state; no-op if already running.
    async fn start(&self) -> Result<(), TargetError>;

    /// Transition to stopped; no-op if already stopped.
    async fn stop(&self) -> Result<(), TargetError>;

    /// Semantically stop-then-start.
    async fn restart(&self) -> Result<(), TargetError>;

    async fn get_status(&self) -> Result<InfraStatus, TargetError>;

    /// Resolve the reachable agent endpoint. May block on a provider lookup
    /// (e.g. querying the cloud API for a public IP).
    async fn get_endpoint(&self) -> Result<Endpoint, TargetError>;

    /// Delete every resource `install` created. Idempotent; missing
    /// resources are not errors.
    async fn destroy(&self) -> Result<(), TargetError>;

    /// Recent log lines from the target's log backend.
    async fn get_logs(&self, opts: &LogOptions) -> Result<Vec<String>, TargetError>;

    /// Resize the compute. Backends without this capability return the typed
    /// [`TargetError::ResourceUpdateUnsupported`] instead of failing
    /// unpredictably.
    async fn update_resources(
        &self,
        _spec: &ResourceSpec,
    ) -> Result<ResourceUpdateOutcome, TargetError>;

    /// Register a callback that receives per-line progress output during
    /// operations that stream (image pulls, cloud provisioning).
    fn set_log_callback(&self, cb: LogCallback);
}
