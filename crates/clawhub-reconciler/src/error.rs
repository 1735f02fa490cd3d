use clawhub_domain::DeploymentType;
use thiserror::Error;

/// Failure taxonomy of the reconcile pipeline.
///
/// Every variant is recoverable by a subsequent reconcile; nothing here
/// leaves an instance in a state a corrected manifest cannot fix.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Manifest missing or failing schema validation. Fail fast.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Security audit returned blockers. Fail fast; blockers go verbatim
    /// into `last_error`.
    #[error("blocked by security audit: {0}")]
    SecurityBlocked(String),

    /// The target's install/configure/start sequence failed.
    #[error("provision failed: {0}")]
    ProvisionFailed(String),

    /// WebSocket connect exhausted its retries. For `update` this triggers
    /// the provision fallback; for drift it becomes a CRITICAL finding.
    #[error("gateway unreachable: {0}")]
    GatewayUnreachable(String),

    /// The agent rejected `config.apply` with validation errors. Recorded
    /// verbatim; never falls back to provision.
    #[error("config rejected by agent: {0}")]
    ConfigApplyRejected(String),

    #[error("resource updates are not supported by the {0} target")]
    ResourceUpdateUnsupported(DeploymentType),

    /// Scheduler-detected timeout in CREATING/RECONCILING.
    #[error("stuck in transient state: {0}")]
    StuckState(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("config error: {0}")]
    Config(#[from] clawhub_config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] clawhub_store::StoreError),

    #[error("target error: {0}")]
    Target(#[from] clawhub_target::TargetError),

    #[error("gateway error: {0}")]
    Gateway(#[from] clawhub_gateway::GatewayError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// A validation rejection never triggers the provision fallback; every
    /// other update failure does.
    pub fn is_validation_rejection(&self) -> bool {
        matches!(self, ReconcileError::ConfigApplyRejected(_))
    }
}
