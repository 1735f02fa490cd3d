use clawhub_domain::DeploymentType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("configure failed: {0}")]
    ConfigureFailed(String),

    #[error("start failed: {0}")]
    StartFailed(String),

    #[error("stop failed: {0}")]
    StopFailed(String),

    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("log retrieval failed: {0}")]
    LogsUnavailable(String),

    #[error("resource updates are not supported by the {0} target")]
    ResourceUpdateUnsupported(DeploymentType),

    #[error("no target adapter registered for deployment type: {0}")]
    NotConfigured(DeploymentType),

    #[error("internal target error: {0}")]
    Internal(String),
}
