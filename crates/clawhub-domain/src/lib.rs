pub mod error;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::{validate_config_hash, DomainError};
pub use types::{
    A2aKey, BotInstance, ConnectionStatus, DeploymentTargetRecord, DeploymentType, DoctorCheck,
    DriftFinding, FindingSeverity, GatewayConnection, GatewayProtocol, HealthState, InstanceId,
    InstanceStatus, OpenClawProfile,
};
