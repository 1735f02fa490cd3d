pub mod aws;
pub mod azure;
pub mod error;
pub mod gcp;
pub mod local;
pub mod registry;
pub mod target;
pub mod transform;

pub use aws::{AwsEc2Provider, AwsProviderConfig};
pub use azure::{AzureProviderConfig, AzureVmProvider};
pub use error::TargetError;
pub use gcp::{GcpComputeProvider, GcpProviderConfig};
pub use local::LocalDockerProvider;
pub use registry::{TargetProvider, TargetRegistry};
pub use target::{
    DeploymentTarget, Endpoint, InfraStatus, InstallOptions, InstallResult, LogCallback,
    LogOptions, LogStream, ResourceSpec, ResourceUpdateOutcome,
};
pub use transform::{prepare_agent_config, TransformOverrides};
