use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clawhub_domain::{BotInstance, DeploymentTargetRecord, DeploymentType};

use crate::error::TargetError;
use crate::target::DeploymentTarget;

/// Builds per-instance [`DeploymentTarget`]s for one backend.
///
/// Providers hold operator-level state (credentials, HTTP clients, base
/// URLs); the targets they build carry instance-specific naming.
#[async_trait]
pub trait TargetProvider: Send + Sync + 'static {
    fn deployment_type(&self) -> DeploymentType;

    async fn target_for(
        &self,
        instance: &BotInstance,
        record: Option<&DeploymentTargetRecord>,
    ) -> Result<Box<dyn DeploymentTarget>, TargetError>;
}

/// Dispatches to the correct backend by an instance's `deployment_type`.
#[derive(Default)]
pub struct TargetRegistry {
    providers: HashMap<DeploymentType, Arc<dyn TargetProvider>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for its deployment type. Returns `&mut self` for
    /// chaining.
    pub fn register(&mut self, provider: Arc<dyn TargetProvider>) -> &mut Self {
        self.providers.insert(provider.deployment_type(), provider);
        self
    }

    pub fn provider_for(
        &self,
        deployment_type: DeploymentType,
    ) -> Result<Arc<dyn TargetProvider>, TargetError> {
        self.providers
            .get(&deployment_type)
            .cloned()
            .ok_or(TargetError::NotConfigured(deployment_type))
    }

    /// Build the target for this instance.
    pub async fn target_for(
        &self,
        instance: &BotInstance,
        record: Option<&DeploymentTargetRecord>,
    ) -> Result<Box<dyn DeploymentTarget>, TargetError> {
        self.provider_for(instance.deployment_type)?
            .target_for(instance, record)
            .await
    }

    pub fn registered_types(&self) -> Vec<DeploymentType> {
        self.providers.keys().copied().collect()
    }
}
