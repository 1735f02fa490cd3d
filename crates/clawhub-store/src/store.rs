use async_trait::async_trait;
use clawhub_domain::{
    A2aKey, BotInstance, DeploymentTargetRecord, GatewayConnection, HealthState, InstanceId,
    InstanceStatus, OpenClawProfile,
};

use crate::error::StoreError;
use crate::events::AuditEvent;

/// An instance together with its per-instance satellite records.
#[derive(Debug, Clone)]
pub struct InstanceWithRelations {
    pub instance: BotInstance,
    pub connection: Option<GatewayConnection>,
    pub profile: Option<OpenClawProfile>,
}

/// Persistence contract consumed by the reconciler.
///
/// The reconciler holds no in-memory cache of instance state: every read and
/// write goes through this trait, so the `status` column can act as the
/// coarse-grained progress marker that stuck-state recovery inspects.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // ── Instances ────────────────────────────────────────────────────────────

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<BotInstance>, StoreError>;

    async fn get_instance_with_relations(
        &self,
        id: &InstanceId,
    ) -> Result<Option<InstanceWithRelations>, StoreError>;

    async fn list_instances(&self) -> Result<Vec<BotInstance>, StoreError>;

    async fn list_instances_by_status(
        &self,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<BotInstance>, StoreError>;

    async fn upsert_instance(&self, instance: &BotInstance) -> Result<(), StoreError>;

    async fn delete_instance(&self, id: &InstanceId) -> Result<(), StoreError>;

    // ── Gateway connections ──────────────────────────────────────────────────

    async fn get_connection(
        &self,
        id: &InstanceId,
    ) -> Result<Option<GatewayConnection>, StoreError>;

    async fn upsert_connection(&self, conn: &GatewayConnection) -> Result<(), StoreError>;

    async fn delete_connection(&self, id: &InstanceId) -> Result<(), StoreError>;

    // ── Profiles ─────────────────────────────────────────────────────────────

    async fn get_profile(&self, id: &InstanceId) -> Result<Option<OpenClawProfile>, StoreError>;

    async fn upsert_profile(&self, profile: &OpenClawProfile) -> Result<(), StoreError>;

    async fn delete_profile(&self, id: &InstanceId) -> Result<(), StoreError>;

    // ── Deployment targets ───────────────────────────────────────────────────

    async fn get_deployment_target(
        &self,
        target_id: &str,
    ) -> Result<Option<DeploymentTargetRecord>, StoreError>;

    async fn upsert_deployment_target(
        &self,
        target: &DeploymentTargetRecord,
    ) -> Result<(), StoreError>;

    // ── A2A keys ─────────────────────────────────────────────────────────────

    async fn list_keys(&self, id: &InstanceId) -> Result<Vec<A2aKey>, StoreError>;

    async fn upsert_key(&self, key: &A2aKey) -> Result<(), StoreError>;

    async fn delete_keys(&self, id: &InstanceId) -> Result<(), StoreError>;

    // ── Health snapshots ─────────────────────────────────────────────────────

    async fn get_health_snapshot(
        &self,
        id: &InstanceId,
    ) -> Result<Option<HealthState>, StoreError>;

    async fn put_health_snapshot(
        &self,
        id: &InstanceId,
        health: HealthState,
    ) -> Result<(), StoreError>;

    async fn delete_health_snapshot(&self, id: &InstanceId) -> Result<(), StoreError>;

    // ── Audit events ─────────────────────────────────────────────────────────

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError>;

    async fn list_events(
        &self,
        instance_id: Option<&InstanceId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError>;
}
