use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clawhub_domain::{
    A2aKey, BotInstance, DeploymentTargetRecord, GatewayConnection, HealthState, InstanceId,
    InstanceStatus, OpenClawProfile,
};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::events::AuditEvent;
use crate::store::{InstanceWithRelations, StateStore};

#[derive(Debug, Default)]
struct Inner {
    instances: HashMap<InstanceId, BotInstance>,
    connections: HashMap<InstanceId, GatewayConnection>,
    profiles: HashMap<InstanceId, OpenClawProfile>,
    targets: HashMap<String, DeploymentTargetRecord>,
    keys: HashMap<InstanceId, Vec<A2aKey>>,
    health: HashMap<InstanceId, HealthState>,
    events: Vec<AuditEvent>,
}

/// In-memory implementation of [`StateStore`].
///
/// All data is lost on process exit. Suitable for tests and ephemeral
/// development servers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<BotInstance>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.instances.get(id).cloned())
    }

    async fn get_instance_with_relations(
        &self,
        id: &InstanceId,
    ) -> Result<Option<InstanceWithRelations>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.instances.get(id).cloned().map(|instance| InstanceWithRelations {
            instance,
            connection: guard.connections.get(id).cloned(),
            profile: guard.profiles.get(id).cloned(),
        }))
    }

    async fn list_instances(&self) -> Result<Vec<BotInstance>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.instances.values().cloned().collect())
    }

    async fn list_instances_by_status(
        &self,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<BotInstance>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .instances
            .values()
            .filter(|i| statuses.contains(&i.status))
            .cloned()
            .collect())
    }

    async fn upsert_instance(&self, instance: &BotInstance) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.instances.remove(id);
        Ok(())
    }

    async fn get_connection(
        &self,
        id: &InstanceId,
    ) -> Result<Option<GatewayConnection>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.connections.get(id).cloned())
    }

    async fn upsert_connection(&self, conn: &GatewayConnection) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.connections.insert(conn.instance_id.clone(), conn.clone());
        Ok(())
    }

    async fn delete_connection(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.connections.remove(id);
        Ok(())
    }

    async fn get_profile(&self, id: &InstanceId) -> Result<Option<OpenClawProfile>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.profiles.get(id).cloned())
    }

    async fn upsert_profile(&self, profile: &OpenClawProfile) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.profiles.insert(profile.instance_id.clone(), profile.clone());
        Ok(())
    }

    async fn delete_profile(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.profiles.remove(id);
        Ok(())
    }

    async fn get_deployment_target(
        &self,
        target_id: &str,
    ) -> Result<Option<DeploymentTargetRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.targets.get(target_id).cloned())
    }

    async fn upsert_deployment_target(
        &self,
        target: &DeploymentTargetRecord,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.targets.insert(target.id.clone(), target.clone());
        Ok(())
    }

    async fn list_keys(&self, id: &InstanceId) -> Result<Vec<A2aKey>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.keys.get(id).cloned().unwrap_or_default())
    }

    async fn upsert_key(&self, key: &A2aKey) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let keys = guard.keys.entry(key.instance_id.clone()).or_default();
        match keys.iter_mut().find(|k| k.id == key.id) {
            Some(existing) => *existing = key.clone(),
            None => keys.push(key.clone()),
        }
        Ok(())
    }

    async fn delete_keys(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.keys.remove(id);
        Ok(())
    }

    async fn get_health_snapshot(
        &self,
        id: &InstanceId,
    ) -> Result<Option<HealthState>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.health.get(id).copied())
    }

    async fn put_health_snapshot(
        &self,
        id: &InstanceId,
        health: HealthState,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.health.insert(id.clone(), health);
        Ok(())
    }

    async fn delete_health_snapshot(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.health.remove(id);
        Ok(())
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        instance_id: Option<&InstanceId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let guard = self.inner.read().await;
        let filtered: Vec<AuditEvent> = guard
            .events
            .iter()
            .filter(|ev| instance_id.map_or(true, |id| ev.instance_id() == id))
            .cloned()
            .collect();

        let start = filtered.len().saturating_sub(limit as usize);
        Ok(filtered[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clawhub_domain::DeploymentType;
    use uuid::Uuid;

    fn dummy_instance(id: &str) -> BotInstance {
        BotInstance::new(id, id, DeploymentType::LocalDocker, Utc::now())
    }

    #[tokio::test]
    async fn upsert_and_get() {
        let store = InMemoryStore::new();
        store.upsert_instance(&dummy_instance("test")).await.unwrap();

        let got = store.get_instance(&InstanceId::new("test")).await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().id.as_str(), "test");
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryStore::new();
        let mut a = dummy_instance("a");
        a.mark_running(Utc::now(), "h".repeat(64), HealthState::Healthy);
        let b = dummy_instance("b"); // stays Pending
        store.upsert_instance(&a).await.unwrap();
        store.upsert_instance(&b).await.unwrap();

        let running = store
            .list_instances_by_status(&[InstanceStatus::Running])
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id.as_str(), "a");

        let pending = store
            .list_instances_by_status(&[InstanceStatus::Pending, InstanceStatus::Creating])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.as_str(), "b");
    }

    #[tokio::test]
    async fn relations_round_trip() {
        let store = InMemoryStore::new();
        let id = InstanceId::new("rel");
        store.upsert_instance(&dummy_instance("rel")).await.unwrap();
        store
            .upsert_connection(&GatewayConnection {
                instance_id: id.clone(),
                host: "10.0.0.5".to_string(),
                port: 18789,
                protocol: Default::default(),
                auth_token: "tok".to_string(),
                status: clawhub_domain::ConnectionStatus::Connected,
                config_hash: None,
                last_heartbeat: None,
            })
            .await
            .unwrap();
        store
            .upsert_profile(&OpenClawProfile::for_profile(&id, "rel", 18789))
            .await
            .unwrap();

        let rel = store.get_instance_with_relations(&id).await.unwrap().unwrap();
        assert_eq!(rel.connection.unwrap().host, "10.0.0.5");
        assert_eq!(rel.profile.unwrap().profile_name, "rel");
    }

    #[tokio::test]
    async fn key_upsert_replaces_by_id() {
        let store = InMemoryStore::new();
        let id = InstanceId::new("k");
        let mut key = A2aKey {
            id: Uuid::new_v4(),
            instance_id: id.clone(),
            key_hash: "h".to_string(),
            key_prefix: "ck_ab".to_string(),
            label: "delegation".to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        store.upsert_key(&key).await.unwrap();

        key.is_active = false;
        store.upsert_key(&key).await.unwrap();

        let keys = store.list_keys(&id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(!keys[0].is_active);
    }

    #[tokio::test]
    async fn events_filtered_by_instance() {
        let store = InMemoryStore::new();
        for name in ["a", "b"] {
            store
                .append_event(&AuditEvent::InstanceProvisioned {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    instance_id: InstanceId::new(name),
                })
                .await
                .unwrap();
        }

        let all = store.list_events(None, 100).await.unwrap();
        assert_eq!(all.len(), 2);

        let for_a = store
            .list_events(Some(&InstanceId::new("a")), 100)
            .await
            .unwrap();
        assert_eq!(for_a.len(), 1);
    }

    #[tokio::test]
    async fn health_snapshot_round_trip() {
        let store = InMemoryStore::new();
        let id = InstanceId::new("h");
        assert!(store.get_health_snapshot(&id).await.unwrap().is_none());

        store.put_health_snapshot(&id, HealthState::Degraded).await.unwrap();
        assert_eq!(
            store.get_health_snapshot(&id).await.unwrap(),
            Some(HealthState::Degraded)
        );

        store.delete_health_snapshot(&id).await.unwrap();
        assert!(store.get_health_snapshot(&id).await.unwrap().is_none());
    }
}
