use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use clawhub_domain::{
    A2aKey, BotInstance, DeploymentTargetRecord, GatewayConnection, HealthState, InstanceId,
    InstanceStatus, OpenClawProfile,
};
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::events::AuditEvent;
use crate::store::{InstanceWithRelations, StateStore};

const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
const CONNECTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("connections");
const PROFILES: TableDefinition<&str, &[u8]> = TableDefinition::new("profiles");
const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment_targets");
const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("a2a_keys");
const HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("health_snapshots");
const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

fn ierr(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// Persistent state store backed by a redb database file.
///
/// All fleet state survives process restarts. Suitable for self-hosted
/// production use.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ierr)?;
        }
        let db = Database::create(path).map_err(ierr)?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(ierr)?;
            wtxn.open_table(INSTANCES).map_err(ierr)?;
            wtxn.open_table(CONNECTIONS).map_err(ierr)?;
            wtxn.open_table(PROFILES).map_err(ierr)?;
            wtxn.open_table(TARGETS).map_err(ierr)?;
            wtxn.open_table(KEYS).map_err(ierr)?;
            wtxn.open_table(HEALTH).map_err(ierr)?;
            wtxn.open_table(EVENTS).map_err(ierr)?;
            wtxn.open_table(META).map_err(ierr)?;
            wtxn.commit().map_err(ierr)?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn get_raw<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(ierr)?;
        let table = rtxn.open_table(table).map_err(ierr)?;
        match table.get(key).map_err(ierr)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn put_raw<T: serde::Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let wtxn = self.db.begin_write().map_err(ierr)?;
        {
            let mut table = wtxn.open_table(table).map_err(ierr)?;
            table.insert(key, bytes.as_slice()).map_err(ierr)?;
        }
        wtxn.commit().map_err(ierr)?;
        Ok(())
    }

    fn remove_raw(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(ierr)?;
        {
            let mut table = wtxn.open_table(table).map_err(ierr)?;
            table.remove(key).map_err(ierr)?;
        }
        wtxn.commit().map_err(ierr)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedbStore {
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<BotInstance>, StoreError> {
        self.get_raw(INSTANCES, id.as_str())
    }

    async fn get_instance_with_relations(
        &self,
        id: &InstanceId,
    ) -> Result<Option<InstanceWithRelations>, StoreError> {
        let Some(instance) = self.get_raw::<BotInstance>(INSTANCES, id.as_str())? else {
            return Ok(None);
        };
        Ok(Some(InstanceWithRelations {
            instance,
            connection: self.get_raw(CONNECTIONS, id.as_str())?,
            profile: self.get_raw(PROFILES, id.as_str())?,
        }))
    }

    async fn list_instances(&self) -> Result<Vec<BotInstance>, StoreError> {
        let rtxn = self.db.begin_read().map_err(ierr)?;
        let table = rtxn.open_table(INSTANCES).map_err(ierr)?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(ierr)? {
            let (_k, v) = entry.map_err(ierr)?;
            results.push(serde_json::from_slice(v.value())?);
        }
        Ok(results)
    }

    async fn list_instances_by_status(
        &self,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<BotInstance>, StoreError> {
        Ok(self
            .list_instances()
            .await?
            .into_iter()
            .filter(|i| statuses.contains(&i.status))
            .collect())
    }

    async fn upsert_instance(&self, instance: &BotInstance) -> Result<(), StoreError> {
        self.put_raw(INSTANCES, instance.id.as_str(), instance)
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.remove_raw(INSTANCES, id.as_str())
    }

    async fn get_connection(
        &self,
        id: &InstanceId,
    ) -> Result<Option<GatewayConnection>, StoreError> {
        self.get_raw(CONNECTIONS, id.as_str())
    }

    async fn upsert_connection(&self, conn: &GatewayConnection) -> Result<(), StoreError> {
        self.put_raw(CONNECTIONS, conn.instance_id.as_str(), conn)
    }

    async fn delete_connection(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.remove_raw(CONNECTIONS, id.as_str())
    }

    async fn get_profile(&self, id: &InstanceId) -> Result<Option<OpenClawProfile>, StoreError> {
        self.get_raw(PROFILES, id.as_str())
    }

    async fn upsert_profile(&self, profile: &OpenClawProfile) -> Result<(), StoreError> {
        self.put_raw(PROFILES, profile.instance_id.as_str(), profile)
    }

    async fn delete_profile(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.remove_raw(PROFILES, id.as_str())
    }

    async fn get_deployment_target(
        &self,
        target_id: &str,
    ) -> Result<Option<DeploymentTargetRecord>, StoreError> {
        self.get_raw(TARGETS, target_id)
    }

    async fn upsert_deployment_target(
        &self,
        target: &DeploymentTargetRecord,
    ) -> Result<(), StoreError> {
        self.put_raw(TARGETS, &target.id, target)
    }

    async fn list_keys(&self, id: &InstanceId) -> Result<Vec<A2aKey>, StoreError> {
        Ok(self
            .get_raw::<Vec<A2aKey>>(KEYS, id.as_str())?
            .unwrap_or_default())
    }

    async fn upsert_key(&self, key: &A2aKey) -> Result<(), StoreError> {
        let mut keys = self.list_keys(&key.instance_id).await?;
        match keys.iter_mut().find(|k| k.id == key.id) {
            Some(existing) => *existing = key.clone(),
            None => keys.push(key.clone()),
        }
        self.put_raw(KEYS, key.instance_id.as_str(), &keys)
    }

    async fn delete_keys(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.remove_raw(KEYS, id.as_str())
    }

    async fn get_health_snapshot(
        &self,
        id: &InstanceId,
    ) -> Result<Option<HealthState>, StoreError> {
        self.get_raw(HEALTH, id.as_str())
    }

    async fn put_health_snapshot(
        &self,
        id: &InstanceId,
        health: HealthState,
    ) -> Result<(), StoreError> {
        self.put_raw(HEALTH, id.as_str(), &health)
    }

    async fn delete_health_snapshot(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.remove_raw(HEALTH, id.as_str())
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(event)?;
        let wtxn = self.db.begin_write().map_err(ierr)?;
        {
            let mut meta = wtxn.open_table(META).map_err(ierr)?;
            let seq = meta
                .get("event_seq")
                .map_err(ierr)?
                .map(|g| g.value())
                .unwrap_or(0);
            meta.insert("event_seq", seq + 1).map_err(ierr)?;

            let mut events = wtxn.open_table(EVENTS).map_err(ierr)?;
            events.insert(seq, bytes.as_slice()).map_err(ierr)?;
        }
        wtxn.commit().map_err(ierr)?;
        Ok(())
    }

    async fn list_events(
        &self,
        instance_id: Option<&InstanceId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let rtxn = self.db.begin_read().map_err(ierr)?;
        let table = rtxn.open_table(EVENTS).map_err(ierr)?;
        let mut filtered = Vec::new();
        for entry in table.iter().map_err(ierr)? {
            let (_k, v) = entry.map_err(ierr)?;
            let ev: AuditEvent = serde_json::from_slice(v.value())?;
            if instance_id.map_or(true, |id| ev.instance_id() == id) {
                filtered.push(ev);
            }
        }
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

    fn open_store() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn instances_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            let inst = BotInstance::new("p", "p", DeploymentType::AwsEc2, Utc::now());
            store.upsert_instance(&inst).await.unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let got = store.get_instance(&InstanceId::new("p")).await.unwrap();
        assert_eq!(got.unwrap().deployment_type, DeploymentType::AwsEc2);
    }

    #[tokio::test]
    async fn event_order_is_preserved() {
        let (_dir, store) = open_store();
        for n in 0..5u32 {
            store
                .append_event(&AuditEvent::ReconcileFailed {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    instance_id: InstanceId::new("x"),
                    message: format!("fail {}", n),
                })
                .await
                .unwrap();
        }

        let events = store.list_events(None, 3).await.unwrap();
        assert_eq!(events.len(), 3);
        match &events[2] {
            AuditEvent::ReconcileFailed { message, .. } => assert_eq!(message, "fail 4"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn keys_round_trip() {
        let (_dir, store) = open_store();
        let id = InstanceId::new("k");
        let key = A2aKey {
            id: Uuid::new_v4(),
            instance_id: id.clone(),
            key_hash: "h".to_string(),
            key_prefix: "ck_ab".to_string(),
            label: "delegation".to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        store.upsert_key(&key).await.unwrap();
        assert_eq!(store.list_keys(&id).await.unwrap().len(), 1);

        store.delete_keys(&id).await.unwrap();
        assert!(store.list_keys(&id).await.unwrap().is_empty());
    }
}
