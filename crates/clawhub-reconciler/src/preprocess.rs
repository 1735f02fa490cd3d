use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clawhub_config::BotManifest;
use clawhub_domain::{A2aKey, BotInstance, InstanceId};
use clawhub_store::{AuditEvent, StateStore};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ReconcileError;

/// Everything a preprocessor may consult while mutating a manifest.
pub struct PreprocessContext<'a> {
    pub instance: &'a BotInstance,
    pub store: &'a dyn StateStore,
}

/// A composable manifest transform, applied before config generation and
/// hashing so its output participates in drift detection.
#[async_trait]
pub trait Preprocessor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Lower runs first. Unspecified priority means 100.
    fn priority(&self) -> u32 {
        100
    }

    async fn apply(
        &self,
        ctx: &PreprocessContext<'_>,
        manifest: &mut BotManifest,
    ) -> Result<(), ReconcileError>;
}

/// Ordered chain of preprocessors. New transforms are added by registration;
/// the runner never changes.
#[derive(Default)]
pub struct PreprocessorChain {
    items: Vec<Arc<dyn Preprocessor>>,
}

impl PreprocessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain every reconciler runs.
    pub fn with_builtins() -> Self {
        let mut chain = Self::new();
        chain.register(Arc::new(VaultSkillInjector));
        chain.register(Arc::new(DelegationInjector));
        chain
    }

    pub fn register(&mut self, preprocessor: Arc<dyn Preprocessor>) -> &mut Self {
        self.items.push(preprocessor);
        // Stable sort: equal priorities keep registration order.
        self.items.sort_by_key(|p| p.priority());
        self
    }

    /// Run every preprocessor in priority order. A failing preprocessor is
    /// logged and skipped; the rest of the chain still runs.
    pub async fn run(&self, ctx: &PreprocessContext<'_>, manifest: &mut BotManifest) {
        for preprocessor in &self.items {
            if let Err(e) = preprocessor.apply(ctx, manifest).await {
                warn!(
                    preprocessor = preprocessor.name(),
                    instance_id = %ctx.instance.id,
                    error = %e,
                    "preprocessor failed; continuing chain"
                );
            } else {
                debug!(preprocessor = preprocessor.name(), "preprocessor applied");
            }
        }
    }

    pub fn names_in_order(&self) -> Vec<&'static str> {
        self.items.iter().map(|p| p.name()).collect()
    }
}

// ── Built-in: vault skill ─────────────────────────────────────────────────────

/// Every bot gets the vault skill so it can store secrets at runtime: skill
/// search path plus the tool permissions the skill needs.
pub struct VaultSkillInjector;

#[async_trait]
impl Preprocessor for VaultSkillInjector {
    fn name(&self) -> &'static str {
        "vault-skill"
    }

    fn priority(&self) -> u32 {
        40
    }

    async fn apply(
        &self,
        _ctx: &PreprocessContext<'_>,
        manifest: &mut BotManifest,
    ) -> Result<(), ReconcileError> {
        let config = &mut manifest.openclaw_config;
        let root = config.as_object_mut().ok_or_else(|| {
            ReconcileError::InvalidManifest("openclawConfig is not an object".to_string())
        })?;

        let skills = root.entry("skills").or_insert_with(|| json!({}));
        if let Some(skills) = skills.as_object_mut() {
            let search_paths = skills
                .entry("searchPaths")
                .or_insert_with(|| json!([]));
            if let Some(paths) = search_paths.as_array_mut() {
                let vault_path = json!("/usr/lib/openclaw/skills/vault");
                if !paths.contains(&vault_path) {
                    paths.push(vault_path);
                }
            }
        }

        let tools = root.entry("tools").or_insert_with(|| json!({}));
        if let Some(tools) = tools.as_object_mut() {
            let allow = tools.entry("allow").or_insert_with(|| json!([]));
            if let Some(allow) = allow.as_array_mut() {
                for perm in ["vault.store", "vault.retrieve"] {
                    let perm = json!(perm);
                    if !allow.contains(&perm) {
                        allow.push(perm);
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Built-in: cross-bot delegation ────────────────────────────────────────────

/// Label under which the delegation credential is stored.
pub const DELEGATION_KEY_LABEL: &str = "delegation";

/// When the owning bot has team members, inject the delegation settings and
/// make sure the delegation A2A key exists. Only stable values enter the
/// manifest (peer names, the key prefix): the canonical hash must not change
/// between runs with an unchanged team.
pub struct DelegationInjector;

#[async_trait]
impl Preprocessor for DelegationInjector {
    fn name(&self) -> &'static str {
        "delegation-config"
    }

    fn priority(&self) -> u32 {
        50
    }

    async fn apply(
        &self,
        ctx: &PreprocessContext<'_>,
        manifest: &mut BotManifest,
    ) -> Result<(), ReconcileError> {
        let members: Vec<String> = manifest
            .openclaw_config
            .pointer("/team/members")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|m| m.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if members.is_empty() {
            return Ok(());
        }

        let (key, _plaintext) =
            ensure_delegation_api_key(ctx.store, &ctx.instance.id, DELEGATION_KEY_LABEL).await?;

        let config = &mut manifest.openclaw_config;
        let root = config.as_object_mut().ok_or_else(|| {
            ReconcileError::InvalidManifest("openclawConfig is not an object".to_string())
        })?;
        root.insert(
            "delegation".to_string(),
            json!({
                "enabled": true,
                "peers": members,
                "keyPrefix": key.key_prefix,
            }),
        );
        Ok(())
    }
}

/// Idempotently ensure one active A2A key with `label` for the instance.
///
/// Returns the key record plus the plaintext, which is `Some` only on the
/// call that created the key: plaintext is never reconstructible afterwards.
/// Rotation is revoke-then-create, so at most one key per (instance, label)
/// is ever active.
pub async fn ensure_delegation_api_key(
    store: &dyn StateStore,
    instance_id: &InstanceId,
    label: &str,
) -> Result<(A2aKey, Option<String>), ReconcileError> {
    let keys = store.list_keys(instance_id).await?;
    if let Some(active) = keys.iter().find(|k| k.label == label && k.is_active) {
        return Ok((active.clone(), None));
    }

    // Revoke any stale inactive-marked duplicates first, then mint.
    for mut key in keys.into_iter().filter(|k| k.label == label) {
        key.is_active = false;
        store.upsert_key(&key).await?;
    }

    let plaintext = generate_key_plaintext();
    let key = A2aKey {
        id: Uuid::new_v4(),
        instance_id: instance_id.clone(),
        key_hash: sha256_hex(plaintext.as_bytes()),
        key_prefix: plaintext[..10.min(plaintext.len())].to_string(),
        label: label.to_string(),
        is_active: true,
        created_at: Utc::now(),
    };
    store.upsert_key(&key).await?;
    store
        .append_event(&AuditEvent::KeyRotated {
            id: Uuid::new_v4(),
            at: Utc::now(),
            instance_id: instance_id.clone(),
            label: label.to_string(),
        })
        .await?;
    Ok((key, Some(plaintext)))
}

/// Rotate the key for `label`: revoke the active one, mint a fresh one, and
/// return the new plaintext (the only time it is visible).
pub async fn rotate_delegation_api_key(
    store: &dyn StateStore,
    instance_id: &InstanceId,
    label: &str,
) -> Result<(A2aKey, String), ReconcileError> {
    for mut key in store
        .list_keys(instance_id)
        .await?
        .into_iter()
        .filter(|k| k.label == label && k.is_active)
    {
        key.is_active = false;
        store.upsert_key(&key).await?;
    }
    let (key, plaintext) = ensure_delegation_api_key(store, instance_id, label).await?;
    let plaintext = plaintext.ok_or_else(|| {
        ReconcileError::Internal("rotation did not mint a fresh key".to_string())
    })?;
    Ok((key, plaintext))
}

fn generate_key_plaintext() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("ck_{}", hex)
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawhub_domain::DeploymentType;
    use clawhub_store::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manifest(config: Value) -> BotManifest {
        BotManifest::parse(&json!({
            "apiVersion": "v2",
            "metadata": { "name": "t", "environment": "dev" },
            "spec": { "openclawConfig": config }
        }))
        .unwrap()
    }

    fn instance() -> BotInstance {
        BotInstance::new("bot-1", "alpha", DeploymentType::LocalDocker, Utc::now())
    }

    struct Recorder {
        name: &'static str,
        priority: u32,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Preprocessor for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        async fn apply(
            &self,
            _ctx: &PreprocessContext<'_>,
            _manifest: &mut BotManifest,
        ) -> Result<(), ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name);
            if self.fail {
                return Err(ReconcileError::Internal("simulated".to_string()));
            }
            Ok(())
        }
    }

    struct DefaultPriority {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Preprocessor for DefaultPriority {
        fn name(&self) -> &'static str {
            "default-priority"
        }
        async fn apply(
            &self,
            _ctx: &PreprocessContext<'_>,
            _manifest: &mut BotManifest,
        ) -> Result<(), ReconcileError> {
            self.order.lock().unwrap().push("default-priority");
            Ok(())
        }
    }

    #[tokio::test]
    async fn chain_runs_in_priority_order_and_default_is_100() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = PreprocessorChain::new();
        // Registered out of order on purpose.
        chain.register(Arc::new(DefaultPriority { order: order.clone() }));
        chain.register(Arc::new(Recorder {
            name: "fifty",
            priority: 50,
            order: order.clone(),
            fail: false,
            calls: calls.clone(),
        }));
        chain.register(Arc::new(Recorder {
            name: "forty",
            priority: 40,
            order: order.clone(),
            fail: false,
            calls: calls.clone(),
        }));

        let store = InMemoryStore::new();
        let inst = instance();
        let ctx = PreprocessContext { instance: &inst, store: &store };
        let mut m = manifest(json!({}));
        chain.run(&ctx, &mut m).await;

        assert_eq!(*order.lock().unwrap(), vec!["forty", "fifty", "default-priority"]);
    }

    #[tokio::test]
    async fn failing_preprocessor_does_not_abort_chain() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = PreprocessorChain::new();
        chain.register(Arc::new(Recorder {
            name: "boom",
            priority: 10,
            order: order.clone(),
            fail: true,
            calls: calls.clone(),
        }));
        chain.register(Arc::new(Recorder {
            name: "after",
            priority: 20,
            order: order.clone(),
            fail: false,
            calls: calls.clone(),
        }));

        let store = InMemoryStore::new();
        let inst = instance();
        let ctx = PreprocessContext { instance: &inst, store: &store };
        let mut m = manifest(json!({}));
        chain.run(&ctx, &mut m).await;

        assert_eq!(*order.lock().unwrap(), vec!["boom", "after"]);
    }

    #[tokio::test]
    async fn vault_injector_is_idempotent() {
        let store = InMemoryStore::new();
        let inst = instance();
        let ctx = PreprocessContext { instance: &inst, store: &store };
        let mut m = manifest(json!({}));

        VaultSkillInjector.apply(&ctx, &mut m).await.unwrap();
        let first = m.openclaw_config.clone();
        VaultSkillInjector.apply(&ctx, &mut m).await.unwrap();
        assert_eq!(first, m.openclaw_config, "second run must not duplicate entries");

        let paths = m.openclaw_config["skills"]["searchPaths"].as_array().unwrap();
        assert_eq!(paths.len(), 1);
        let allow = m.openclaw_config["tools"]["allow"].as_array().unwrap();
        assert!(allow.contains(&json!("vault.store")));
        assert!(allow.contains(&json!("vault.retrieve")));
    }

    #[tokio::test]
    async fn delegation_skipped_without_team() {
        let store = InMemoryStore::new();
        let inst = instance();
        let ctx = PreprocessContext { instance: &inst, store: &store };
        let mut m = manifest(json!({}));

        DelegationInjector.apply(&ctx, &mut m).await.unwrap();
        assert!(m.openclaw_config.get("delegation").is_none());
        assert!(store.list_keys(&inst.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delegation_injects_and_keeps_hash_stable() {
        let store = InMemoryStore::new();
        let inst = instance();
        let ctx = PreprocessContext { instance: &inst, store: &store };
        let config = json!({ "team": { "members": ["researcher", "coder"] } });

        let mut first = manifest(config.clone());
        DelegationInjector.apply(&ctx, &mut first).await.unwrap();
        let mut second = manifest(config);
        DelegationInjector.apply(&ctx, &mut second).await.unwrap();

        // Same active key both times, so the injected config is identical.
        assert_eq!(first.openclaw_config, second.openclaw_config);
        assert_eq!(first.openclaw_config["delegation"]["enabled"], true);
        assert_eq!(
            first.openclaw_config["delegation"]["peers"],
            json!(["researcher", "coder"])
        );
    }

    #[tokio::test]
    async fn ensure_key_is_at_most_one_active() {
        let store = InMemoryStore::new();
        let id = InstanceId::new("bot-1");

        let (k1, p1) = ensure_delegation_api_key(&store, &id, "delegation").await.unwrap();
        assert!(p1.is_some(), "first ensure mints plaintext");

        let (k2, p2) = ensure_delegation_api_key(&store, &id, "delegation").await.unwrap();
        assert!(p2.is_none(), "second ensure reuses the active key");
        assert_eq!(k1.id, k2.id);

        let active: Vec<_> = store
            .list_keys(&id)
            .await
            .unwrap()
            .into_iter()
            .filter(|k| k.label == "delegation" && k.is_active)
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn rotation_revokes_then_creates() {
        let store = InMemoryStore::new();
        let id = InstanceId::new("bot-1");

        let (old, _) = ensure_delegation_api_key(&store, &id, "delegation").await.unwrap();
        let (new, plaintext) = rotate_delegation_api_key(&store, &id, "delegation").await.unwrap();
        assert_ne!(old.id, new.id);
        assert!(plaintext.starts_with("ck_"));

        let keys = store.list_keys(&id).await.unwrap();
        let active: Vec<_> = keys.iter().filter(|k| k.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, new.id);
        assert_eq!(keys.len(), 2, "revoked key is retained for audit");
    }

    #[tokio::test]
    async fn key_prefix_matches_plaintext() {
        let store = InMemoryStore::new();
        let id = InstanceId::new("bot-1");
        let (key, plaintext) = ensure_delegation_api_key(&store, &id, "delegation").await.unwrap();
        let plaintext = plaintext.unwrap();
        assert!(plaintext.starts_with(&key.key_prefix));
        assert_eq!(key.key_hash, sha256_hex(plaintext.as_bytes()));
    }
}
