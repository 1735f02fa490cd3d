use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use clawhub_config::AiGatewaySettings;
use clawhub_domain::{HealthState, InstanceId, InstanceStatus};
use clawhub_store::{AuditEvent, StateStore};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::SecurityAudit;
use crate::desired::compute_desired;
use crate::error::ReconcileError;
use crate::lifecycle::LifecycleManager;
use crate::preprocess::{ensure_delegation_api_key, PreprocessorChain, DELEGATION_KEY_LABEL};
use crate::report::{ReconcileResult, UpdateOutcome};

/// The reconciler engine: drives one instance from observed state to desired
/// state.
///
/// `reconcile` is idempotent and safe to run concurrently for distinct
/// instances. For the same instance callers serialize: the scheduler awaits
/// each reconcile, and the API rejects requests against an instance already
/// in `reconciling`.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    lifecycle: Arc<LifecycleManager>,
    chain: Arc<PreprocessorChain>,
    audit: Arc<dyn SecurityAudit>,
    ai_gateway: Option<AiGatewaySettings>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        lifecycle: Arc<LifecycleManager>,
        chain: Arc<PreprocessorChain>,
        audit: Arc<dyn SecurityAudit>,
        ai_gateway: Option<AiGatewaySettings>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            chain,
            audit,
            ai_gateway,
        }
    }

    /// Drive the instance to its desired state. Never panics across this
    /// boundary; every failure comes back as `ReconcileResult{success:false}`
    /// with the instance in `error`.
    pub async fn reconcile(&self, id: &InstanceId) -> ReconcileResult {
        let started = Instant::now();
        info!(instance_id = %id, "reconcile started");

        match self.reconcile_inner(id, &started).await {
            Ok(result) => {
                info!(
                    instance_id = %id,
                    duration_ms = result.duration_ms,
                    changes = result.changes.len(),
                    "reconcile succeeded"
                );
                result
            }
            Err(e) => self.record_failure(id, e, &started).await,
        }
    }

    async fn reconcile_inner(
        &self,
        id: &InstanceId,
        started: &Instant,
    ) -> Result<ReconcileResult, ReconcileError> {
        // 1. Load; validate the manifest before touching any state.
        let mut instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;
        if instance.status == InstanceStatus::Deleting {
            return Err(ReconcileError::Internal(
                "instance is being deleted".to_string(),
            ));
        }
        match &instance.desired_manifest {
            None => {
                return Err(ReconcileError::InvalidManifest(
                    "no desired manifest recorded".to_string(),
                ))
            }
            // Schema check happens before any state transition; the real
            // parse (post-preprocessing) runs in the shared pipeline below.
            Some(doc) => {
                clawhub_config::BotManifest::parse(doc)
                    .map_err(|e| ReconcileError::InvalidManifest(e.to_string()))?;
            }
        }

        // Classification uses the pre-reconcile markers.
        let is_new = instance.is_new();

        // 2. Mark in-flight.
        instance.mark_reconciling(Utc::now());
        self.store.upsert_instance(&instance).await?;
        self.store
            .append_event(&AuditEvent::ReconcileStarted {
                id: Uuid::new_v4(),
                at: Utc::now(),
                instance_id: id.clone(),
            })
            .await?;

        // 3–4. Preprocess and generate (manifest schema errors surface as
        // InvalidManifest from the shared pipeline).
        let desired = compute_desired(
            self.store.as_ref(),
            &self.chain,
            self.ai_gateway.as_ref(),
            &instance,
        )
        .await?;

        // 5. Security audit over the post-generation config, so enforced
        // defaults are what gets judged.
        let verdict = self
            .audit
            .audit(&desired.manifest, &desired.generated.config)
            .await;
        for warning in &verdict.warnings {
            warn!(instance_id = %id, rule = %warning.rule, "audit warning: {}", warning.message);
        }
        if !verdict.allowed() {
            return Err(ReconcileError::SecurityBlocked(verdict.blocker_summary()));
        }

        // 6–7. Provision or update, with the provision fallback for agents
        // that are unreachable or inconsistent.
        let mut changes = Vec::new();
        if is_new {
            debug!(instance_id = %id, "classified as new; provisioning");
            self.lifecycle.provision(&instance, &desired.generated).await?;
            changes.push(format!(
                "Provisioned instance ({})",
                instance.deployment_type
            ));
        } else {
            match self.lifecycle.update(&instance, &desired.generated).await {
                Ok(UpdateOutcome::NoOp(reason)) => changes.push(reason),
                Ok(UpdateOutcome::Applied) => {
                    changes.push(format!(
                        "Applied config {}",
                        short_hash(&desired.generated.config_hash)
                    ));
                }
                Err(e) if e.is_validation_rejection() => return Err(e),
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "update failed; falling back to provision");
                    changes.push(format!("Update failed ({}); re-provisioning", e));
                    self.lifecycle.provision(&instance, &desired.generated).await?;
                    changes.push("Re-provisioned instance".to_string());
                }
            }
        }

        // 8. Post-provision side effects that need a live agent; failures are
        // warnings, never pipeline failures.
        if desired
            .generated
            .config
            .pointer("/delegation/enabled")
            .and_then(Value::as_bool)
            == Some(true)
        {
            if let Err(e) =
                ensure_delegation_api_key(self.store.as_ref(), id, DELEGATION_KEY_LABEL).await
            {
                warn!(instance_id = %id, error = %e, "delegation key upkeep failed");
                changes.push(format!("Warning: delegation key upkeep failed: {}", e));
            }
        }

        // 9. Verify.
        let health = match self.lifecycle.get_status(&instance).await {
            Ok(status) if status.gateway_connected => {
                if status.gateway_healthy == Some(true) {
                    HealthState::Healthy
                } else {
                    HealthState::Degraded
                }
            }
            _ => HealthState::Unknown,
        };

        // 10. Terminal state.
        let now = Utc::now();
        instance.mark_running(now, desired.generated.config_hash.clone(), health);
        self.store.upsert_instance(&instance).await?;
        if let Some(mut connection) = self.store.get_connection(id).await? {
            connection.config_hash = Some(desired.generated.config_hash.clone());
            self.store.upsert_connection(&connection).await?;
        }
        self.store.put_health_snapshot(id, health).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.store
            .append_event(&AuditEvent::ReconcileCompleted {
                id: Uuid::new_v4(),
                at: now,
                instance_id: id.clone(),
                changes: changes.len(),
                duration_ms,
            })
            .await?;

        Ok(ReconcileResult {
            instance_id: id.clone(),
            success: true,
            message: "Reconcile complete".to_string(),
            changes,
            duration_ms,
        })
    }

    /// 11. Failure path: record, set error, return a structured result.
    /// Store errors here are logged, not propagated; nothing may escape the
    /// reconcile boundary.
    async fn record_failure(
        &self,
        id: &InstanceId,
        error: ReconcileError,
        started: &Instant,
    ) -> ReconcileResult {
        let message = error.to_string();
        warn!(instance_id = %id, error = %message, "reconcile failed");

        if !matches!(error, ReconcileError::InstanceNotFound(_)) {
            match self.store.get_instance(id).await {
                Ok(Some(mut instance)) => {
                    instance.mark_error(Utc::now(), message.clone());
                    if let Err(e) = self.store.upsert_instance(&instance).await {
                        warn!(instance_id = %id, error = %e, "failed to persist error state");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(instance_id = %id, error = %e, "failed to load instance for error state"),
            }
            let event = AuditEvent::ReconcileFailed {
                id: Uuid::new_v4(),
                at: Utc::now(),
                instance_id: id.clone(),
                message: message.clone(),
            };
            if let Err(e) = self.store.append_event(&event).await {
                warn!(instance_id = %id, error = %e, "failed to append failure event");
            }
        }

        ReconcileResult::failure(id.clone(), message, started.elapsed().as_millis() as u64)
    }

    // ── Operator entry points beyond reconcile ───────────────────────────────

    /// Stop the instance's compute and mark it stopped; a later reconcile
    /// resumes it.
    pub async fn stop(&self, id: &InstanceId) -> Result<(), ReconcileError> {
        let instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;
        self.lifecycle.stop(&instance).await
    }

    /// Destroy the instance's resources and remove the row. Monotonic: the
    /// row transitions through `deleting` and never comes back.
    pub async fn destroy(&self, id: &InstanceId) -> Result<(), ReconcileError> {
        let instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;
        self.lifecycle.destroy(&instance).await?;
        self.store.delete_instance(id).await?;
        Ok(())
    }

    /// Restart the compute without touching configuration.
    pub async fn restart(&self, id: &InstanceId) -> Result<(), ReconcileError> {
        let instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;
        self.lifecycle.restart(&instance).await
    }

    /// Resize the compute. Targets without the capability return the typed
    /// unsupported error.
    pub async fn update_resources(
        &self,
        id: &InstanceId,
        spec: &clawhub_target::ResourceSpec,
    ) -> Result<clawhub_target::ResourceUpdateOutcome, ReconcileError> {
        let instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;
        self.lifecycle.update_resources(&instance, spec).await
    }

    pub async fn doctor(
        &self,
        id: &InstanceId,
    ) -> Result<Vec<clawhub_domain::DoctorCheck>, ReconcileError> {
        let instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;
        Ok(self.lifecycle.doctor(&instance).await)
    }

    pub async fn logs(
        &self,
        id: &InstanceId,
        tail: Option<u32>,
    ) -> Result<Vec<String>, ReconcileError> {
        let instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;
        self.lifecycle.get_logs(&instance, tail).await
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..12.min(hash.len())]
}
