use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use clawhub_config::GeneratedConfig;
use clawhub_domain::{
    BotInstance, ConnectionStatus, DeploymentTargetRecord, DoctorCheck, GatewayConnection,
    InstanceStatus, OpenClawProfile,
};
use clawhub_gateway::{Gateway, GatewayEndpoint, GatewayError, RetryPolicy};
use clawhub_store::{AuditEvent, StateStore};
use clawhub_target::{
    DeploymentTarget, InfraStatus, InstallOptions, LogOptions, LogStream, ResourceSpec,
    ResourceUpdateOutcome, TargetError, TargetRegistry,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::events::{LogSource, ProvisioningEvents, StepState};
use crate::report::{LifecycleStatus, UpdateOutcome};

/// Provisioning step ids, in execution order. Dashboards key progress off
/// these.
const STEP_INSTALL: &str = "install";
const STEP_CONFIGURE: &str = "configure";
const STEP_START: &str = "start";
const STEP_ENDPOINT: &str = "endpoint";
const STEP_CONNECT: &str = "connect";
const STEP_VERIFY: &str = "verify";
const ALL_STEPS: &[&str] = &[
    STEP_INSTALL,
    STEP_CONFIGURE,
    STEP_START,
    STEP_ENDPOINT,
    STEP_CONNECT,
    STEP_VERIFY,
];

/// Translates high-level lifecycle operations into deployment-target calls
/// plus agent-protocol calls.
pub struct LifecycleManager {
    store: Arc<dyn StateStore>,
    registry: Arc<TargetRegistry>,
    gateway: Arc<dyn Gateway>,
    events: Arc<dyn ProvisioningEvents>,
    retry: RetryPolicy,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<TargetRegistry>,
        gateway: Arc<dyn Gateway>,
        events: Arc<dyn ProvisioningEvents>,
    ) -> Self {
        Self {
            store,
            registry,
            gateway,
            events,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the connect retry policy (tests use short delays).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn load_target_record(
        &self,
        instance: &BotInstance,
    ) -> Result<Option<DeploymentTargetRecord>, ReconcileError> {
        match &instance.deployment_target_id {
            Some(id) => Ok(self.store.get_deployment_target(id).await?),
            None => Ok(None),
        }
    }

    /// Build the deployment target for this instance, with progress log
    /// lines wired through to the event bus.
    async fn resolve_target(
        &self,
        instance: &BotInstance,
        step: &Arc<std::sync::Mutex<&'static str>>,
    ) -> Result<Box<dyn DeploymentTarget>, ReconcileError> {
        let record = self.load_target_record(instance).await?;
        let target = self.registry.target_for(instance, record.as_ref()).await?;

        let events = self.events.clone();
        let instance_id = instance.id.clone();
        let step = step.clone();
        target.set_log_callback(Arc::new(move |line, stream| {
            let source = match stream {
                LogStream::Stdout => LogSource::Stdout,
                LogStream::Stderr => LogSource::Stderr,
            };
            let current = step.lock().map(|s| *s).unwrap_or("install");
            events.emit_log(&instance_id, current, source, line);
        }));
        Ok(target)
    }

    fn step_enter(&self, instance: &BotInstance, step: &str) {
        self.events
            .update_step(&instance.id, step, StepState::InProgress, None);
    }

    fn step_done(&self, instance: &BotInstance, step: &str) {
        self.events
            .update_step(&instance.id, step, StepState::Completed, None);
    }

    fn step_failed(&self, instance: &BotInstance, step: &str, message: &str) {
        self.events
            .update_step(&instance.id, step, StepState::Error, Some(message));
    }

    /// Full first-boot path: install → configure → start → endpoint →
    /// gateway connect (exponential backoff) → agent health, then persist
    /// the connection and profile records.
    pub async fn provision(
        &self,
        instance: &BotInstance,
        generated: &GeneratedConfig,
    ) -> Result<(), ReconcileError> {
        self.events
            .start_provisioning(&instance.id, instance.deployment_type);
        for step in ALL_STEPS {
            self.events
                .update_step(&instance.id, step, StepState::Pending, None);
        }

        let current_step = Arc::new(std::sync::Mutex::new(STEP_INSTALL));
        let target = self.resolve_target(instance, &current_step).await?;

        let result = self
            .provision_steps(instance, generated, target.as_ref(), &current_step)
            .await;
        match &result {
            Ok(()) => self.events.complete_provisioning(&instance.id),
            Err(e) => self.events.fail_provisioning(&instance.id, &e.to_string()),
        }
        result
    }

    async fn provision_steps(
        &self,
        instance: &BotInstance,
        generated: &GeneratedConfig,
        target: &dyn DeploymentTarget,
        current_step: &Arc<std::sync::Mutex<&'static str>>,
    ) -> Result<(), ReconcileError> {
        let set_step = |name: &'static str| {
            if let Ok(mut guard) = current_step.lock() {
                *guard = name;
            }
        };

        // install
        set_step(STEP_INSTALL);
        self.step_enter(instance, STEP_INSTALL);
        let install = target
            .install(&InstallOptions {
                profile_name: instance.profile_name.clone(),
                version: instance.openclaw_version.clone(),
                port: instance.gateway_port,
                env_vars: HashMap::new(),
                auth_token: generated.auth_token.clone(),
            })
            .await
            .map_err(|e| {
                self.step_failed(instance, STEP_INSTALL, &e.to_string());
                ReconcileError::ProvisionFailed(e.to_string())
            })?;
        self.step_done(instance, STEP_INSTALL);
        debug!(instance_id = %instance.id, instance_ref = %install.instance_ref, "installed");

        // configure
        set_step(STEP_CONFIGURE);
        self.step_enter(instance, STEP_CONFIGURE);
        target
            .configure(
                &instance.profile_name,
                instance.gateway_port,
                &generated.config,
                &HashMap::new(),
            )
            .await
            .map_err(|e| {
                self.step_failed(instance, STEP_CONFIGURE, &e.to_string());
                ReconcileError::ProvisionFailed(e.to_string())
            })?;
        self.step_done(instance, STEP_CONFIGURE);

        // start
        set_step(STEP_START);
        self.step_enter(instance, STEP_START);
        target.start().await.map_err(|e| {
            self.step_failed(instance, STEP_START, &e.to_string());
            ReconcileError::ProvisionFailed(e.to_string())
        })?;
        self.step_done(instance, STEP_START);

        // endpoint
        set_step(STEP_ENDPOINT);
        self.step_enter(instance, STEP_ENDPOINT);
        let endpoint = target.get_endpoint().await.map_err(|e| {
            self.step_failed(instance, STEP_ENDPOINT, &e.to_string());
            ReconcileError::ProvisionFailed(e.to_string())
        })?;
        self.step_done(instance, STEP_ENDPOINT);

        // gateway connect, with the full backoff schedule: cloud boots take
        // minutes.
        set_step(STEP_CONNECT);
        self.step_enter(instance, STEP_CONNECT);
        let gateway_endpoint = GatewayEndpoint {
            host: endpoint.host.clone(),
            port: endpoint.port,
            protocol: endpoint.protocol,
            auth_token: generated.auth_token.clone(),
        };
        self.gateway
            .connect(&instance.id, &gateway_endpoint, &self.retry)
            .await
            .map_err(|e| {
                self.step_failed(instance, STEP_CONNECT, &e.to_string());
                ReconcileError::GatewayUnreachable(e.to_string())
            })?;
        self.step_done(instance, STEP_CONNECT);

        // agent health
        set_step(STEP_VERIFY);
        self.step_enter(instance, STEP_VERIFY);
        let health = self.gateway.health(&instance.id).await.map_err(|e| {
            self.step_failed(instance, STEP_VERIFY, &e.to_string());
            ReconcileError::GatewayUnreachable(e.to_string())
        })?;
        if !health.ok {
            warn!(instance_id = %instance.id, "agent reports unhealthy after provision");
        }
        self.step_done(instance, STEP_VERIFY);

        // Best-effort remote hash for the connection record.
        let remote_hash = self
            .gateway
            .config_get(&instance.id)
            .await
            .ok()
            .map(|r| r.hash);

        self.store
            .upsert_connection(&GatewayConnection {
                instance_id: instance.id.clone(),
                host: endpoint.host,
                port: endpoint.port,
                protocol: endpoint.protocol,
                auth_token: generated.auth_token.clone().unwrap_or_default(),
                status: ConnectionStatus::Connected,
                config_hash: remote_hash,
                last_heartbeat: Some(Utc::now()),
            })
            .await?;
        self.store
            .upsert_profile(&OpenClawProfile::for_profile(
                &instance.id,
                &instance.profile_name,
                instance.gateway_port,
            ))
            .await?;
        self.store
            .append_event(&AuditEvent::InstanceProvisioned {
                id: Uuid::new_v4(),
                at: Utc::now(),
                instance_id: instance.id.clone(),
            })
            .await?;

        info!(instance_id = %instance.id, "provision complete");
        Ok(())
    }

    /// Push the desired config to a running agent.
    ///
    /// No-ops when the stored hash or the agent's reported hash already
    /// matches. On a successful apply the config is also persisted to the
    /// target's backing store so restarts don't revert it; that persistence
    /// is best-effort (the agent already holds the config in memory).
    pub async fn update(
        &self,
        instance: &BotInstance,
        generated: &GeneratedConfig,
    ) -> Result<UpdateOutcome, ReconcileError> {
        // The stored-hash comparison is purely local; the gateway is only
        // consulted when the stored fingerprint does not already match.
        // Stop and critical drift findings clear the stored hash, which is
        // what routes a dead or drifted agent past this short-circuit.
        if instance.config_hash.as_deref() == Some(generated.config_hash.as_str()) {
            return Ok(UpdateOutcome::NoOp("Config already up-to-date".to_string()));
        }

        let connection = self
            .store
            .get_connection(&instance.id)
            .await?
            .ok_or_else(|| {
                ReconcileError::GatewayUnreachable("no gateway connection recorded".to_string())
            })?;

        let endpoint = GatewayEndpoint {
            host: connection.host.clone(),
            port: connection.port,
            protocol: connection.protocol,
            auth_token: Some(connection.auth_token.clone()),
        };
        self.gateway
            .connect(&instance.id, &endpoint, &RetryPolicy::once())
            .await
            .map_err(|e| ReconcileError::GatewayUnreachable(e.to_string()))?;

        let remote = self
            .gateway
            .config_get(&instance.id)
            .await
            .map_err(|e| map_rpc_error("config.get", e))?;

        if remote.hash == generated.config_hash {
            // Stored hash lags the agent; the engine's terminal write
            // catches it up.
            debug!(instance_id = %instance.id, "agent already at desired config");
            return Ok(UpdateOutcome::NoOp(
                "Agent already at desired config".to_string(),
            ));
        }

        let raw = serde_json::to_string(&generated.config)
            .map_err(|e| ReconcileError::Internal(e.to_string()))?;
        let applied = self
            .gateway
            .config_apply(&instance.id, &raw, &remote.hash)
            .await
            .map_err(|e| map_rpc_error("config.apply", e))?;
        if !applied.applied() {
            let errors = applied
                .validation_errors
                .unwrap_or_default()
                .join("; ");
            return Err(ReconcileError::ConfigApplyRejected(if errors.is_empty() {
                "agent rejected the config".to_string()
            } else {
                errors
            }));
        }

        // Persist to the backing store so a restart boots the new config. A
        // failure here is a warning, not an update failure.
        let current_step = Arc::new(std::sync::Mutex::new(STEP_CONFIGURE));
        match self.resolve_target(instance, &current_step).await {
            Ok(target) => {
                if let Err(e) = target
                    .configure(
                        &instance.profile_name,
                        instance.gateway_port,
                        &generated.config,
                        &HashMap::new(),
                    )
                    .await
                {
                    warn!(
                        instance_id = %instance.id,
                        error = %e,
                        "applied config not persisted to backing store; restart may revert"
                    );
                }
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "backing-store persistence skipped");
            }
        }

        self.store
            .append_event(&AuditEvent::ConfigApplied {
                id: Uuid::new_v4(),
                at: Utc::now(),
                instance_id: instance.id.clone(),
                config_hash: generated.config_hash.clone(),
            })
            .await?;
        info!(instance_id = %instance.id, hash = %generated.config_hash, "config applied");
        Ok(UpdateOutcome::Applied)
    }

    pub async fn restart(&self, instance: &BotInstance) -> Result<(), ReconcileError> {
        let current_step = Arc::new(std::sync::Mutex::new(STEP_START));
        let target = self.resolve_target(instance, &current_step).await?;
        target.restart().await?;

        let mut updated = instance.clone();
        updated.restart_count += 1;
        updated.updated_at = Utc::now();
        self.store.upsert_instance(&updated).await?;
        Ok(())
    }

    /// Stop the compute and mark the instance stopped.
    pub async fn stop(&self, instance: &BotInstance) -> Result<(), ReconcileError> {
        let current_step = Arc::new(std::sync::Mutex::new(STEP_START));
        let target = self.resolve_target(instance, &current_step).await?;
        target.stop().await?;
        self.gateway.evict(&instance.id).await;
        if let Some(mut connection) = self.store.get_connection(&instance.id).await? {
            connection.status = ConnectionStatus::Disconnected;
            self.store.upsert_connection(&connection).await?;
        }

        let mut updated = instance.clone();
        updated.mark_stopped(Utc::now());
        self.store.upsert_instance(&updated).await?;
        self.store
            .append_event(&AuditEvent::InstanceStopped {
                id: Uuid::new_v4(),
                at: Utc::now(),
                instance_id: instance.id.clone(),
            })
            .await?;
        Ok(())
    }

    /// Tear everything down. Target errors are swallowed (the compute may
    /// already be gone); satellite records always get deleted; the row is
    /// left in Deleting for the caller to remove.
    pub async fn destroy(&self, instance: &BotInstance) -> Result<(), ReconcileError> {
        self.gateway.evict(&instance.id).await;

        let current_step = Arc::new(std::sync::Mutex::new(STEP_INSTALL));
        match self.resolve_target(instance, &current_step).await {
            Ok(target) => {
                if let Err(e) = target.destroy().await {
                    warn!(instance_id = %instance.id, error = %e, "target destroy failed; continuing teardown");
                }
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "no target for destroy; continuing teardown");
            }
        }

        self.store.delete_connection(&instance.id).await?;
        self.store.delete_profile(&instance.id).await?;
        self.store.delete_health_snapshot(&instance.id).await?;
        self.store.delete_keys(&instance.id).await?;

        let mut updated = instance.clone();
        updated.mark_deleting(Utc::now());
        self.store.upsert_instance(&updated).await?;
        self.store
            .append_event(&AuditEvent::InstanceDestroyed {
                id: Uuid::new_v4(),
                at: Utc::now(),
                instance_id: instance.id.clone(),
            })
            .await?;
        info!(instance_id = %instance.id, "destroyed");
        Ok(())
    }

    /// Infra state and agent state, queried concurrently.
    pub async fn get_status(&self, instance: &BotInstance) -> Result<LifecycleStatus, ReconcileError> {
        let current_step = Arc::new(std::sync::Mutex::new(STEP_VERIFY));
        let target = self.resolve_target(instance, &current_step).await?;

        let infra_fut = target.get_status();
        let agent_fut = async {
            let health = self.gateway.health(&instance.id).await.ok();
            let config = self.gateway.config_get(&instance.id).await.ok();
            (health, config)
        };
        let (infra, (health, config)) = tokio::join!(infra_fut, agent_fut);

        Ok(LifecycleStatus {
            infra: infra.unwrap_or(InfraStatus::Unknown),
            gateway_connected: health.is_some(),
            gateway_healthy: health.map(|h| h.ok),
            config_hash: config.map(|c| c.hash),
        })
    }

    /// Resize the instance's compute.
    pub async fn update_resources(
        &self,
        instance: &BotInstance,
        spec: &ResourceSpec,
    ) -> Result<ResourceUpdateOutcome, ReconcileError> {
        let current_step = Arc::new(std::sync::Mutex::new(STEP_INSTALL));
        let target = self.resolve_target(instance, &current_step).await?;
        match target.update_resources(spec).await {
            Ok(outcome) => Ok(outcome),
            Err(TargetError::ResourceUpdateUnsupported(t)) => {
                Err(ReconcileError::ResourceUpdateUnsupported(t))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recent log lines from the target's log backend.
    pub async fn get_logs(
        &self,
        instance: &BotInstance,
        tail: Option<u32>,
    ) -> Result<Vec<String>, ReconcileError> {
        let current_step = Arc::new(std::sync::Mutex::new(STEP_VERIFY));
        let target = self.resolve_target(instance, &current_step).await?;
        Ok(target.get_logs(&LogOptions { tail }).await?)
    }

    /// Diagnostic sweep: manifest, infra, gateway, config agreement.
    pub async fn doctor(&self, instance: &BotInstance) -> Vec<DoctorCheck> {
        let mut checks = Vec::new();

        checks.push(DoctorCheck {
            name: "manifest".to_string(),
            passed: instance.desired_manifest.is_some(),
            message: if instance.desired_manifest.is_some() {
                "desired manifest present".to_string()
            } else {
                "no desired manifest recorded".to_string()
            },
        });

        match self.get_status(instance).await {
            Ok(status) => {
                checks.push(DoctorCheck {
                    name: "infrastructure".to_string(),
                    passed: status.infra == InfraStatus::Running,
                    message: format!("infra state: {}", status.infra),
                });
                checks.push(DoctorCheck {
                    name: "gateway".to_string(),
                    passed: status.gateway_connected,
                    message: if status.gateway_connected {
                        "agent reachable".to_string()
                    } else {
                        "agent unreachable".to_string()
                    },
                });
                let hashes_agree = match (&status.config_hash, &instance.config_hash) {
                    (Some(remote), Some(stored)) => remote == stored,
                    _ => false,
                };
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    passed: hashes_agree,
                    message: if hashes_agree {
                        "agent config matches stored hash".to_string()
                    } else {
                        "agent config differs from stored hash".to_string()
                    },
                });
            }
            Err(e) => checks.push(DoctorCheck {
                name: "infrastructure".to_string(),
                passed: false,
                message: format!("status query failed: {}", e),
            }),
        }

        checks.push(DoctorCheck {
            name: "status".to_string(),
            passed: !matches!(instance.status, InstanceStatus::Error),
            message: format!("instance status: {}", instance.status),
        });
        checks
    }
}

/// A failed RPC on an established connection usually means the agent died
/// mid-conversation; classify by error shape.
fn map_rpc_error(method: &str, e: GatewayError) -> ReconcileError {
    match e {
        GatewayError::Rpc(msg) => ReconcileError::Internal(format!("{}: {}", method, msg)),
        other => ReconcileError::GatewayUnreachable(format!("{}: {}", method, other)),
    }
}
