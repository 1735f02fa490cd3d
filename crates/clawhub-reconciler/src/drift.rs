use std::sync::Arc;

use chrono::Utc;
use clawhub_config::AiGatewaySettings;
use clawhub_domain::{
    ConnectionStatus, DriftFinding, FindingSeverity, HealthState, InstanceId, InstanceStatus,
};
use clawhub_gateway::{Gateway, GatewayEndpoint, RetryPolicy};
use clawhub_store::{AuditEvent, StateStore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::desired::compute_desired;
use crate::error::ReconcileError;
use crate::preprocess::PreprocessorChain;
use crate::report::DriftReport;

/// Compares three fingerprints per instance: the desired-config hash, the
/// stored hash, and the hash the agent is actually serving, plus agent
/// liveness and state.
pub struct DriftDetector {
    store: Arc<dyn StateStore>,
    gateway: Arc<dyn Gateway>,
    chain: Arc<PreprocessorChain>,
    ai_gateway: Option<AiGatewaySettings>,
}

impl DriftDetector {
    pub fn new(
        store: Arc<dyn StateStore>,
        gateway: Arc<dyn Gateway>,
        chain: Arc<PreprocessorChain>,
        ai_gateway: Option<AiGatewaySettings>,
    ) -> Self {
        Self {
            store,
            gateway,
            chain,
            ai_gateway,
        }
    }

    /// One instance's drift check.
    ///
    /// Finding order is part of the contract (consumers read logs top to
    /// bottom): configHash, gatewayConnection, remoteConfigHash, health,
    /// state.
    pub async fn check_instance(&self, id: &InstanceId) -> Result<DriftReport, ReconcileError> {
        let instance = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| ReconcileError::InstanceNotFound(id.to_string()))?;

        let desired = compute_desired(
            self.store.as_ref(),
            &self.chain,
            self.ai_gateway.as_ref(),
            &instance,
        )
        .await?;
        let desired_hash = &desired.generated.config_hash;

        let mut findings = Vec::new();
        let mut agent_unhealthy = false;

        // 1. Stored vs desired.
        if instance.config_hash.as_deref() != Some(desired_hash.as_str()) {
            findings.push(
                DriftFinding::new(
                    id,
                    "configHash",
                    FindingSeverity::Warning,
                    "stored config hash differs from desired config",
                )
                .with_values(
                    desired_hash.clone(),
                    instance.config_hash.clone().unwrap_or_else(|| "unset".into()),
                ),
            );
        }

        // 2. Reachability, bounded to one 10 s attempt.
        let connection = self.store.get_connection(id).await?;
        let connected = match &connection {
            None => {
                findings.push(DriftFinding::new(
                    id,
                    "gatewayConnection",
                    FindingSeverity::Critical,
                    "no gateway connection recorded",
                ));
                false
            }
            Some(conn) => {
                let endpoint = GatewayEndpoint {
                    host: conn.host.clone(),
                    port: conn.port,
                    protocol: conn.protocol,
                    auth_token: Some(conn.auth_token.clone()),
                };
                match self
                    .gateway
                    .connect(id, &endpoint, &RetryPolicy::once())
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        findings.push(DriftFinding::new(
                            id,
                            "gatewayConnection",
                            FindingSeverity::Critical,
                            format!("gateway unreachable: {}", e),
                        ));
                        false
                    }
                }
            }
        };

        let mut remote_hash = None;
        if connected {
            // 3. config.get
            match self.gateway.config_get(id).await {
                Ok(result) => {
                    if result.hash != *desired_hash {
                        findings.push(
                            DriftFinding::new(
                                id,
                                "remoteConfigHash",
                                FindingSeverity::Critical,
                                "agent serves a different config than desired",
                            )
                            .with_values(desired_hash.clone(), result.hash.clone()),
                        );
                    }
                    remote_hash = Some(result.hash);
                }
                Err(e) => findings.push(DriftFinding::new(
                    id,
                    "remoteConfigHash",
                    FindingSeverity::Warning,
                    format!("config.get probe failed: {}", e),
                )),
            }

            // 4. health
            match self.gateway.health(id).await {
                Ok(health) if health.ok => {}
                Ok(_) => {
                    agent_unhealthy = true;
                    findings.push(DriftFinding::new(
                        id,
                        "health",
                        FindingSeverity::Critical,
                        "agent reports unhealthy",
                    ));
                }
                Err(e) => findings.push(DriftFinding::new(
                    id,
                    "health",
                    FindingSeverity::Warning,
                    format!("health probe failed: {}", e),
                )),
            }

            // 5. status
            match self.gateway.status(id).await {
                Ok(status) if status.state == "running" => {}
                Ok(status) => findings.push(
                    DriftFinding::new(
                        id,
                        "state",
                        FindingSeverity::Critical,
                        "agent is not in the running state",
                    )
                    .with_values("running", status.state),
                ),
                Err(e) => findings.push(DriftFinding::new(
                    id,
                    "state",
                    FindingSeverity::Warning,
                    format!("status probe failed: {}", e),
                )),
            }
        }

        // Health rollup.
        let health = if !connected {
            HealthState::Unknown
        } else if agent_unhealthy
            || findings
                .iter()
                .any(|f| f.severity == FindingSeverity::Critical)
        {
            HealthState::Unhealthy
        } else if !findings.is_empty() {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        // Persist health only on change; the heartbeat always moves. A
        // critical finding also invalidates the stored config fingerprint:
        // the next reconcile must re-verify over the wire instead of
        // no-opping on a hash the agent no longer answers for.
        let has_critical = findings
            .iter()
            .any(|f| f.severity == FindingSeverity::Critical);
        let previous = self.store.get_health_snapshot(id).await?;
        let mut updated = instance.clone();
        let mut dirty = false;
        if previous != Some(health) {
            self.store.put_health_snapshot(id, health).await?;
            updated.health = health;
            updated.last_health_check_at = Some(Utc::now());
            dirty = true;
            debug!(instance_id = %id, health = %health, "health changed");
        }
        if has_critical && updated.config_hash.is_some() {
            updated.config_hash = None;
            dirty = true;
            debug!(instance_id = %id, "stored config hash invalidated by critical finding");
        }
        if dirty {
            updated.updated_at = Utc::now();
            self.store.upsert_instance(&updated).await?;
        }
        if let Some(mut conn) = connection {
            conn.status = if connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
            if let Some(hash) = remote_hash {
                conn.config_hash = Some(hash);
            }
            conn.last_heartbeat = Some(Utc::now());
            self.store.upsert_connection(&conn).await?;
        }

        if !findings.is_empty() {
            let critical = findings
                .iter()
                .filter(|f| f.severity == FindingSeverity::Critical)
                .count();
            self.store
                .append_event(&AuditEvent::DriftDetected {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    instance_id: id.clone(),
                    findings: findings.len(),
                    critical,
                })
                .await?;
        }

        Ok(DriftReport {
            instance_id: id.clone(),
            findings,
            health,
        })
    }

    /// Check every instance in `running` or `degraded`. One instance's
    /// failure never affects the others.
    pub async fn scan_fleet(&self) -> Result<Vec<DriftReport>, ReconcileError> {
        let instances = self
            .store
            .list_instances_by_status(&[InstanceStatus::Running, InstanceStatus::Degraded])
            .await?;

        let mut reports = Vec::with_capacity(instances.len());
        for instance in instances {
            match self.check_instance(&instance.id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "drift check failed; continuing scan");
                }
            }
        }
        Ok(reports)
    }
}
