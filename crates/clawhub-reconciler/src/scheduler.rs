use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use clawhub_domain::InstanceStatus;
use clawhub_store::{AuditEvent, StateStore};
use clawhub_target::InfraStatus;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::drift::DriftDetector;
use crate::engine::Reconciler;
use crate::error::ReconcileError;
use crate::lifecycle::LifecycleManager;

/// Intervals and thresholds for the periodic tasks. Injectable so tests can
/// drive single ticks with short durations.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub drift_interval: Duration,
    pub stuck_interval: Duration,
    /// How long an instance may sit in `creating`/`reconciling` before it is
    /// declared stuck.
    pub stuck_threshold: ChronoDuration,
    pub pending_interval: Duration,
    pub orphan_interval: Duration,
    /// `running` instances at or above this error count get an infra check.
    pub orphan_error_threshold: u32,
    pub rotation_interval: Duration,
    /// Warn when `last_reconcile_at` is older than this.
    pub rotation_max_age: ChronoDuration,
    /// Reconcile drifted instances automatically after a drift scan.
    pub auto_reconcile: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            drift_interval: Duration::from_secs(5 * 60),
            stuck_interval: Duration::from_secs(60),
            stuck_threshold: ChronoDuration::minutes(15),
            pending_interval: Duration::from_secs(30),
            orphan_interval: Duration::from_secs(5 * 60),
            orphan_error_threshold: 10,
            rotation_interval: Duration::from_secs(24 * 60 * 60),
            rotation_max_age: ChronoDuration::days(90),
            auto_reconcile: true,
        }
    }
}

/// Cooperative periodic scheduler: five independent loops, each serialized
/// with itself (a tick waits for the previous run of the same task), all
/// running in parallel with each other and with API-triggered reconciles.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    reconciler: Arc<Reconciler>,
    drift: Arc<DriftDetector>,
    lifecycle: Arc<LifecycleManager>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        reconciler: Arc<Reconciler>,
        drift: Arc<DriftDetector>,
        lifecycle: Arc<LifecycleManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            reconciler,
            drift,
            lifecycle,
            config,
        }
    }

    /// Spawn all five loops. The handles run until aborted.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_loop("drift-scan", self.config.drift_interval, |s| async move {
                s.run_drift_scan().await
            }),
            self.spawn_loop("stuck-recovery", self.config.stuck_interval, |s| async move {
                s.run_stuck_recovery().await
            }),
            self.spawn_loop("pending-pickup", self.config.pending_interval, |s| async move {
                s.run_pending_pickup().await
            }),
            self.spawn_loop("orphan-detection", self.config.orphan_interval, |s| async move {
                s.run_orphan_detection().await
            }),
            self.spawn_loop("rotation-warning", self.config.rotation_interval, |s| async move {
                s.run_rotation_warning().await
            }),
        ]
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, task: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Scheduler>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), ReconcileError>> + Send,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A long-running task must not be overlapped by its next tick.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                debug!(task = name, "scheduler tick");
                if let Err(e) = task(Arc::clone(&scheduler)).await {
                    warn!(task = name, error = %e, "scheduler task failed");
                }
            }
        })
    }

    /// Fleet drift scan; optionally reconciles each drifted instance, one at
    /// a time.
    pub async fn run_drift_scan(&self) -> Result<(), ReconcileError> {
        let reports = self.drift.scan_fleet().await?;
        let drifted: Vec<_> = reports.iter().filter(|r| !r.findings.is_empty()).collect();
        if drifted.is_empty() {
            debug!("drift scan clean");
            return Ok(());
        }
        info!(drifted = drifted.len(), "drift scan found findings");

        if self.config.auto_reconcile {
            for report in drifted {
                let result = self.reconciler.reconcile(&report.instance_id).await;
                if !result.success {
                    warn!(
                        instance_id = %report.instance_id,
                        message = %result.message,
                        "auto-reconcile after drift failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Instances wedged in `creating`/`reconciling` past the threshold go to
    /// `error`; a later reconcile picks them back up.
    pub async fn run_stuck_recovery(&self) -> Result<(), ReconcileError> {
        let cutoff = Utc::now() - self.config.stuck_threshold;
        let candidates = self
            .store
            .list_instances_by_status(&[InstanceStatus::Creating, InstanceStatus::Reconciling])
            .await?;

        for mut instance in candidates {
            if instance.updated_at >= cutoff {
                continue;
            }
            let message = format!(
                "stuck in {} since {} (threshold {} min)",
                instance.status,
                instance.updated_at.to_rfc3339(),
                self.config.stuck_threshold.num_minutes()
            );
            warn!(instance_id = %instance.id, "{}", message);
            instance.mark_error(Utc::now(), message.clone());
            self.store.upsert_instance(&instance).await?;
            self.store
                .append_event(&AuditEvent::StuckStateMarked {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    instance_id: instance.id.clone(),
                    message,
                })
                .await?;
        }
        Ok(())
    }

    /// Safety net for fire-and-forget API triggers: reconcile everything in
    /// `pending`.
    pub async fn run_pending_pickup(&self) -> Result<(), ReconcileError> {
        let pending = self
            .store
            .list_instances_by_status(&[InstanceStatus::Pending])
            .await?;
        for instance in pending {
            info!(instance_id = %instance.id, "picking up pending instance");
            let result = self.reconciler.reconcile(&instance.id).await;
            if !result.success {
                warn!(instance_id = %instance.id, message = %result.message, "pending pickup failed");
            }
        }
        Ok(())
    }

    /// Repeated-error instances get their infra checked; vanished or broken
    /// compute moves them out of `running`.
    pub async fn run_orphan_detection(&self) -> Result<(), ReconcileError> {
        let running = self
            .store
            .list_instances_by_status(&[InstanceStatus::Running])
            .await?;

        for mut instance in running {
            if instance.error_count < self.config.orphan_error_threshold {
                continue;
            }
            let status = match self.lifecycle.get_status(&instance).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "orphan check failed");
                    continue;
                }
            };
            match status.infra {
                InfraStatus::NotInstalled | InfraStatus::Stopped => {
                    warn!(instance_id = %instance.id, infra = %status.infra, "infrastructure gone; marking stopped");
                    instance.mark_stopped(Utc::now());
                    self.store.upsert_instance(&instance).await?;
                }
                InfraStatus::Error(message) => {
                    warn!(instance_id = %instance.id, error = %message, "infrastructure errored");
                    instance.mark_error(Utc::now(), format!("infrastructure error: {}", message));
                    self.store.upsert_instance(&instance).await?;
                }
                InfraStatus::Running | InfraStatus::Unknown => {}
            }
        }
        Ok(())
    }

    /// Daily sweep warning about instances whose credentials have not been
    /// refreshed by a reconcile within the rotation window.
    pub async fn run_rotation_warning(&self) -> Result<(), ReconcileError> {
        let cutoff = Utc::now() - self.config.rotation_max_age;
        let active = self
            .store
            .list_instances_by_status(&[InstanceStatus::Running, InstanceStatus::Degraded])
            .await?;

        for instance in active {
            let stale = match instance.last_reconcile_at {
                Some(at) => at < cutoff,
                None => true,
            };
            if !stale {
                continue;
            }
            warn!(
                instance_id = %instance.id,
                last_reconcile_at = ?instance.last_reconcile_at,
                "gateway token older than rotation window; reconcile to rotate"
            );
            self.store
                .append_event(&AuditEvent::TokenRotationWarning {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    instance_id: instance.id.clone(),
                    last_reconcile_at: instance.last_reconcile_at,
                })
                .await?;
        }
        Ok(())
    }
}
