use chrono::{DateTime, Utc};
use clawhub_domain::InstanceId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit record written around reconcile and lifecycle
/// operations. The reconciler is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AuditEvent {
    ReconcileStarted {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
    },
    ReconcileCompleted {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
        changes: usize,
        duration_ms: u64,
    },
    ReconcileFailed {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
        message: String,
    },
    InstanceProvisioned {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
    },
    ConfigApplied {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
        config_hash: String,
    },
    InstanceStopped {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
    },
    InstanceDestroyed {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
    },
    DriftDetected {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
        findings: usize,
        critical: usize,
    },
    StuckStateMarked {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
        message: String,
    },
    KeyRotated {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
        label: String,
    },
    TokenRotationWarning {
        id: Uuid,
        at: DateTime<Utc>,
        instance_id: InstanceId,
        last_reconcile_at: Option<DateTime<Utc>>,
    },
}

impl AuditEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            AuditEvent::ReconcileStarted { instance_id, .. } => instance_id,
            AuditEvent::ReconcileCompleted { instance_id, .. } => instance_id,
            AuditEvent::ReconcileFailed { instance_id, .. } => instance_id,
            AuditEvent::InstanceProvisioned { instance_id, .. } => instance_id,
            AuditEvent::ConfigApplied { instance_id, .. } => instance_id,
            AuditEvent::InstanceStopped { instance_id, .. } => instance_id,
            AuditEvent::InstanceDestroyed { instance_id, .. } => instance_id,
            AuditEvent::DriftDetected { instance_id, .. } => instance_id,
            AuditEvent::StuckStateMarked { instance_id, .. } => instance_id,
            AuditEvent::KeyRotated { instance_id, .. } => instance_id,
            AuditEvent::TokenRotationWarning { instance_id, .. } => instance_id,
        }
    }
}
