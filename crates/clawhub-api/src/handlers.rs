use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use clawhub_domain::{BotInstance, DeploymentType, InstanceId, InstanceStatus};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.list_instances().await?;
    Ok(StatusCode::OK)
}

// ── Instances ─────────────────────────────────────────────────────────────────

pub async fn list_instances(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let instances = state.store.list_instances().await?;
    Ok(Json(json!(instances)))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = InstanceId::new(id);
    let rel = state
        .store
        .get_instance_with_relations(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("instance not found: {}", id)))?;
    Ok(Json(json!({
        "instance": rel.instance,
        "connection": rel.connection,
        "profile": rel.profile,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceBody {
    pub id: Option<String>,
    pub name: String,
    pub deployment_type: DeploymentType,
    pub deployment_target_id: Option<String>,
    pub manifest: Value,
    /// Provision immediately instead of waiting for the scheduler.
    #[serde(default)]
    pub provision_now: bool,
}

pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = body.id.unwrap_or_else(|| format!("bot-{}", uuid::Uuid::new_v4()));
    let instance_id = InstanceId::new(&id);
    if state.store.get_instance(&instance_id).await?.is_some() {
        return Err(ApiError::conflict(format!("instance already exists: {}", id)));
    }

    let mut instance = BotInstance::new(id, body.name, body.deployment_type, Utc::now());
    instance.deployment_target_id = body.deployment_target_id;
    instance.desired_manifest = Some(body.manifest);
    if body.provision_now {
        instance.status = InstanceStatus::Creating;
    }
    state.store.upsert_instance(&instance).await?;

    if body.provision_now {
        // Fire-and-forget; the pending-pickup task is the safety net.
        let reconciler = state.reconciler.clone();
        let id = instance.id.clone();
        tokio::spawn(async move {
            reconciler.reconcile(&id).await;
        });
    }
    Ok((StatusCode::CREATED, Json(json!(instance))))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.reconciler.destroy(&InstanceId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Operations ────────────────────────────────────────────────────────────────

pub async fn post_reconcile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = InstanceId::new(id);
    let instance = state
        .store
        .get_instance(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("instance not found: {}", id)))?;
    // Per-instance serialization is convention-based; concurrent requests
    // against an in-flight reconcile are rejected, not queued.
    if instance.status == InstanceStatus::Reconciling {
        return Err(ApiError::conflict("instance is already reconciling"));
    }

    let result = state.reconciler.reconcile(&id).await;
    Ok(Json(json!(result)))
}

#[derive(Debug, Deserialize)]
pub struct ManifestBody {
    pub manifest: Value,
}

/// Replace the desired manifest. The only instance mutation the API owns;
/// everything downstream of it belongs to the reconciler.
pub async fn put_manifest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ManifestBody>,
) -> Result<Json<Value>, ApiError> {
    let id = InstanceId::new(id);
    let mut instance = state
        .store
        .get_instance(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("instance not found: {}", id)))?;
    instance.desired_manifest = Some(body.manifest);
    instance.updated_at = Utc::now();
    state.store.upsert_instance(&instance).await?;
    Ok(Json(json!(instance)))
}

pub async fn post_restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.reconciler.restart(&InstanceId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesBody {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

pub async fn put_resources(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResourcesBody>,
) -> Result<Json<Value>, ApiError> {
    let spec = clawhub_target::ResourceSpec {
        cpus: body.cpus,
        memory_mb: body.memory_mb,
        disk_gb: body.disk_gb,
    };
    let outcome = state
        .reconciler
        .update_resources(&InstanceId::new(id), &spec)
        .await?;
    Ok(Json(json!({
        "restartRequired": outcome.restart_required,
        "estimatedDowntimeSecs": outcome.estimated_downtime_secs,
    })))
}

pub async fn post_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.reconciler.stop(&InstanceId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<u32>,
}

pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let lines = state
        .reconciler
        .logs(&InstanceId::new(id), query.tail)
        .await?;
    Ok(Json(json!({ "lines": lines })))
}

pub async fn get_doctor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let checks = state.reconciler.doctor(&InstanceId::new(id)).await?;
    Ok(Json(json!({ "checks": checks })))
}

// ── Drift ─────────────────────────────────────────────────────────────────────

pub async fn get_instance_drift(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = state.drift.check_instance(&InstanceId::new(id)).await?;
    Ok(Json(json!(report)))
}

pub async fn post_drift_scan(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let reports = state.drift.scan_fleet().await?;
    Ok(Json(json!(reports)))
}

// ── Events / status ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub instance: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let instance_id = query.instance.map(InstanceId::new);
    let events = state
        .store
        .list_events(instance_id.as_ref(), query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!(events)))
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let instances = state.store.list_instances().await?;
    let mut by_status: std::collections::BTreeMap<String, usize> = Default::default();
    let mut by_health: std::collections::BTreeMap<String, usize> = Default::default();
    for instance in &instances {
        *by_status.entry(instance.status.to_string()).or_default() += 1;
        *by_health.entry(instance.health.to_string()).or_default() += 1;
    }
    Ok(Json(json!({
        "instances": instances.len(),
        "byStatus": by_status,
        "byHealth": by_health,
    })))
}
