use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clawhub_api::build_app;
use clawhub_config::generate_auth_token;
use clawhub_domain::DeploymentType;
use clawhub_gateway::GatewayPool;
use clawhub_reconciler::{
    BroadcastEvents, DriftDetector, LifecycleManager, PolicyAudit, PreprocessorChain, Reconciler,
    Scheduler, SchedulerConfig,
};
use clawhub_store::{InMemoryStore, RedbStore, StateStore};
use clawhub_target::{
    AwsEc2Provider, AwsProviderConfig, AzureProviderConfig, AzureVmProvider, GcpComputeProvider,
    GcpProviderConfig, LocalDockerProvider, TargetRegistry,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::cli::DeploymentArg;
use crate::output;

// ── Serve ─────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn serve(
    bind: String,
    port: u16,
    ephemeral: bool,
    store_path: Option<PathBuf>,
    rotate_token: bool,
    dev: bool,
    no_auto_reconcile: bool,
) -> Result<()> {
    // Reuse the existing token unless rotation is explicitly requested, so
    // server restarts don't invalidate client configurations.
    let token_path = default_token_path();
    let token = if rotate_token {
        let t = generate_auth_token();
        write_token(&token_path, &t)?;
        println!("Rotated token (written to {})", token_path.display());
        println!("New token: {}", t);
        t
    } else {
        match std::fs::read_to_string(&token_path).map(|s| s.trim().to_string()) {
            Ok(existing) if !existing.is_empty() => {
                println!("Reusing existing token from {}", token_path.display());
                existing
            }
            _ => {
                let t = generate_auth_token();
                write_token(&token_path, &t)?;
                println!("Generated new token (written to {})", token_path.display());
                t
            }
        }
    };

    let store: Arc<dyn StateStore> = if ephemeral {
        println!("Using in-memory (ephemeral) store — state will be lost on server stop");
        Arc::new(InMemoryStore::new())
    } else {
        let path = store_path.unwrap_or_else(|| clawhub_dir().join("state.redb"));
        println!("Using persistent store at {}", path.display());
        Arc::new(
            RedbStore::open(&path)
                .with_context(|| format!("Failed to open store at {}", path.display()))?,
        )
    };

    let registry = Arc::new(build_registry(dev).await?);
    let gateway = Arc::new(GatewayPool::new());
    let events = Arc::new(BroadcastEvents::default());
    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        registry,
        gateway.clone(),
        events,
    ));
    let chain = Arc::new(PreprocessorChain::with_builtins());
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        lifecycle.clone(),
        chain.clone(),
        Arc::new(PolicyAudit),
        None,
    ));
    let drift = Arc::new(DriftDetector::new(store.clone(), gateway, chain, None));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        reconciler.clone(),
        drift.clone(),
        lifecycle,
        SchedulerConfig {
            auto_reconcile: !no_auto_reconcile,
            ..SchedulerConfig::default()
        },
    ));
    let handles = scheduler.start();
    info!(tasks = handles.len(), "scheduler started");

    let app = build_app(store, reconciler, drift, Arc::new(token));
    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    println!("clawhub listening on http://{}", addr);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Register every backend that has enough operator configuration to work.
/// The local Docker backend is always available.
async fn build_registry(dev: bool) -> Result<TargetRegistry> {
    let mut registry = TargetRegistry::new();
    registry.register(Arc::new(LocalDockerProvider::new(
        clawhub_dir().join("data"),
        dev,
    )));

    if let Ok(ami_id) = std::env::var("CLAWHUB_AWS_AMI") {
        registry.register(Arc::new(AwsEc2Provider::new(AwsProviderConfig {
            default_region: std::env::var("CLAWHUB_AWS_REGION")
                .unwrap_or_else(|_| "us-east-1".to_string()),
            ami_id,
            instance_type: std::env::var("CLAWHUB_AWS_INSTANCE_TYPE")
                .unwrap_or_else(|_| "t3.medium".to_string()),
            key_name: std::env::var("CLAWHUB_AWS_KEY_NAME").ok(),
        })));
        info!("registered aws_ec2 target");
    }

    if let Ok(project_id) = std::env::var("CLAWHUB_GCP_PROJECT") {
        let config = GcpProviderConfig {
            project_id,
            default_zone: std::env::var("CLAWHUB_GCP_ZONE")
                .unwrap_or_else(|_| "us-central1-a".to_string()),
            machine_type: std::env::var("CLAWHUB_GCP_MACHINE_TYPE")
                .unwrap_or_else(|_| "e2-medium".to_string()),
            source_image: std::env::var("CLAWHUB_GCP_IMAGE").unwrap_or_else(|_| {
                "projects/clawhub-images/global/images/family/openclaw".to_string()
            }),
        };
        match GcpComputeProvider::from_adc(config).await {
            Ok(provider) => {
                registry.register(Arc::new(provider));
                info!("registered gcp_compute target");
            }
            Err(e) => warn!(error = %e, "gcp target not registered (ADC unavailable)"),
        }
    }

    if let (Ok(tenant_id), Ok(subscription_id)) = (
        std::env::var("CLAWHUB_AZURE_TENANT"),
        std::env::var("CLAWHUB_AZURE_SUBSCRIPTION"),
    ) {
        let config = AzureProviderConfig {
            tenant_id,
            subscription_id,
            default_location: std::env::var("CLAWHUB_AZURE_LOCATION")
                .unwrap_or_else(|_| "eastus2".to_string()),
            vm_size: std::env::var("CLAWHUB_AZURE_VM_SIZE")
                .unwrap_or_else(|_| "Standard_B2s".to_string()),
            image_id: std::env::var("CLAWHUB_AZURE_IMAGE").unwrap_or_default(),
            admin_username: "openclaw".to_string(),
            ssh_public_key: std::env::var("CLAWHUB_AZURE_SSH_KEY").ok(),
            client_id: std::env::var("AZURE_CLIENT_ID").ok(),
            client_secret: std::env::var("AZURE_CLIENT_SECRET").ok(),
        };
        match AzureVmProvider::new(config) {
            Ok(provider) => {
                registry.register(Arc::new(provider));
                info!("registered azure_vm target");
            }
            Err(e) => warn!(error = %e, "azure target not registered"),
        }
    }

    Ok(registry)
}

// ── Remote commands ───────────────────────────────────────────────────────────

struct Client {
    base: String,
    token: String,
    http: reqwest::Client,
}

impl Client {
    fn new(url: &str, token: Option<String>) -> Result<Self> {
        let token = match token {
            Some(t) => t,
            None => std::fs::read_to_string(default_token_path())
                .map(|s| s.trim().to_string())
                .context("no token given and no token file found; run `clawhub serve` first or pass --token")?,
        };
        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        Self::decode(resp).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut req = self
            .http
            .post(format!("{}{}", self.base, path))
            .bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        Self::decode(resp).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        let resp = self
            .http
            .delete(format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", path))?;
        Self::decode(resp).await
    }

    async fn decode(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("unknown error");
            anyhow::bail!("server returned {}: {}", status, message);
        }
        Ok(body)
    }
}

pub async fn create(
    url: &str,
    token: Option<String>,
    name: String,
    manifest_path: PathBuf,
    deployment: DeploymentArg,
    now: bool,
) -> Result<()> {
    let manifest = clawhub_config::BotManifest::load(&manifest_path)
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;
    let manifest_value = serde_json::json!({
        "apiVersion": manifest.api_version,
        "kind": manifest.kind,
        "metadata": manifest.metadata,
        "spec": { "openclawConfig": manifest.openclaw_config },
    });

    let deployment_type = match deployment {
        DeploymentArg::Local => DeploymentType::LocalDocker,
        DeploymentArg::Aws => DeploymentType::AwsEc2,
        DeploymentArg::Gcp => DeploymentType::GcpCompute,
        DeploymentArg::Azure => DeploymentType::AzureVm,
    };

    let client = Client::new(url, token)?;
    let body = json!({
        "name": name,
        "deploymentType": deployment_type,
        "manifest": manifest_value,
        "provisionNow": now,
    });
    let created = client.post("/instances", Some(body)).await?;
    println!("Created instance {}", created["id"].as_str().unwrap_or("?"));
    if now {
        println!("Provisioning started; follow with `clawhub events --instance <id>`");
    }
    Ok(())
}

pub async fn reconcile(url: &str, token: Option<String>, id: String) -> Result<()> {
    let client = Client::new(url, token)?;
    let result = client
        .post(&format!("/instances/{}/reconcile", id), None)
        .await?;
    output::print_reconcile_result(&result);
    Ok(())
}

pub async fn list(url: &str, token: Option<String>) -> Result<()> {
    let client = Client::new(url, token)?;
    let instances = client.get("/instances").await?;
    output::print_instances(&instances);
    Ok(())
}

pub async fn status(url: &str, token: Option<String>) -> Result<()> {
    let client = Client::new(url, token)?;
    let status = client.get("/status").await?;
    output::print_status(&status);
    Ok(())
}

pub async fn drift(url: &str, token: Option<String>, id: Option<String>) -> Result<()> {
    let client = Client::new(url, token)?;
    match id {
        Some(id) => {
            let report = client.get(&format!("/instances/{}/drift", id)).await?;
            output::print_drift_reports(std::slice::from_ref(&report));
        }
        None => {
            let reports = client.post("/drift/scan", None).await?;
            let reports = reports.as_array().cloned().unwrap_or_default();
            output::print_drift_reports(&reports);
        }
    }
    Ok(())
}

pub async fn stop(url: &str, token: Option<String>, id: String) -> Result<()> {
    let client = Client::new(url, token)?;
    client.post(&format!("/instances/{}/stop", id), None).await?;
    println!("Stopped {}", id);
    Ok(())
}

pub async fn restart(url: &str, token: Option<String>, id: String) -> Result<()> {
    let client = Client::new(url, token)?;
    client
        .post(&format!("/instances/{}/restart", id), None)
        .await?;
    println!("Restarted {}", id);
    Ok(())
}

pub async fn destroy(url: &str, token: Option<String>, id: String) -> Result<()> {
    let client = Client::new(url, token)?;
    client.delete(&format!("/instances/{}", id)).await?;
    println!("Destroyed {}", id);
    Ok(())
}

pub async fn logs(url: &str, token: Option<String>, id: String, tail: u32) -> Result<()> {
    let client = Client::new(url, token)?;
    let body = client
        .get(&format!("/instances/{}/logs?tail={}", id, tail))
        .await?;
    for line in body["lines"].as_array().cloned().unwrap_or_default() {
        if let Some(line) = line.as_str() {
            println!("{}", line);
        }
    }
    Ok(())
}

pub async fn doctor(url: &str, token: Option<String>, id: String) -> Result<()> {
    let client = Client::new(url, token)?;
    let body = client.get(&format!("/instances/{}/doctor", id)).await?;
    output::print_doctor_checks(&body);
    Ok(())
}

pub async fn events(
    url: &str,
    token: Option<String>,
    instance: Option<String>,
    limit: u32,
) -> Result<()> {
    let client = Client::new(url, token)?;
    let path = match instance {
        Some(id) => format!("/events?instance={}&limit={}", id, limit),
        None => format!("/events?limit={}", limit),
    };
    let events = client.get(&path).await?;
    output::print_events(&events);
    Ok(())
}

// ── Paths ─────────────────────────────────────────────────────────────────────

fn clawhub_dir() -> PathBuf {
    std::env::var("CLAWHUB_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".clawhub"))
                .unwrap_or_else(|_| PathBuf::from(".clawhub"))
        })
}

fn default_token_path() -> PathBuf {
    clawhub_dir().join("token")
}

fn write_token(path: &PathBuf, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{}\n", token))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
