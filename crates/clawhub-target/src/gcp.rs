use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use clawhub_domain::{BotInstance, DeploymentTargetRecord, DeploymentType, GatewayProtocol};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::TargetError;
use crate::registry::TargetProvider;
use crate::target::{
    DeploymentTarget, Endpoint, InfraStatus, InstallOptions, InstallResult, LogCallback,
    LogOptions, LogStream, ResourceSpec, ResourceUpdateOutcome,
};
use crate::transform::{prepare_agent_config, TransformOverrides};

const NETWORK_NAME: &str = "clawhub";
const FIREWALL_NAME: &str = "clawhub-gateway";
const MANAGED_LABEL: &str = "clawhub-managed";
const INSTANCE_LABEL: &str = "clawhub-instance";

// ── Configuration ─────────────────────────────────────────────────────────────

/// Operator-level settings for the GCE backend.
#[derive(Clone)]
pub struct GcpProviderConfig {
    /// Project hosting all bot VMs.
    pub project_id: String,
    /// Default zone when the deployment-target record names none.
    pub default_zone: String,
    /// Default machine size.
    pub machine_type: String,
    /// Boot image carrying the agent runtime (full resource link).
    pub source_image: String,
}

// ── Base URLs (overridden in tests to point at a mock server) ─────────────────

#[derive(Clone)]
pub(crate) struct GcpBaseUrls {
    pub(crate) compute: String,
    pub(crate) secretmanager: String,
}

impl Default for GcpBaseUrls {
    fn default() -> Self {
        Self {
            compute: "https://compute.googleapis.com".into(),
            secretmanager: "https://secretmanager.googleapis.com".into(),
        }
    }
}

// ── Token provider ────────────────────────────────────────────────────────────

/// Abstraction over GCP token acquisition — enables test injection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, TargetError>;
}

/// Production token provider backed by Application Default Credentials.
pub struct AdcTokenProvider {
    inner: std::sync::Arc<dyn gcp_auth::TokenProvider>,
}

impl AdcTokenProvider {
    pub async fn new() -> Result<Self, TargetError> {
        let inner = gcp_auth::provider()
            .await
            .map_err(|e| TargetError::Internal(format!("failed to initialise GCP ADC: {}", e)))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl TokenProvider for AdcTokenProvider {
    async fn token(&self) -> Result<String, TargetError> {
        let token = self
            .inner
            .token(&["https://www.googleapis.com/auth/cloud-platform"])
            .await
            .map_err(|e| TargetError::Internal(format!("GCP auth failed: {}", e)))?;
        Ok(token.as_str().to_string())
    }
}

/// Test token provider — returns a fixed string without any network call.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, TargetError> {
        Ok(self.0.clone())
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub struct GcpComputeProvider {
    config: GcpProviderConfig,
    client: reqwest::Client,
    token: std::sync::Arc<dyn TokenProvider>,
    base: GcpBaseUrls,
}

impl GcpComputeProvider {
    /// Create a provider using Application Default Credentials.
    ///
    /// ADC resolution order:
    /// 1. `GOOGLE_APPLICATION_CREDENTIALS` env var (service account JSON key)
    /// 2. Workload Identity (when running on GCP)
    /// 3. `gcloud auth application-default login` for local dev
    pub async fn from_adc(config: GcpProviderConfig) -> Result<Self, TargetError> {
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            token: std::sync::Arc::new(AdcTokenProvider::new().await?),
            base: GcpBaseUrls::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_static_token(
        config: GcpProviderConfig,
        token: &str,
        base: GcpBaseUrls,
    ) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            token: std::sync::Arc::new(StaticToken(token.to_string())),
            base,
        }
    }
}

#[async_trait]
impl TargetProvider for GcpComputeProvider {
    fn deployment_type(&self) -> DeploymentType {
        DeploymentType::GcpCompute
    }

    async fn target_for(
        &self,
        instance: &BotInstance,
        record: Option<&DeploymentTargetRecord>,
    ) -> Result<Box<dyn DeploymentTarget>, TargetError> {
        let zone = record
            .and_then(|r| r.zone.clone())
            .unwrap_or_else(|| self.config.default_zone.clone());
        let project = record
            .and_then(|r| r.credentials["projectId"].as_str().map(String::from))
            .unwrap_or_else(|| self.config.project_id.clone());

        Ok(Box::new(GceTarget {
            config: self.config.clone(),
            base: self.base.clone(),
            client: self.client.clone(),
            token: self.token.clone(),
            project,
            zone,
            vm_name: vm_name(&instance.profile_name),
            profile_name: instance.profile_name.clone(),
            instance_id: instance.id.to_string(),
            gateway_port: instance.gateway_port,
            log_cb: Mutex::new(None),
        }))
    }
}

/// GCE instance names: lowercase letters, digits and hyphens, starting with
/// a letter, at most 63 chars.
fn vm_name(profile: &str) -> String {
    let mut safe: String = profile
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    safe.truncate(54);
    format!("openclaw-{}", safe.trim_matches('-'))
}

// ── Target ────────────────────────────────────────────────────────────────────

/// One instance's Compute Engine virtual machine.
pub struct GceTarget {
    config: GcpProviderConfig,
    base: GcpBaseUrls,
    client: reqwest::Client,
    token: std::sync::Arc<dyn TokenProvider>,
    project: String,
    zone: String,
    vm_name: String,
    profile_name: String,
    instance_id: String,
    gateway_port: u16,
    log_cb: Mutex<Option<LogCallback>>,
}

impl GceTarget {
    fn emit(&self, line: &str) {
        if let Ok(guard) = self.log_cb.lock() {
            if let Some(cb) = guard.as_ref() {
                cb(line, LogStream::Stdout);
            }
        }
    }

    fn vm_url(&self) -> String {
        format!(
            "{}/compute/v1/projects/{}/zones/{}/instances/{}",
            self.base.compute, self.project, self.zone, self.vm_name
        )
    }

    fn secret_id(&self) -> String {
        format!("openclaw-{}-config", self.profile_name)
    }

    /// Convert a GCP REST error envelope into a human-readable message.
    fn extract_error(body: &Value) -> String {
        let err = &body["error"];
        let status = err["status"].as_str().unwrap_or("UNKNOWN");
        let message = err["message"].as_str().unwrap_or("unknown error");
        format!("{}: {}", status, message)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Value), TargetError> {
        let token = self.token.token().await?;
        let mut req = self.client.request(method, url).bearer_auth(&token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TargetError::Internal(format!("{}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    /// Poll a compute operation until it completes.
    ///
    /// Backoff: 1 s, 2 s, 4 s, 8 s, 16 s, 30 s, 30 s, … (max 120 polls).
    /// Progress is logged so operators can follow multi-minute provisions.
    async fn wait_for_operation(&self, op: &Value) -> Result<(), TargetError> {
        let Some(op_url) = op["selfLink"].as_str() else {
            return Ok(()); // synchronous response
        };
        let delays = [1u64, 2, 4, 8, 16, 30];
        let max_polls = 120;

        for (i, &delay) in delays.iter().cycle().take(max_polls).enumerate() {
            let (status, body) = self.request(reqwest::Method::GET, op_url, None).await?;
            if status >= 400 {
                return Err(TargetError::Internal(format!(
                    "operation poll {}: {}",
                    status,
                    Self::extract_error(&body)
                )));
            }
            if body["status"].as_str() == Some("DONE") {
                if let Some(errors) = body["error"]["errors"].as_array() {
                    let msgs: Vec<&str> = errors
                        .iter()
                        .filter_map(|e| e["message"].as_str())
                        .collect();
                    return Err(TargetError::InstallFailed(format!(
                        "operation failed: {}",
                        msgs.join("; ")
                    )));
                }
                return Ok(());
            }
            let poll = i + 1;
            if poll % 10 == 0 {
                info!(poll, op_url, "still waiting for GCP operation");
            } else {
                debug!(poll, op_url, delay, "GCP operation pending, waiting");
            }
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        Err(TargetError::InstallFailed(format!(
            "GCP operation timed out after {} polls: {}",
            max_polls, op_url
        )))
    }

    async fn ensure_network(&self) -> Result<(), TargetError> {
        let url = format!(
            "{}/compute/v1/projects/{}/global/networks/{}",
            self.base.compute, self.project, NETWORK_NAME
        );
        let (status, _) = self.request(reqwest::Method::GET, &url, None).await?;
        if status == 200 {
            return Ok(());
        }

        self.emit("creating shared network");
        let insert_url = format!(
            "{}/compute/v1/projects/{}/global/networks",
            self.base.compute, self.project
        );
        let body = json!({ "name": NETWORK_NAME, "autoCreateSubnetworks": true });
        let (status, op) = self
            .request(reqwest::Method::POST, &insert_url, Some(&body))
            .await?;
        // 409: created concurrently.
        if status == 409 {
            return Ok(());
        }
        if status >= 400 {
            return Err(TargetError::InstallFailed(Self::extract_error(&op)));
        }
        self.wait_for_operation(&op).await
    }

    async fn ensure_firewall(&self) -> Result<(), TargetError> {
        let url = format!(
            "{}/compute/v1/projects/{}/global/firewalls/{}",
            self.base.compute, self.project, FIREWALL_NAME
        );
        let (status, _) = self.request(reqwest::Method::GET, &url, None).await?;
        if status == 200 {
            return Ok(());
        }

        let insert_url = format!(
            "{}/compute/v1/projects/{}/global/firewalls",
            self.base.compute, self.project
        );
        let body = json!({
            "name": FIREWALL_NAME,
            "network": format!("global/networks/{}", NETWORK_NAME),
            "direction": "INGRESS",
            "allowed": [{ "IPProtocol": "tcp", "ports": [self.gateway_port.to_string()] }],
            "targetTags": ["clawhub"],
            "sourceRanges": ["0.0.0.0/0"],
        });
        let (status, op) = self
            .request(reqwest::Method::POST, &insert_url, Some(&body))
            .await?;
        if status == 409 {
            return Ok(());
        }
        if status >= 400 {
            return Err(TargetError::InstallFailed(Self::extract_error(&op)));
        }
        self.wait_for_operation(&op).await
    }

    /// Ensure the Secret Manager slot for this bot's config exists.
    async fn ensure_secret(&self) -> Result<(), TargetError> {
        let url = format!(
            "{}/v1/projects/{}/secrets?secretId={}",
            self.base.secretmanager, self.project, self.secret_id()
        );
        let body = json!({ "replication": { "automatic": {} } });
        let (status, resp) = self.request(reqwest::Method::POST, &url, Some(&body)).await?;
        // 409: slot already provisioned.
        if status >= 400 && status != 409 {
            return Err(TargetError::InstallFailed(Self::extract_error(&resp)));
        }
        Ok(())
    }

    /// First-boot script: fetch the config secret and start the agent.
    fn startup_script(&self, opts: &InstallOptions) -> String {
        let mut exports = String::new();
        for (k, v) in &opts.env_vars {
            exports.push_str(&format!("export {}='{}'\n", k, v.replace('\'', "'\\''")));
        }
        if let Some(token) = &opts.auth_token {
            exports.push_str(&format!("export OPENCLAW_GATEWAY_TOKEN='{}'\n", token));
        }
        format!(
            "#!/bin/bash\nset -euo pipefail\n{exports}\
             mkdir -p /var/lib/openclaw/{profile}\n\
             gcloud secrets versions access latest --secret={secret} \
             > /var/lib/openclaw/{profile}/config.json\n\
             openclaw-agent install --profile {profile} --version {version} --port {port}\n\
             systemctl enable --now openclaw-agent@{profile}\n",
            exports = exports,
            profile = opts.profile_name,
            secret = self.secret_id(),
            version = opts.version,
            port = opts.port,
        )
    }

    async fn vm_state(&self) -> Result<Option<Value>, TargetError> {
        let (status, body) = self.request(reqwest::Method::GET, &self.vm_url(), None).await?;
        if status == 404 {
            return Ok(None);
        }
        if status >= 400 {
            return Err(TargetError::Internal(Self::extract_error(&body)));
        }
        Ok(Some(body))
    }

    async fn no_managed_vms_remain(&self) -> Result<bool, TargetError> {
        let url = format!(
            "{}/compute/v1/projects/{}/zones/{}/instances?filter=labels.{}%3Dtrue",
            self.base.compute, self.project, self.zone, MANAGED_LABEL
        );
        let (status, body) = self.request(reqwest::Method::GET, &url, None).await?;
        if status >= 400 {
            return Ok(false);
        }
        Ok(body["items"].as_array().map_or(true, |a| a.is_empty()))
    }

    /// Smallest e2 machine type satisfying the requested resources.
    fn machine_type_for(&self, spec: &ResourceSpec) -> String {
        let cpus = spec.cpus.unwrap_or(2.0);
        let memory_mb = spec.memory_mb.unwrap_or(4096);
        let name = match (cpus, memory_mb) {
            (c, m) if c <= 2.0 && m <= 2048 => "e2-small",
            (c, m) if c <= 2.0 && m <= 4096 => "e2-medium",
            (c, m) if c <= 2.0 && m <= 8192 => "e2-standard-2",
            (c, m) if c <= 4.0 && m <= 16384 => "e2-standard-4",
            _ => "e2-standard-8",
        };
        name.to_string()
    }

    /// POST to an instance sub-action (start/stop/reset/setMachineType).
    async fn vm_action(&self, action: &str, body: Option<&Value>) -> Result<(u16, Value), TargetError> {
        let url = format!("{}/{}", self.vm_url(), action);
        self.request(reqwest::Method::POST, &url, body).await
    }
}

#[async_trait]
impl DeploymentTarget for GceTarget {
    async fn install(&self, opts: &InstallOptions) -> Result<InstallResult, TargetError> {
        self.ensure_network().await?;
        self.ensure_firewall().await?;
        self.ensure_secret().await?;

        if let Some(vm) = self.vm_state().await? {
            debug!(vm = %self.vm_name, "VM already provisioned");
            let link = vm["selfLink"].as_str().unwrap_or(&self.vm_name);
            return Ok(InstallResult {
                instance_ref: link.to_string(),
            });
        }

        self.emit(&format!("creating VM {} in {}", self.vm_name, self.zone));
        let insert_url = format!(
            "{}/compute/v1/projects/{}/zones/{}/instances",
            self.base.compute, self.project, self.zone
        );
        let body = json!({
            "name": self.vm_name,
            "machineType": format!("zones/{}/machineTypes/{}", self.zone, self.config.machine_type),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": { "sourceImage": self.config.source_image },
            }],
            "networkInterfaces": [{
                "network": format!("global/networks/{}", NETWORK_NAME),
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
            }],
            "metadata": {
                "items": [{ "key": "startup-script", "value": self.startup_script(opts) }]
            },
            "labels": {
                MANAGED_LABEL: "true",
                INSTANCE_LABEL: self.instance_id,
            },
            "tags": { "items": ["clawhub"] },
        });

        let (status, op) = self
            .request(reqwest::Method::POST, &insert_url, Some(&body))
            .await?;
        if status >= 400 && status != 409 {
            return Err(TargetError::InstallFailed(Self::extract_error(&op)));
        }
        if status != 409 {
            self.wait_for_operation(&op).await?;
        }
        info!(vm = %self.vm_name, zone = %self.zone, "created VM");
        Ok(InstallResult {
            instance_ref: self.vm_url(),
        })
    }

    async fn configure(
        &self,
        _profile_name: &str,
        _port: u16,
        config: &Value,
        _env: &HashMap<String, String>,
    ) -> Result<(), TargetError> {
        self.ensure_secret()
            .await
            .map_err(|e| TargetError::ConfigureFailed(e.to_string()))?;

        let prepared = prepare_agent_config(
            config,
            TransformOverrides::for_deployment(DeploymentType::GcpCompute),
        );
        let payload = base64::engine::general_purpose::STANDARD.encode(prepared.to_string());
        let url = format!(
            "{}/v1/projects/{}/secrets/{}:addVersion",
            self.base.secretmanager, self.project, self.secret_id()
        );
        let body = json!({ "payload": { "data": payload } });
        let (status, resp) = self.request(reqwest::Method::POST, &url, Some(&body)).await?;
        if status >= 400 {
            return Err(TargetError::ConfigureFailed(Self::extract_error(&resp)));
        }
        debug!(secret = %self.secret_id(), "stored agent config version");
        Ok(())
    }

    async fn start(&self) -> Result<(), TargetError> {
        let (status, op) = self.vm_action("start", None).await?;
        if status >= 400 {
            return Err(TargetError::StartFailed(Self::extract_error(&op)));
        }
        self.wait_for_operation(&op)
            .await
            .map_err(|e| TargetError::StartFailed(e.to_string()))
    }

    async fn stop(&self) -> Result<(), TargetError> {
        let (status, op) = self.vm_action("stop", None).await?;
        if status == 404 {
            return Ok(());
        }
        if status >= 400 {
            return Err(TargetError::StopFailed(Self::extract_error(&op)));
        }
        self.wait_for_operation(&op)
            .await
            .map_err(|e| TargetError::StopFailed(e.to_string()))
    }

    async fn restart(&self) -> Result<(), TargetError> {
        let (status, op) = self.vm_action("reset", None).await?;
        if status >= 400 {
            return Err(TargetError::StartFailed(Self::extract_error(&op)));
        }
        self.wait_for_operation(&op)
            .await
            .map_err(|e| TargetError::StartFailed(e.to_string()))
    }

    async fn get_status(&self) -> Result<InfraStatus, TargetError> {
        match self.vm_state().await {
            Ok(None) => Ok(InfraStatus::NotInstalled),
            Ok(Some(vm)) => Ok(match vm["status"].as_str() {
                Some("RUNNING") => InfraStatus::Running,
                Some("TERMINATED") | Some("SUSPENDED") | Some("STOPPING") => InfraStatus::Stopped,
                Some("PROVISIONING") | Some("STAGING") => InfraStatus::Unknown,
                Some(other) => InfraStatus::Error(format!("unexpected VM status {}", other)),
                None => InfraStatus::Unknown,
            }),
            Err(e) => Ok(InfraStatus::Error(e.to_string())),
        }
    }

    async fn get_endpoint(&self) -> Result<Endpoint, TargetError> {
        let vm = self
            .vm_state()
            .await?
            .ok_or_else(|| TargetError::EndpointUnavailable("VM not installed".to_string()))?;
        let nat_ip = vm["networkInterfaces"][0]["accessConfigs"][0]["natIP"]
            .as_str()
            .ok_or_else(|| {
                TargetError::EndpointUnavailable("no external IP assigned yet".to_string())
            })?;
        Ok(Endpoint {
            host: nat_ip.to_string(),
            port: self.gateway_port,
            protocol: GatewayProtocol::Ws,
        })
    }

    async fn destroy(&self) -> Result<(), TargetError> {
        let (status, op) = self.request(reqwest::Method::DELETE, &self.vm_url(), None).await?;
        if status < 400 {
            self.wait_for_operation(&op).await?;
            self.emit(&format!("deleted VM {}", self.vm_name));
        } else if status != 404 {
            return Err(TargetError::DestroyFailed(Self::extract_error(&op)));
        }

        // Bot-specific secret always goes.
        let secret_url = format!(
            "{}/v1/projects/{}/secrets/{}",
            self.base.secretmanager, self.project, self.secret_id()
        );
        let (status, body) = self.request(reqwest::Method::DELETE, &secret_url, None).await?;
        if status >= 400 && status != 404 {
            warn!(error = %Self::extract_error(&body), "failed to delete config secret");
        }

        // Shared network and firewall go only when no managed VM remains.
        if self.no_managed_vms_remain().await? {
            for url in [
                format!(
                    "{}/compute/v1/projects/{}/global/firewalls/{}",
                    self.base.compute, self.project, FIREWALL_NAME
                ),
                format!(
                    "{}/compute/v1/projects/{}/global/networks/{}",
                    self.base.compute, self.project, NETWORK_NAME
                ),
            ] {
                let (status, op) = self.request(reqwest::Method::DELETE, &url, None).await?;
                if status < 400 {
                    if let Err(e) = self.wait_for_operation(&op).await {
                        warn!(error = %e, url = %url, "shared resource delete did not complete");
                    }
                } else if status != 404 {
                    warn!(url = %url, "skipping shared resource still in use");
                }
            }
            info!("removed orphaned shared network");
        }
        Ok(())
    }

    async fn get_logs(&self, opts: &LogOptions) -> Result<Vec<String>, TargetError> {
        let url = format!("{}/serialPort?port=1", self.vm_url());
        let (status, body) = self.request(reqwest::Method::GET, &url, None).await?;
        if status >= 400 {
            return Err(TargetError::LogsUnavailable(Self::extract_error(&body)));
        }
        let contents = body["contents"].as_str().unwrap_or_default();
        let lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let tail = opts.tail.unwrap_or(100) as usize;
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].to_vec())
    }

    async fn update_resources(
        &self,
        spec: &ResourceSpec,
    ) -> Result<ResourceUpdateOutcome, TargetError> {
        let machine_type = self.machine_type_for(spec);

        // setMachineType requires a TERMINATED instance.
        self.stop().await?;
        let body = json!({
            "machineType": format!("zones/{}/machineTypes/{}", self.zone, machine_type)
        });
        let (status, op) = self.vm_action("setMachineType", Some(&body)).await?;
        if status >= 400 {
            return Err(TargetError::Internal(Self::extract_error(&op)));
        }
        self.wait_for_operation(&op).await?;
        self.start().await?;

        info!(vm = %self.vm_name, machine_type = %machine_type, "resized VM");
        Ok(ResourceUpdateOutcome {
            restart_required: true,
            estimated_downtime_secs: 180,
        })
    }

    fn set_log_callback(&self, cb: LogCallback) {
        if let Ok(mut guard) = self.log_cb.lock() {
            *guard = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> GcpProviderConfig {
        GcpProviderConfig {
            project_id: "clawhub-prod".into(),
            default_zone: "us-central1-a".into(),
            machine_type: "e2-medium".into(),
            source_image: "projects/clawhub-images/global/images/family/openclaw".into(),
        }
    }

    /// Built through the provider, the way the lifecycle manager does it.
    async fn test_target(server: &MockServer) -> Box<dyn DeploymentTarget> {
        let provider = GcpComputeProvider::with_static_token(
            test_config(),
            "test-token",
            GcpBaseUrls {
                compute: server.uri(),
                secretmanager: server.uri(),
            },
        );
        let instance = BotInstance::new(
            "bot-1",
            "alpha",
            DeploymentType::GcpCompute,
            chrono::Utc::now(),
        );
        provider.target_for(&instance, None).await.unwrap()
    }

    #[tokio::test]
    async fn status_maps_vm_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/compute/v1/projects/clawhub-prod/zones/us-central1-a/instances/openclaw-alpha",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "RUNNING",
                "networkInterfaces": [
                    { "accessConfigs": [ { "natIP": "34.1.2.3" } ] }
                ],
            })))
            .mount(&server)
            .await;

        let target = test_target(&server).await;
        assert_eq!(target.get_status().await.unwrap(), InfraStatus::Running);

        let ep = target.get_endpoint().await.unwrap();
        assert_eq!(ep.host, "34.1.2.3");
        assert_eq!(ep.protocol, GatewayProtocol::Ws);
    }

    #[tokio::test]
    async fn missing_vm_is_not_installed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": { "status": "NOT_FOUND", "message": "instance not found" }
            })))
            .mount(&server)
            .await;

        let target = test_target(&server).await;
        assert_eq!(target.get_status().await.unwrap(), InfraStatus::NotInstalled);
    }

    #[test]
    fn vm_names_are_sanitized() {
        assert_eq!(vm_name("alpha"), "openclaw-alpha");
        assert_eq!(vm_name("Team Bot #1"), "openclaw-team-bot--1");
    }

    #[test]
    fn machine_type_mapping() {
        let target = GcpProviderConfig {
            project_id: "p".into(),
            default_zone: "z".into(),
            machine_type: "e2-medium".into(),
            source_image: "img".into(),
        };
        let t = GceTarget {
            config: target,
            base: GcpBaseUrls::default(),
            client: reqwest::Client::new(),
            token: std::sync::Arc::new(StaticToken("t".into())),
            project: "p".into(),
            zone: "z".into(),
            vm_name: "v".into(),
            profile_name: "p".into(),
            instance_id: "i".into(),
            gateway_port: 18789,
            log_cb: Mutex::new(None),
        };
        let spec = |cpus, memory_mb| ResourceSpec {
            cpus: Some(cpus),
            memory_mb: Some(memory_mb),
            disk_gb: None,
        };
        assert_eq!(t.machine_type_for(&spec(1.0, 2048)), "e2-small");
        assert_eq!(t.machine_type_for(&spec(2.0, 4096)), "e2-medium");
        assert_eq!(t.machine_type_for(&spec(4.0, 16384)), "e2-standard-4");
    }

    #[test]
    fn error_envelope_extraction() {
        let body = serde_json::json!({
            "error": { "status": "PERMISSION_DENIED", "message": "missing compute.instances.create" }
        });
        let msg = GceTarget::extract_error(&body);
        assert!(msg.contains("PERMISSION_DENIED"));
        assert!(msg.contains("compute.instances.create"));
    }
}
