use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use clawhub_domain::{BotInstance, DeploymentTargetRecord, DeploymentType, GatewayProtocol};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::TargetError;
use crate::registry::TargetProvider;
use crate::target::{
    DeploymentTarget, Endpoint, InfraStatus, InstallOptions, InstallResult, LogCallback,
    LogOptions, LogStream, ResourceSpec, ResourceUpdateOutcome,
};
use crate::transform::{prepare_agent_config, TransformOverrides};

const COMPUTE_API: &str = "2024-03-01";
const NETWORK_API: &str = "2023-09-01";
const RESOURCE_API: &str = "2022-09-01";
const MANAGED_TAG: &str = "clawhub-managed";
const INSTANCE_TAG: &str = "clawhub-instance";
const VNET_NAME: &str = "clawhub-vnet";
const NSG_NAME: &str = "clawhub-nsg";
const SUBNET_NAME: &str = "bots";
const VNET_CIDR: &str = "10.90.0.0/16";
const SUBNET_CIDR: &str = "10.90.1.0/24";

// ── Configuration ─────────────────────────────────────────────────────────────

/// Operator-level settings for the Azure VM backend.
/// Not stored in per-instance manifests — these are operator-level settings.
#[derive(Clone)]
pub struct AzureProviderConfig {
    /// Azure tenant ID (GUID).
    pub tenant_id: String,
    /// Subscription hosting all bot VMs.
    pub subscription_id: String,
    /// Default region for new resources, e.g. "eastus2".
    pub default_location: String,
    /// Default VM size.
    pub vm_size: String,
    /// Image carrying the agent runtime (full resource ID).
    pub image_id: String,
    pub admin_username: String,
    pub ssh_public_key: Option<String>,
    /// Service principal client ID (absent: fail fast at token time).
    pub client_id: Option<String>,
    /// Service principal client secret.
    pub client_secret: Option<String>,
}

// ── Base URLs (overridden in tests) ───────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct AzureBaseUrls {
    pub(crate) management: String,
    pub(crate) login: String,
}

impl Default for AzureBaseUrls {
    fn default() -> Self {
        Self {
            management: "https://management.azure.com".into(),
            login: "https://login.microsoftonline.com".into(),
        }
    }
}

// ── Token provider ────────────────────────────────────────────────────────────

/// Abstraction over Azure token acquisition — enables test injection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, TargetError>;
}

/// Client-credentials flow for a service principal, with expiry caching.
pub struct ServicePrincipalTokenProvider {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    login_base: String,
    client: reqwest::Client,
    cache: AsyncMutex<Option<(String, Instant)>>,
}

impl ServicePrincipalTokenProvider {
    pub fn new(tenant_id: String, client_id: String, client_secret: String) -> Self {
        Self {
            tenant_id,
            client_id,
            client_secret,
            login_base: AzureBaseUrls::default().login,
            client: reqwest::Client::new(),
            cache: AsyncMutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for ServicePrincipalTokenProvider {
    async fn token(&self) -> Result<String, TargetError> {
        {
            let guard = self.cache.lock().await;
            if let Some((token, expiry)) = guard.as_ref() {
                if Instant::now() < *expiry {
                    return Ok(token.clone());
                }
            }
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id);
        let resp: Value = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://management.azure.com/.default"),
            ])
            .send()
            .await
            .map_err(|e| TargetError::Internal(format!("azure token request: {}", e)))?
            .json()
            .await
            .map_err(|e| TargetError::Internal(format!("azure token decode: {}", e)))?;

        let token = resp["access_token"]
            .as_str()
            .ok_or_else(|| {
                TargetError::Internal(format!(
                    "azure token error: {}",
                    resp["error_description"].as_str().unwrap_or("no access_token")
                ))
            })?
            .to_string();
        let ttl = resp["expires_in"].as_u64().unwrap_or(3600).saturating_sub(60);

        let mut guard = self.cache.lock().await;
        *guard = Some((token.clone(), Instant::now() + Duration::from_secs(ttl)));
        Ok(token)
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

pub struct AzureVmProvider {
    config: AzureProviderConfig,
    client: reqwest::Client,
    token: std::sync::Arc<dyn TokenProvider>,
    base: AzureBaseUrls,
}

impl AzureVmProvider {
    pub fn new(config: AzureProviderConfig) -> Result<Self, TargetError> {
        let (Some(client_id), Some(client_secret)) =
            (config.client_id.clone(), config.client_secret.clone())
        else {
            return Err(TargetError::Internal(
                "azure provider requires a service principal (client_id + client_secret)"
                    .to_string(),
            ));
        };
        let token = std::sync::Arc::new(ServicePrincipalTokenProvider::new(
            config.tenant_id.clone(),
            client_id,
            client_secret,
        ));
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            token,
            base: AzureBaseUrls::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_static_token(
        config: AzureProviderConfig,
        token: &str,
        base: AzureBaseUrls,
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
impl TargetProvider for AzureVmProvider {
    fn deployment_type(&self) -> DeploymentType {
        DeploymentType::AzureVm
    }

    async fn target_for(
        &self,
        instance: &BotInstance,
        record: Option<&DeploymentTargetRecord>,
    ) -> Result<Box<dyn DeploymentTarget>, TargetError> {
        let location = record
            .and_then(|r| r.region.clone())
            .unwrap_or_else(|| self.config.default_location.clone());

        Ok(Box::new(AzureVmTarget {
            config: self.config.clone(),
            base: self.base.clone(),
            client: self.client.clone(),
            token: self.token.clone(),
            location: location.clone(),
            resource_group: format!("clawhub-shared-{}", location),
            vm_name: resource_name(&instance.profile_name),
            profile_name: instance.profile_name.clone(),
            instance_id: instance.id.to_string(),
            gateway_port: instance.gateway_port,
            log_cb: Mutex::new(None),
        }))
    }
}

/// Azure resource names: letters, digits, hyphens; at most 60 chars here.
fn resource_name(profile: &str) -> String {
    let mut safe: String = profile
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    safe.truncate(50);
    format!("openclaw-{}", safe.trim_matches('-'))
}

// ── Target ────────────────────────────────────────────────────────────────────

/// One instance's Azure virtual machine, driven through ARM.
pub struct AzureVmTarget {
    config: AzureProviderConfig,
    base: AzureBaseUrls,
    client: reqwest::Client,
    token: std::sync::Arc<dyn TokenProvider>,
    location: String,
    resource_group: String,
    vm_name: String,
    profile_name: String,
    instance_id: String,
    gateway_port: u16,
    log_cb: Mutex<Option<LogCallback>>,
}

impl AzureVmTarget {
    fn emit(&self, line: &str) {
        if let Ok(guard) = self.log_cb.lock() {
            if let Some(cb) = guard.as_ref() {
                cb(line, LogStream::Stdout);
            }
        }
    }

    fn rg_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}",
            self.base.management, self.config.subscription_id, self.resource_group
        )
    }

    fn vm_url(&self) -> String {
        format!(
            "{}/providers/Microsoft.Compute/virtualMachines/{}",
            self.rg_url(),
            self.vm_name
        )
    }

    fn network_url(&self, kind: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Network/{}/{}",
            self.rg_url(),
            kind,
            name
        )
    }

    fn extract_error(body: &Value) -> String {
        let err = &body["error"];
        let code = err["code"].as_str().unwrap_or("Unknown");
        let message = err["message"].as_str().unwrap_or("unknown error");
        format!("{}: {}", code, message)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        api_version: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Value), TargetError> {
        let token = self.token.token().await?;
        let full = format!("{}?api-version={}", url, api_version);
        let mut req = self.client.request(method, &full).bearer_auth(&token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TargetError::Internal(format!("{}: {}", full, e)))?;
        let status = resp.status().as_u16();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    /// Poll a resource GET until `properties.provisioningState` settles.
    ///
    /// Backoff: 2 s, 4 s, 8 s, 15 s, 15 s, … (max 80 polls).
    async fn wait_provisioned(&self, url: &str, api_version: &str) -> Result<(), TargetError> {
        let delays = [2u64, 4, 8, 15];
        let max_polls = 80;
        for (i, &delay) in delays.iter().cycle().take(max_polls).enumerate() {
            let (status, body) = self.request(reqwest::Method::GET, url, api_version, None).await?;
            if status >= 400 {
                return Err(TargetError::Internal(Self::extract_error(&body)));
            }
            match body["properties"]["provisioningState"].as_str() {
                Some("Succeeded") => return Ok(()),
                Some("Failed") | Some("Canceled") => {
                    return Err(TargetError::InstallFailed(format!(
                        "provisioning ended in {}",
                        body["properties"]["provisioningState"]
                    )));
                }
                _ => {}
            }
            if (i + 1) % 10 == 0 {
                info!(poll = i + 1, url, "still waiting for Azure provisioning");
            }
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        Err(TargetError::InstallFailed(format!(
            "Azure provisioning timed out: {}",
            url
        )))
    }

    /// PUT a resource and wait until it reports Succeeded.
    async fn put_and_wait(
        &self,
        url: &str,
        api_version: &str,
        body: &Value,
    ) -> Result<(), TargetError> {
        let (status, resp) = self
            .request(reqwest::Method::PUT, url, api_version, Some(body))
            .await?;
        if status >= 400 {
            return Err(TargetError::InstallFailed(Self::extract_error(&resp)));
        }
        self.wait_provisioned(url, api_version).await
    }

    async fn ensure_shared_network(&self) -> Result<(), TargetError> {
        // Resource group: PUT is idempotent.
        let (status, body) = self
            .request(
                reqwest::Method::PUT,
                &self.rg_url(),
                RESOURCE_API,
                Some(&json!({
                    "location": self.location,
                    "tags": { "clawhub-shared": "true" },
                })),
            )
            .await?;
        if status >= 400 {
            return Err(TargetError::InstallFailed(Self::extract_error(&body)));
        }

        // NSG with the gateway ingress rule.
        let nsg_url = self.network_url("networkSecurityGroups", NSG_NAME);
        let (status, _) = self.request(reqwest::Method::GET, &nsg_url, NETWORK_API, None).await?;
        if status == 404 {
            self.emit("creating shared network security group");
            self.put_and_wait(
                &nsg_url,
                NETWORK_API,
                &json!({
                    "location": self.location,
                    "properties": {
                        "securityRules": [{
                            "name": "allow-gateway",
                            "properties": {
                                "priority": 1000,
                                "direction": "Inbound",
                                "access": "Allow",
                                "protocol": "Tcp",
                                "sourcePortRange": "*",
                                "destinationPortRange": self.gateway_port.to_string(),
                                "sourceAddressPrefix": "*",
                                "destinationAddressPrefix": "*",
                            }
                        }]
                    }
                }),
            )
            .await?;
        }

        // VNet with one subnet bound to the NSG.
        let vnet_url = self.network_url("virtualNetworks", VNET_NAME);
        let (status, _) = self.request(reqwest::Method::GET, &vnet_url, NETWORK_API, None).await?;
        if status == 404 {
            self.emit("creating shared virtual network");
            let nsg_id = format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/networkSecurityGroups/{}",
                self.config.subscription_id, self.resource_group, NSG_NAME
            );
            self.put_and_wait(
                &vnet_url,
                NETWORK_API,
                &json!({
                    "location": self.location,
                    "properties": {
                        "addressSpace": { "addressPrefixes": [VNET_CIDR] },
                        "subnets": [{
                            "name": SUBNET_NAME,
                            "properties": {
                                "addressPrefix": SUBNET_CIDR,
                                "networkSecurityGroup": { "id": nsg_id },
                            }
                        }]
                    }
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// First-boot cloud-init: fetch nothing — the config arrives via
    /// `configure`'s run-command; the script just installs and enables the
    /// agent.
    fn custom_data(&self, opts: &InstallOptions) -> String {
        let mut exports = String::new();
        for (k, v) in &opts.env_vars {
            exports.push_str(&format!("export {}='{}'\n", k, v.replace('\'', "'\\''")));
        }
        if let Some(token) = &opts.auth_token {
            exports.push_str(&format!("export OPENCLAW_GATEWAY_TOKEN='{}'\n", token));
        }
        let script = format!(
            "#!/bin/bash\nset -euo pipefail\n{exports}\
             mkdir -p /var/lib/openclaw/{profile}\n\
             openclaw-agent install --profile {profile} --version {version} --port {port}\n\
             systemctl enable --now openclaw-agent@{profile}\n",
            exports = exports,
            profile = opts.profile_name,
            version = opts.version,
            port = opts.port,
        );
        base64::engine::general_purpose::STANDARD.encode(script)
    }

    async fn vm_instance_view(&self) -> Result<Option<Value>, TargetError> {
        let url = format!("{}/instanceView", self.vm_url());
        let (status, body) = self.request(reqwest::Method::GET, &url, COMPUTE_API, None).await?;
        if status == 404 {
            return Ok(None);
        }
        if status >= 400 {
            return Err(TargetError::Internal(Self::extract_error(&body)));
        }
        Ok(Some(body))
    }

    fn power_state(view: &Value) -> Option<&str> {
        view["statuses"].as_array().and_then(|statuses| {
            statuses
                .iter()
                .filter_map(|s| s["code"].as_str())
                .find_map(|code| code.strip_prefix("PowerState/"))
        })
    }

    /// POST a VM lifecycle action (start/restart/deallocate). ARM answers
    /// 202; completion is observed through the instance view.
    async fn vm_action(&self, action: &str) -> Result<(), TargetError> {
        let url = format!("{}/{}", self.vm_url(), action);
        let (status, body) = self.request(reqwest::Method::POST, &url, COMPUTE_API, None).await?;
        if status >= 400 {
            return Err(TargetError::Internal(Self::extract_error(&body)));
        }
        Ok(())
    }

    async fn no_managed_vms_remain(&self) -> Result<bool, TargetError> {
        let url = format!(
            "{}/providers/Microsoft.Compute/virtualMachines",
            self.rg_url()
        );
        let (status, body) = self.request(reqwest::Method::GET, &url, COMPUTE_API, None).await?;
        if status == 404 {
            return Ok(true);
        }
        if status >= 400 {
            return Ok(false);
        }
        let remaining = body["value"].as_array().map_or(0, |vms| {
            vms.iter()
                .filter(|vm| vm["tags"][MANAGED_TAG].as_str() == Some("true"))
                .count()
        });
        Ok(remaining == 0)
    }

    fn vm_size_for(&self, spec: &ResourceSpec) -> String {
        let cpus = spec.cpus.unwrap_or(2.0);
        let memory_mb = spec.memory_mb.unwrap_or(4096);
        let name = match (cpus, memory_mb) {
            (c, m) if c <= 1.0 && m <= 2048 => "Standard_B1ms",
            (c, m) if c <= 2.0 && m <= 4096 => "Standard_B2s",
            (c, m) if c <= 2.0 && m <= 8192 => "Standard_B2ms",
            (c, m) if c <= 4.0 && m <= 16384 => "Standard_B4ms",
            _ => "Standard_B8ms",
        };
        name.to_string()
    }
}

#[async_trait]
impl DeploymentTarget for AzureVmTarget {
    async fn install(&self, opts: &InstallOptions) -> Result<InstallResult, TargetError> {
        self.ensure_shared_network().await?;

        let (status, existing) = self
            .request(reqwest::Method::GET, &self.vm_url(), COMPUTE_API, None)
            .await?;
        if status == 200 {
            debug!(vm = %self.vm_name, "VM already provisioned");
            let id = existing["id"].as_str().unwrap_or(&self.vm_name);
            return Ok(InstallResult {
                instance_ref: id.to_string(),
            });
        }

        // Public IP, then NIC, then the VM itself. Associated resources are
        // tagged for deletion with the VM.
        let pip_name = format!("{}-pip", self.vm_name);
        let pip_url = self.network_url("publicIPAddresses", &pip_name);
        self.emit("allocating public IP");
        self.put_and_wait(
            &pip_url,
            NETWORK_API,
            &json!({
                "location": self.location,
                "sku": { "name": "Standard" },
                "properties": { "publicIPAllocationMethod": "Static" },
                "tags": { MANAGED_TAG: "true", INSTANCE_TAG: self.instance_id },
            }),
        )
        .await?;

        let subnet_id = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
            self.config.subscription_id, self.resource_group, VNET_NAME, SUBNET_NAME
        );
        let pip_id = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/publicIPAddresses/{}",
            self.config.subscription_id, self.resource_group, pip_name
        );
        let nic_name = format!("{}-nic", self.vm_name);
        let nic_url = self.network_url("networkInterfaces", &nic_name);
        self.put_and_wait(
            &nic_url,
            NETWORK_API,
            &json!({
                "location": self.location,
                "properties": {
                    "ipConfigurations": [{
                        "name": "primary",
                        "properties": {
                            "subnet": { "id": subnet_id },
                            "publicIPAddress": { "id": pip_id },
                        }
                    }]
                },
                "tags": { MANAGED_TAG: "true", INSTANCE_TAG: self.instance_id },
            }),
        )
        .await?;

        self.emit(&format!("creating VM {} in {}", self.vm_name, self.location));
        let nic_id = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/networkInterfaces/{}",
            self.config.subscription_id, self.resource_group, nic_name
        );
        let mut os_profile = json!({
            "computerName": self.vm_name,
            "adminUsername": self.config.admin_username,
            "customData": self.custom_data(opts),
        });
        if let Some(key) = &self.config.ssh_public_key {
            os_profile["linuxConfiguration"] = json!({
                "disablePasswordAuthentication": true,
                "ssh": { "publicKeys": [{
                    "path": format!("/home/{}/.ssh/authorized_keys", self.config.admin_username),
                    "keyData": key,
                }]}
            });
        }

        let body = json!({
            "location": self.location,
            "properties": {
                "hardwareProfile": { "vmSize": self.config.vm_size },
                "storageProfile": {
                    "imageReference": { "id": self.config.image_id },
                    "osDisk": {
                        "createOption": "FromImage",
                        "deleteOption": "Delete",
                    }
                },
                "osProfile": os_profile,
                "networkProfile": {
                    "networkInterfaces": [{
                        "id": nic_id,
                        "properties": { "deleteOption": "Delete" },
                    }]
                },
                "diagnosticsProfile": { "bootDiagnostics": { "enabled": true } },
            },
            "tags": { MANAGED_TAG: "true", INSTANCE_TAG: self.instance_id },
        });
        self.put_and_wait(&self.vm_url(), COMPUTE_API, &body).await?;

        info!(vm = %self.vm_name, location = %self.location, "created VM");
        Ok(InstallResult {
            instance_ref: format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
                self.config.subscription_id, self.resource_group, self.vm_name
            ),
        })
    }

    async fn configure(
        &self,
        profile_name: &str,
        _port: u16,
        config: &Value,
        _env: &HashMap<String, String>,
    ) -> Result<(), TargetError> {
        let prepared = prepare_agent_config(
            config,
            TransformOverrides::for_deployment(DeploymentType::AzureVm),
        );
        let payload = base64::engine::general_purpose::STANDARD.encode(prepared.to_string());

        // Write the config onto the VM's disk so restarts bootstrap from it.
        let url = format!("{}/runCommand", self.vm_url());
        let body = json!({
            "commandId": "RunShellScript",
            "script": [
                format!("mkdir -p /var/lib/openclaw/{}", profile_name),
                format!(
                    "echo '{}' | base64 -d > /var/lib/openclaw/{}/config.json",
                    payload, profile_name
                ),
            ]
        });
        let (status, resp) = self
            .request(reqwest::Method::POST, &url, COMPUTE_API, Some(&body))
            .await?;
        if status >= 400 {
            return Err(TargetError::ConfigureFailed(Self::extract_error(&resp)));
        }
        debug!(vm = %self.vm_name, "persisted agent config to VM disk");
        Ok(())
    }

    async fn start(&self) -> Result<(), TargetError> {
        self.vm_action("start")
            .await
            .map_err(|e| TargetError::StartFailed(e.to_string()))
    }

    async fn stop(&self) -> Result<(), TargetError> {
        match self.vm_action("deallocate").await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("NotFound") => Ok(()),
            Err(e) => Err(TargetError::StopFailed(e.to_string())),
        }
    }

    async fn restart(&self) -> Result<(), TargetError> {
        self.vm_action("restart")
            .await
            .map_err(|e| TargetError::StartFailed(e.to_string()))
    }

    async fn get_status(&self) -> Result<InfraStatus, TargetError> {
        match self.vm_instance_view().await {
            Ok(None) => Ok(InfraStatus::NotInstalled),
            Ok(Some(view)) => Ok(match Self::power_state(&view) {
                Some("running") => InfraStatus::Running,
                Some("stopped") | Some("deallocated") | Some("stopping")
                | Some("deallocating") => InfraStatus::Stopped,
                Some("starting") => InfraStatus::Unknown,
                Some(other) => InfraStatus::Error(format!("unexpected power state {}", other)),
                None => InfraStatus::Unknown,
            }),
            Err(e) => Ok(InfraStatus::Error(e.to_string())),
        }
    }

    async fn get_endpoint(&self) -> Result<Endpoint, TargetError> {
        let pip_url = self.network_url("publicIPAddresses", &format!("{}-pip", self.vm_name));
        let (status, body) = self.request(reqwest::Method::GET, &pip_url, NETWORK_API, None).await?;
        if status >= 400 {
            return Err(TargetError::EndpointUnavailable(Self::extract_error(&body)));
        }
        let host = body["properties"]["ipAddress"]
            .as_str()
            .ok_or_else(|| {
                TargetError::EndpointUnavailable("no public IP assigned yet".to_string())
            })?
            .to_string();
        Ok(Endpoint {
            host,
            port: self.gateway_port,
            protocol: GatewayProtocol::Ws,
        })
    }

    async fn destroy(&self) -> Result<(), TargetError> {
        // NIC, disk and public IP carry deleteOption=Delete and go with the VM.
        let (status, body) = self
            .request(reqwest::Method::DELETE, &self.vm_url(), COMPUTE_API, None)
            .await?;
        if status >= 400 && status != 404 {
            return Err(TargetError::DestroyFailed(Self::extract_error(&body)));
        }
        if status != 404 {
            self.emit(&format!("deleted VM {}", self.vm_name));
        }

        // The shared resource group (VNet + NSG inside) goes only when the
        // last managed VM is gone.
        if self.no_managed_vms_remain().await? {
            let (status, body) = self
                .request(reqwest::Method::DELETE, &self.rg_url(), RESOURCE_API, None)
                .await?;
            if status < 400 {
                info!(resource_group = %self.resource_group, "removed orphaned shared resource group");
            } else if status != 404 {
                warn!(
                    error = %Self::extract_error(&body),
                    "shared resource group still in use; skipping"
                );
            }
        }
        Ok(())
    }

    async fn get_logs(&self, opts: &LogOptions) -> Result<Vec<String>, TargetError> {
        let url = format!("{}/retrieveBootDiagnosticsData", self.vm_url());
        let (status, body) = self.request(reqwest::Method::POST, &url, COMPUTE_API, None).await?;
        if status >= 400 {
            return Err(TargetError::LogsUnavailable(Self::extract_error(&body)));
        }
        let blob_uri = body["serialConsoleLogBlobUri"].as_str().ok_or_else(|| {
            TargetError::LogsUnavailable("no serial console log available".to_string())
        })?;

        // The blob URI is pre-signed; no bearer token.
        let text = self
            .client
            .get(blob_uri)
            .send()
            .await
            .map_err(|e| TargetError::LogsUnavailable(e.to_string()))?
            .text()
            .await
            .unwrap_or_default();
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let tail = opts.tail.unwrap_or(100) as usize;
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].to_vec())
    }

    async fn update_resources(
        &self,
        spec: &ResourceSpec,
    ) -> Result<ResourceUpdateOutcome, TargetError> {
        let size = self.vm_size_for(spec);

        self.stop().await?;
        let body = json!({ "properties": { "hardwareProfile": { "vmSize": size } } });
        let (status, resp) = self
            .request(reqwest::Method::PATCH, &self.vm_url(), COMPUTE_API, Some(&body))
            .await?;
        if status >= 400 {
            return Err(TargetError::Internal(Self::extract_error(&resp)));
        }
        self.start().await?;

        info!(vm = %self.vm_name, size = %size, "resized VM");
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

    fn test_config() -> AzureProviderConfig {
        AzureProviderConfig {
            tenant_id: "11111111-1111-1111-1111-111111111111".into(),
            subscription_id: "sub-1".into(),
            default_location: "eastus2".into(),
            vm_size: "Standard_B2s".into(),
            image_id: "/communityGalleries/clawhub/images/openclaw/versions/latest".into(),
            admin_username: "openclaw".into(),
            ssh_public_key: None,
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
        }
    }

    /// Built through the provider, the way the lifecycle manager does it.
    async fn test_target(server: &MockServer) -> Box<dyn DeploymentTarget> {
        let provider = AzureVmProvider::with_static_token(
            test_config(),
            "token",
            AzureBaseUrls {
                management: server.uri(),
                login: server.uri(),
            },
        );
        let instance = BotInstance::new(
            "bot-1",
            "alpha",
            DeploymentType::AzureVm,
            chrono::Utc::now(),
        );
        provider.target_for(&instance, None).await.unwrap()
    }

    #[tokio::test]
    async fn status_maps_power_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/subscriptions/sub-1/resourceGroups/clawhub-shared-eastus2/providers/Microsoft.Compute/virtualMachines/openclaw-alpha/instanceView",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "statuses": [
                    { "code": "ProvisioningState/succeeded" },
                    { "code": "PowerState/running" },
                ]
            })))
            .mount(&server)
            .await;

        let target = test_target(&server).await;
        assert_eq!(target.get_status().await.unwrap(), InfraStatus::Running);
    }

    #[tokio::test]
    async fn endpoint_reads_public_ip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/subscriptions/sub-1/resourceGroups/clawhub-shared-eastus2/providers/Microsoft.Network/publicIPAddresses/openclaw-alpha-pip",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "properties": { "ipAddress": "20.1.2.3" }
            })))
            .mount(&server)
            .await;

        let target = test_target(&server).await;
        let ep = target.get_endpoint().await.unwrap();
        assert_eq!(ep.host, "20.1.2.3");
        assert_eq!(ep.port, 18789);
    }

    #[test]
    fn resource_names_are_sanitized() {
        assert_eq!(resource_name("alpha"), "openclaw-alpha");
        assert_eq!(resource_name("Team Bot"), "openclaw-team-bot");
    }

    #[test]
    fn vm_size_mapping() {
        let target = test_config();
        let t = AzureVmTarget {
            config: target,
            base: AzureBaseUrls::default(),
            client: reqwest::Client::new(),
            token: std::sync::Arc::new(StaticToken("t".into())),
            location: "eastus2".into(),
            resource_group: "rg".into(),
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
        assert_eq!(t.vm_size_for(&spec(1.0, 2048)), "Standard_B1ms");
        assert_eq!(t.vm_size_for(&spec(2.0, 4096)), "Standard_B2s");
        assert_eq!(t.vm_size_for(&spec(4.0, 8192)), "Standard_B4ms");
    }

    #[test]
    fn power_state_extraction() {
        let view = serde_json::json!({
            "statuses": [
                { "code": "ProvisioningState/succeeded" },
                { "code": "PowerState/deallocated" },
            ]
        });
        assert_eq!(AzureVmTarget::power_state(&view), Some("deallocated"));
    }
}
