use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use clawhub_domain::{BotInstance, DeploymentTargetRecord, DeploymentType, GatewayProtocol};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::error::TargetError;
use crate::registry::TargetProvider;
use crate::target::{
    DeploymentTarget, Endpoint, InfraStatus, InstallOptions, InstallResult, LogCallback,
    LogOptions, LogStream, ResourceSpec, ResourceUpdateOutcome,
};
use crate::transform::{prepare_agent_config, TransformOverrides};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const NETWORK_NAME: &str = "clawhub";
const MANAGED_LABEL: &str = "clawhub-managed";
const INSTANCE_LABEL: &str = "clawhub-instance";
/// The secure container runtime. Mandatory outside dev mode: agent workloads
/// execute untrusted tool output.
const SECURE_RUNTIME: &str = "runsc";

// ── Provider ──────────────────────────────────────────────────────────────────

/// Operator-level settings for the local Docker backend.
pub struct LocalDockerProvider {
    pub socket_path: PathBuf,
    /// Host directory bind-mounted into containers for config and state.
    pub data_dir: PathBuf,
    /// Permits the default runtime (with a loud warning) when the secure
    /// runtime is unavailable.
    pub dev_mode: bool,
}

impl LocalDockerProvider {
    pub fn new(data_dir: PathBuf, dev_mode: bool) -> Self {
        Self {
            socket_path: PathBuf::from(DOCKER_SOCKET),
            data_dir,
            dev_mode,
        }
    }
}

#[async_trait]
impl TargetProvider for LocalDockerProvider {
    fn deployment_type(&self) -> DeploymentType {
        DeploymentType::LocalDocker
    }

    async fn target_for(
        &self,
        instance: &BotInstance,
        _record: Option<&DeploymentTargetRecord>,
    ) -> Result<Box<dyn DeploymentTarget>, TargetError> {
        Ok(Box::new(DockerTarget {
            socket_path: self.socket_path.clone(),
            data_dir: self.data_dir.clone(),
            dev_mode: self.dev_mode,
            container_name: container_name(&instance.profile_name),
            profile_name: instance.profile_name.clone(),
            instance_id: instance.id.to_string(),
            host_port: instance.gateway_port,
            log_cb: Mutex::new(None),
        }))
    }
}

fn container_name(profile: &str) -> String {
    let safe: String = profile
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("openclaw-{}", safe)
}

// ── Target ────────────────────────────────────────────────────────────────────

/// One instance's container on the local Docker daemon, driven over the
/// Engine API on the unix socket.
pub struct DockerTarget {
    socket_path: PathBuf,
    data_dir: PathBuf,
    dev_mode: bool,
    container_name: String,
    profile_name: String,
    instance_id: String,
    host_port: u16,
    log_cb: Mutex<Option<LogCallback>>,
}

impl DockerTarget {
    fn emit(&self, line: &str, stream: LogStream) {
        if let Ok(guard) = self.log_cb.lock() {
            if let Some(cb) = guard.as_ref() {
                cb(line, stream);
            }
        }
    }

    /// Issue one Engine API request over the unix socket.
    ///
    /// `Connection: close` keeps the protocol trivial: write the request,
    /// read to EOF, de-chunk if needed.
    async fn docker_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Vec<u8>), TargetError> {
        let io = async {
            let mut stream = UnixStream::connect(&self.socket_path).await?;

            let body_str = body.map(|b| b.to_string()).unwrap_or_default();
            let request = format!(
                "{} {} HTTP/1.1\r\nHost: docker\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                method,
                path,
                body_str.len(),
                body_str
            );
            stream.write_all(request.as_bytes()).await?;

            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await?;
            Ok::<Vec<u8>, std::io::Error>(raw)
        };

        let raw = tokio::time::timeout(Duration::from_secs(120), io)
            .await
            .map_err(|_| TargetError::Internal("docker request timed out".to_string()))?
            .map_err(|e| TargetError::Internal(format!("docker socket: {}", e)))?;

        parse_http_response(&raw)
    }

    async fn docker_json(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Value), TargetError> {
        let (status, bytes) = self.docker_request(method, path, body).await?;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok((status, value))
    }

    fn config_dir(&self) -> PathBuf {
        self.data_dir.join(&self.profile_name)
    }

    /// Resolve the runtime to request on container creation: the secure
    /// runtime when the daemon offers it, otherwise fail (or warn in dev
    /// mode and fall back to the default runtime).
    async fn resolve_runtime(&self) -> Result<Option<String>, TargetError> {
        let (status, info) = self.docker_json("GET", "/info", None).await?;
        if status >= 400 {
            return Err(TargetError::InstallFailed(format!(
                "docker info returned {}",
                status
            )));
        }
        let has_secure = info["Runtimes"]
            .as_object()
            .map_or(false, |r| r.contains_key(SECURE_RUNTIME));

        if has_secure {
            return Ok(Some(SECURE_RUNTIME.to_string()));
        }
        if self.dev_mode {
            warn!(
                container = %self.container_name,
                "secure runtime '{}' unavailable; continuing with the default \
                 runtime because dev mode is enabled. DO NOT run untrusted \
                 workloads this way.",
                SECURE_RUNTIME
            );
            self.emit(
                &format!("WARNING: secure runtime '{}' unavailable, using default runtime", SECURE_RUNTIME),
                LogStream::Stderr,
            );
            return Ok(None);
        }
        Err(TargetError::InstallFailed(format!(
            "secure container runtime '{}' is not installed on the docker daemon \
             (install gVisor, or enable dev mode to override)",
            SECURE_RUNTIME
        )))
    }

    async fn ensure_image(&self, version: &str) -> Result<String, TargetError> {
        let image = format!("ghcr.io/openclaw/openclaw:{}", version);
        let path = format!(
            "/images/create?fromImage={}&tag={}",
            encode_query("ghcr.io/openclaw/openclaw"),
            encode_query(version)
        );
        self.emit(&format!("pulling image {}", image), LogStream::Stdout);
        let (status, bytes) = self.docker_request("POST", &path, None).await?;
        if status >= 400 {
            return Err(TargetError::InstallFailed(format!(
                "image pull failed ({}): {}",
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }
        // Pull progress arrives as JSON lines; surface them to the operator.
        for line in String::from_utf8_lossy(&bytes).lines() {
            if let Ok(progress) = serde_json::from_str::<Value>(line) {
                if let Some(s) = progress["status"].as_str() {
                    self.emit(s, LogStream::Stdout);
                }
            }
        }
        Ok(image)
    }

    async fn ensure_network(&self) -> Result<(), TargetError> {
        let (status, _) = self
            .docker_json("GET", &format!("/networks/{}", NETWORK_NAME), None)
            .await?;
        if status == 404 {
            let body = json!({
                "Name": NETWORK_NAME,
                "Labels": { MANAGED_LABEL: "true" },
            });
            let (status, resp) = self.docker_json("POST", "/networks/create", Some(&body)).await?;
            // 409: created concurrently by another reconcile; fine.
            if status >= 400 && status != 409 {
                return Err(TargetError::InstallFailed(format!(
                    "network create failed ({}): {}",
                    status, resp
                )));
            }
            debug!(network = NETWORK_NAME, "created bridge network");
        }
        Ok(())
    }

    /// True when no clawhub-managed containers remain on the daemon.
    async fn no_managed_containers_remain(&self) -> Result<bool, TargetError> {
        let filters = format!("{{\"label\":[\"{}=true\"]}}", MANAGED_LABEL);
        let path = format!("/containers/json?all=true&filters={}", encode_query(&filters));
        let (status, list) = self.docker_json("GET", &path, None).await?;
        if status >= 400 {
            return Ok(false);
        }
        Ok(list.as_array().map_or(false, |a| a.is_empty()))
    }
}

#[async_trait]
impl DeploymentTarget for DockerTarget {
    async fn install(&self, opts: &InstallOptions) -> Result<InstallResult, TargetError> {
        let image = self.ensure_image(&opts.version).await?;
        self.ensure_network().await?;
        let runtime = self.resolve_runtime().await?;

        // Already created: install is idempotent.
        let (status, existing) = self
            .docker_json("GET", &format!("/containers/{}/json", self.container_name), None)
            .await?;
        if status == 200 {
            let id = existing["Id"].as_str().unwrap_or(&self.container_name);
            debug!(container = %self.container_name, "container already exists");
            return Ok(InstallResult {
                instance_ref: id.to_string(),
            });
        }

        let mut env: Vec<String> = opts
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("OPENCLAW_PROFILE={}", opts.profile_name));
        env.push(format!("OPENCLAW_GATEWAY_PORT={}", opts.port));
        if let Some(token) = &opts.auth_token {
            env.push(format!("OPENCLAW_GATEWAY_TOKEN={}", token));
        }

        let container_port = format!("{}/tcp", opts.port);
        let mut host_config = json!({
            "Binds": [format!(
                "{}:/var/lib/openclaw/{}",
                self.config_dir().display(),
                opts.profile_name
            )],
            "NetworkMode": NETWORK_NAME,
            "PortBindings": {
                container_port.as_str(): [{ "HostPort": self.host_port.to_string() }]
            },
            "RestartPolicy": { "Name": "unless-stopped" },
        });
        if let Some(rt) = &runtime {
            host_config["Runtime"] = json!(rt);
        }

        let body = json!({
            "Image": image,
            "Env": env,
            "Labels": {
                MANAGED_LABEL: "true",
                INSTANCE_LABEL: &self.instance_id,
                "clawhub-profile": &opts.profile_name,
            },
            "ExposedPorts": { container_port.as_str(): {} },
            "HostConfig": host_config,
        });

        let path = format!("/containers/create?name={}", encode_query(&self.container_name));
        let (status, resp) = self.docker_json("POST", &path, Some(&body)).await?;
        if status >= 400 {
            return Err(TargetError::InstallFailed(format!(
                "container create failed ({}): {}",
                status, resp["message"]
            )));
        }

        let id = resp["Id"].as_str().unwrap_or(&self.container_name).to_string();
        info!(container = %self.container_name, id = %id, "created container");
        self.emit(&format!("created container {}", self.container_name), LogStream::Stdout);
        Ok(InstallResult { instance_ref: id })
    }

    async fn configure(
        &self,
        profile_name: &str,
        _port: u16,
        config: &Value,
        env: &HashMap<String, String>,
    ) -> Result<(), TargetError> {
        let prepared = prepare_agent_config(
            config,
            TransformOverrides::for_deployment(DeploymentType::LocalDocker),
        );

        let dir = self.config_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TargetError::ConfigureFailed(format!("mkdir {}: {}", dir.display(), e)))?;

        let config_path = dir.join("config.json");
        let payload = serde_json::to_vec_pretty(&prepared)
            .map_err(|e| TargetError::ConfigureFailed(e.to_string()))?;
        tokio::fs::write(&config_path, payload)
            .await
            .map_err(|e| TargetError::ConfigureFailed(format!("write {}: {}", config_path.display(), e)))?;

        if !env.is_empty() {
            let env_lines: String = env
                .iter()
                .map(|(k, v)| format!("{}={}\n", k, v))
                .collect();
            tokio::fs::write(dir.join("agent.env"), env_lines)
                .await
                .map_err(|e| TargetError::ConfigureFailed(e.to_string()))?;
        }

        debug!(profile = profile_name, path = %config_path.display(), "wrote agent config");
        Ok(())
    }

    async fn start(&self) -> Result<(), TargetError> {
        let path = format!("/containers/{}/start", self.container_name);
        let (status, body) = self.docker_json("POST", &path, None).await?;
        // 304: already running.
        if status >= 400 && status != 304 {
            return Err(TargetError::StartFailed(format!(
                "({}): {}",
                status, body["message"]
            )));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TargetError> {
        let path = format!("/containers/{}/stop?t=10", self.container_name);
        let (status, body) = self.docker_json("POST", &path, None).await?;
        // 304: already stopped; 404: never installed.
        if status >= 400 && status != 304 && status != 404 {
            return Err(TargetError::StopFailed(format!(
                "({}): {}",
                status, body["message"]
            )));
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), TargetError> {
        let path = format!("/containers/{}/restart?t=10", self.container_name);
        let (status, body) = self.docker_json("POST", &path, None).await?;
        if status >= 400 {
            return Err(TargetError::StartFailed(format!(
                "restart ({}): {}",
                status, body["message"]
            )));
        }
        Ok(())
    }

    async fn get_status(&self) -> Result<InfraStatus, TargetError> {
        let path = format!("/containers/{}/json", self.container_name);
        let (status, body) = self.docker_json("GET", &path, None).await?;
        if status == 404 {
            return Ok(InfraStatus::NotInstalled);
        }
        if status >= 400 {
            return Ok(InfraStatus::Unknown);
        }
        let state = &body["State"];
        if state["Running"].as_bool() == Some(true) {
            return Ok(InfraStatus::Running);
        }
        match state["Status"].as_str() {
            Some("created") | Some("exited") | Some("paused") => Ok(InfraStatus::Stopped),
            Some("dead") => Ok(InfraStatus::Error(
                state["Error"].as_str().unwrap_or("container dead").to_string(),
            )),
            _ => Ok(InfraStatus::Unknown),
        }
    }

    async fn get_endpoint(&self) -> Result<Endpoint, TargetError> {
        // Port binding publishes the gateway on the host loopback.
        Ok(Endpoint {
            host: "127.0.0.1".to_string(),
            port: self.host_port,
            protocol: GatewayProtocol::Ws,
        })
    }

    async fn destroy(&self) -> Result<(), TargetError> {
        let path = format!("/containers/{}?force=true&v=true", self.container_name);
        let (status, body) = self.docker_json("DELETE", &path, None).await?;
        // 404: already gone — destroy is idempotent.
        if status >= 400 && status != 404 {
            return Err(TargetError::DestroyFailed(format!(
                "({}): {}",
                status, body["message"]
            )));
        }

        if let Err(e) = tokio::fs::remove_dir_all(self.config_dir()).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove profile data dir");
            }
        }

        // The bridge network is shared; remove it only once nothing managed
        // remains.
        if self.no_managed_containers_remain().await? {
            let (status, _) = self
                .docker_json("DELETE", &format!("/networks/{}", NETWORK_NAME), None)
                .await?;
            if status < 400 {
                debug!(network = NETWORK_NAME, "removed orphaned bridge network");
            }
        }
        Ok(())
    }

    async fn get_logs(&self, opts: &LogOptions) -> Result<Vec<String>, TargetError> {
        let tail = opts.tail.unwrap_or(100);
        let path = format!(
            "/containers/{}/logs?stdout=1&stderr=1&tail={}",
            self.container_name, tail
        );
        let (status, bytes) = self.docker_request("GET", &path, None).await?;
        if status >= 400 {
            return Err(TargetError::LogsUnavailable(format!(
                "docker logs returned {}",
                status
            )));
        }
        Ok(demux_log_stream(&bytes))
    }

    async fn update_resources(
        &self,
        _spec: &ResourceSpec,
    ) -> Result<ResourceUpdateOutcome, TargetError> {
        Err(TargetError::ResourceUpdateUnsupported(
            DeploymentType::LocalDocker,
        ))
    }

    fn set_log_callback(&self, cb: LogCallback) {
        if let Ok(mut guard) = self.log_cb.lock() {
            *guard = Some(cb);
        }
    }
}

// ── HTTP plumbing ─────────────────────────────────────────────────────────────

/// Parse a `Connection: close` HTTP/1.1 response: status code plus body,
/// de-chunking when the daemon streams.
fn parse_http_response(raw: &[u8]) -> Result<(u16, Vec<u8>), TargetError> {
    let header_end = find_subsequence(raw, b"\r\n\r\n")
        .ok_or_else(|| TargetError::Internal("malformed docker response".to_string()))?;
    let headers = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = headers.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| TargetError::Internal("empty docker response".to_string()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TargetError::Internal(format!("bad status line: {}", status_line)))?;

    let chunked = lines.any(|l| {
        let l = l.to_ascii_lowercase();
        l.starts_with("transfer-encoding") && l.contains("chunked")
    });

    let body = &raw[header_end + 4..];
    let body = if chunked { dechunk(body) } else { body.to_vec() };
    Ok((status, body))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let Some(line_end) = find_subsequence(body, b"\r\n") else { break };
        let size_str = String::from_utf8_lossy(&body[..line_end]);
        let Ok(size) = usize::from_str_radix(size_str.trim(), 16) else { break };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        if body.len() < start + size {
            out.extend_from_slice(&body[start..]);
            break;
        }
        out.extend_from_slice(&body[start..start + size]);
        body = &body[(start + size + 2).min(body.len())..];
    }
    out
}

/// Split Docker's multiplexed log stream into lines. Each frame is an 8-byte
/// header (stream byte, 3 zeros, 4-byte big-endian length) plus payload;
/// TTY-mode containers send plain text instead.
fn demux_log_stream(bytes: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut rest = bytes;
    let multiplexed = bytes.len() >= 8 && matches!(bytes[0], 0 | 1 | 2) && bytes[1..4] == [0, 0, 0];

    if !multiplexed {
        return String::from_utf8_lossy(bytes)
            .lines()
            .map(str::to_string)
            .collect();
    }

    while rest.len() >= 8 {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        let payload = String::from_utf8_lossy(&rest[8..end]);
        lines.extend(payload.lines().map(str::to_string));
        rest = &rest[end..];
    }
    lines
}

/// Minimal percent-encoding for query string values.
fn encode_query(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
