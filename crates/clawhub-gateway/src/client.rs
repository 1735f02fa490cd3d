use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clawhub_domain::GatewayProtocol;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::proto::{
    ConfigApplyParams, ConfigApplyResult, ConfigGetResult, HealthResult, RpcRequest, RpcResponse,
    StatusResult,
};

/// Where an agent is reachable, plus the bearer token for the handshake.
#[derive(Debug, Clone)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: GatewayProtocol,
    pub auth_token: Option<String>,
}

impl GatewayEndpoint {
    pub fn url(&self) -> String {
        format!("{}://{}:{}/rpc", self.protocol, self.host, self.port)
    }
}

/// Connect retry policy. Provision uses the full exponential backoff; drift
/// scans use a single bounded attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
            max_attempts: 30,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// One attempt with the default 10 s bound; the drift detector's policy.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `n` (0-based): base·2ⁿ capped at `max_delay`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.min(self.max_delay)
    }
}

/// Default per-RPC timeouts.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, GatewayError>>>>>;

/// One long-lived JSON-RPC connection to a managed instance's agent.
///
/// The client owns a background read/write task; callers issue RPCs through
/// an outbound channel and await the correlated response. Dropping the client
/// does not close the socket; use [`GatewayClient::shutdown`].
#[derive(Debug)]
pub struct GatewayClient {
    outgoing: mpsc::UnboundedSender<tungstenite::Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl GatewayClient {
    /// Single connect attempt with the policy's bounded timeout.
    pub async fn connect(endpoint: &GatewayEndpoint, timeout: Duration) -> Result<Self, GatewayError> {
        let mut request = endpoint
            .url()
            .into_client_request()
            .map_err(|e| GatewayError::ConnectFailed(e.to_string()))?;

        if let Some(token) = &endpoint.auth_token {
            let value = HeaderValue::from_bytes(format!("Bearer {token}").as_bytes())
                .map_err(|e| GatewayError::ConnectFailed(format!("bad auth token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                GatewayError::ConnectFailed(format!(
                    "connect to {} timed out after {:?}",
                    endpoint.url(),
                    timeout
                ))
            })?
            .map_err(|e| GatewayError::ConnectFailed(e.to_string()))?;

        debug!(url = %endpoint.url(), "gateway connection established");

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<tungstenite::Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let task = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = outgoing_rx.recv() => {
                            let Some(msg) = msg else { break };
                            let send = sink.send(msg);
                            if tokio::time::timeout(RPC_TIMEOUT, send).await.is_err() {
                                warn!("gateway send stalled; closing connection");
                                break;
                            }
                        }

                        msg = source.next() => match msg {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                dispatch_response(&pending, &text).await;
                            }
                            Some(Ok(tungstenite::Message::Ping(_)))
                            | Some(Ok(tungstenite::Message::Pong(_))) => {}
                            Some(Ok(tungstenite::Message::Close(frame))) => {
                                debug!(?frame, "agent closed the gateway connection");
                                break;
                            }
                            None | Some(Err(_)) => {
                                debug!("gateway connection interrupted");
                                break;
                            }
                            Some(Ok(other)) => {
                                debug!(?other, "ignoring non-text gateway frame");
                            }
                        }
                    }
                }

                closed.store(true, Ordering::SeqCst);
                // Fail anything still waiting for a response.
                let mut pending = pending.lock().await;
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(GatewayError::Closed));
                }
            })
        };

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            task,
        })
    }

    /// Connect with exponential backoff (base 5 s, cap 15 s, max 30 attempts
    /// under the default policy).
    pub async fn connect_with_backoff(
        endpoint: &GatewayEndpoint,
        policy: &RetryPolicy,
    ) -> Result<Self, GatewayError> {
        let mut last_error = String::new();
        for attempt in 0..policy.max_attempts {
            match Self::connect(endpoint, policy.connect_timeout).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < policy.max_attempts {
                        let delay = policy.delay_for(attempt);
                        debug!(
                            attempt = attempt + 1,
                            ?delay,
                            error = %last_error,
                            "gateway connect failed; backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(GatewayError::RetriesExhausted {
            attempts: policy.max_attempts,
            last_error,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue one JSON-RPC call and await the correlated response.
    pub async fn rpc(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        if self.outgoing.send(tungstenite::Message::Text(frame)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(GatewayError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    // ── Typed agent methods ───────────────────────────────────────────────────

    pub async fn config_get(&self) -> Result<ConfigGetResult, GatewayError> {
        let v = self.rpc("config.get", None, RPC_TIMEOUT).await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    pub async fn config_apply(
        &self,
        raw: &str,
        base_hash: &str,
    ) -> Result<ConfigApplyResult, GatewayError> {
        let params = serde_json::to_value(ConfigApplyParams {
            raw: raw.to_string(),
            base_hash: base_hash.to_string(),
        })
        .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        // Applies can take longer than reads: the agent revalidates and
        // reloads subsystems.
        let v = self.rpc("config.apply", Some(params), Duration::from_secs(30)).await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    pub async fn health(&self) -> Result<HealthResult, GatewayError> {
        let v = self.rpc("health", None, RPC_TIMEOUT).await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    pub async fn status(&self) -> Result<StatusResult, GatewayError> {
        let v = self.rpc("status", None, RPC_TIMEOUT).await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    /// Close the socket and stop the background task.
    pub async fn shutdown(&self) {
        let _ = self.outgoing.send(tungstenite::Message::Close(None));
        self.closed.store(true, Ordering::SeqCst);
        // Give the task a moment to flush the close frame, then stop it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.task.abort();
    }
}

async fn dispatch_response(pending: &PendingMap, text: &str) {
    let response: RpcResponse = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "undecodable gateway frame");
            return;
        }
    };
    let Some(id) = response.id else {
        debug!("gateway notification frame ignored");
        return;
    };
    let Some(tx) = pending.lock().await.remove(&id) else {
        debug!(id, "response for unknown or timed-out request");
        return;
    };

    let outcome = match (response.result, response.error) {
        (_, Some(err)) => Err(GatewayError::Rpc(err.message)),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    };
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;

    /// Minimal agent double: accepts one connection, answers `health` and
    /// `config.get`, ignores everything else.
    async fn spawn_stub_agent(respond: bool) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let tungstenite::Message::Text(text) = msg {
                    if !respond {
                        continue;
                    }
                    let req: Value = serde_json::from_str(&text).unwrap();
                    let id = req["id"].clone();
                    let result = match req["method"].as_str() {
                        Some("health") => json!({ "ok": true, "uptime": 12.5 }),
                        Some("config.get") => json!({ "hash": "ab".repeat(32), "config": {} }),
                        Some("status") => json!({ "state": "running", "configHash": "ab".repeat(32) }),
                        _ => json!(null),
                    };
                    let frame = json!({ "id": id, "result": result }).to_string();
                    ws.send(tungstenite::Message::Text(frame)).await.unwrap();
                }
            }
        });
        ("127.0.0.1".to_string(), port)
    }

    fn endpoint(host: &str, port: u16) -> GatewayEndpoint {
        GatewayEndpoint {
            host: host.to_string(),
            port,
            protocol: GatewayProtocol::Ws,
            auth_token: Some("tok".to_string()),
        }
    }

    #[tokio::test]
    async fn rpc_round_trip() {
        let (host, port) = spawn_stub_agent(true).await;
        let client = GatewayClient::connect(&endpoint(&host, port), Duration::from_secs(5))
            .await
            .unwrap();

        let health = client.health().await.unwrap();
        assert!(health.ok);

        let cfg = client.config_get().await.unwrap();
        assert_eq!(cfg.hash.len(), 64);

        let status = client.status().await.unwrap();
        assert_eq!(status.state, "running");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_times_out_when_agent_is_silent() {
        let (host, port) = spawn_stub_agent(false).await;
        let client = GatewayClient::connect(&endpoint(&host, port), Duration::from_secs(5))
            .await
            .unwrap();

        let err = client
            .rpc("health", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn connect_fails_fast_when_nothing_listens() {
        let ep = endpoint("127.0.0.1", 1); // nothing listens on port 1
        let err = GatewayClient::connect(&ep, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn backoff_reports_exhaustion() {
        let ep = endpoint("127.0.0.1", 1);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_attempts: 3,
            connect_timeout: Duration::from_secs(1),
        };
        let err = GatewayClient::connect_with_backoff(&ep, &policy).await.unwrap_err();
        match err {
            GatewayError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn backoff_delays_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(15));
        assert_eq!(policy.delay_for(10), Duration::from_secs(15));
    }
}
