use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clawhub_domain::InstanceId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{GatewayClient, GatewayEndpoint, RetryPolicy};
use crate::error::GatewayError;
use crate::proto::{ConfigApplyResult, ConfigGetResult, HealthResult, StatusResult};

/// The agent-protocol surface the reconciler depends on. The production
/// implementation is [`GatewayPool`]; tests inject stubs.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Ensure a pooled connection exists for `id`, dialing `endpoint` under
    /// `policy` if absent.
    async fn connect(
        &self,
        id: &InstanceId,
        endpoint: &GatewayEndpoint,
        policy: &RetryPolicy,
    ) -> Result<(), GatewayError>;

    async fn config_get(&self, id: &InstanceId) -> Result<ConfigGetResult, GatewayError>;

    async fn config_apply(
        &self,
        id: &InstanceId,
        raw: &str,
        base_hash: &str,
    ) -> Result<ConfigApplyResult, GatewayError>;

    async fn health(&self, id: &InstanceId) -> Result<HealthResult, GatewayError>;

    async fn status(&self, id: &InstanceId) -> Result<StatusResult, GatewayError>;

    /// Drop and shut down the pooled connection, if any.
    async fn evict(&self, id: &InstanceId);
}

type Slot = Arc<Mutex<Option<Arc<GatewayClient>>>>;

/// Shared pool of long-lived gateway clients, keyed by instance id.
///
/// Connect-if-absent runs under a per-key lock so two concurrent operations
/// on the same instance dial at most once, while operations on distinct
/// instances never contend.
#[derive(Default)]
pub struct GatewayPool {
    slots: Mutex<HashMap<InstanceId, Slot>>,
}

impl GatewayPool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: &InstanceId) -> Slot {
        let mut slots = self.slots.lock().await;
        slots.entry(id.clone()).or_default().clone()
    }

    async fn client(&self, id: &InstanceId) -> Result<Arc<GatewayClient>, GatewayError> {
        let slot = self.slot(id).await;
        let guard = slot.lock().await;
        match guard.as_ref() {
            Some(client) if !client.is_closed() => Ok(client.clone()),
            _ => Err(GatewayError::NotConnected(id.to_string())),
        }
    }
}

#[async_trait]
impl Gateway for GatewayPool {
    async fn connect(
        &self,
        id: &InstanceId,
        endpoint: &GatewayEndpoint,
        policy: &RetryPolicy,
    ) -> Result<(), GatewayError> {
        let slot = self.slot(id).await;
        let mut guard = slot.lock().await;

        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(());
            }
            debug!(instance_id = %id, "pooled gateway client was closed; reconnecting");
        }

        let client = GatewayClient::connect_with_backoff(endpoint, policy).await?;
        *guard = Some(Arc::new(client));
        Ok(())
    }

    async fn config_get(&self, id: &InstanceId) -> Result<ConfigGetResult, GatewayError> {
        self.client(id).await?.config_get().await
    }

    async fn config_apply(
        &self,
        id: &InstanceId,
        raw: &str,
        base_hash: &str,
    ) -> Result<ConfigApplyResult, GatewayError> {
        self.client(id).await?.config_apply(raw, base_hash).await
    }

    async fn health(&self, id: &InstanceId) -> Result<HealthResult, GatewayError> {
        self.client(id).await?.health().await
    }

    async fn status(&self, id: &InstanceId) -> Result<StatusResult, GatewayError> {
        self.client(id).await?.status().await
    }

    async fn evict(&self, id: &InstanceId) {
        let removed = {
            let mut slots = self.slots.lock().await;
            slots.remove(id)
        };
        if let Some(slot) = removed {
            let guard = slot.lock().await;
            if let Some(client) = guard.as_ref() {
                client.shutdown().await;
                debug!(instance_id = %id, "evicted gateway client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawhub_domain::GatewayProtocol;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite;

    async fn spawn_stub_agent() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut ws = match tokio_tungstenite::accept_async(socket).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    while let Some(Ok(tungstenite::Message::Text(text))) = ws.next().await {
                        let req: Value = serde_json::from_str(&text).unwrap();
                        let frame = json!({
                            "id": req["id"],
                            "result": { "ok": true, "uptime": 1.0 }
                        })
                        .to_string();
                        if ws.send(tungstenite::Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    fn endpoint(port: u16) -> GatewayEndpoint {
        GatewayEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            protocol: GatewayProtocol::Ws,
            auth_token: None,
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_attempts: 2,
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_rpc_works() {
        let port = spawn_stub_agent().await;
        let pool = GatewayPool::new();
        let id = InstanceId::new("bot-1");

        pool.connect(&id, &endpoint(port), &quick_policy()).await.unwrap();
        pool.connect(&id, &endpoint(port), &quick_policy()).await.unwrap();

        let health = pool.health(&id).await.unwrap();
        assert!(health.ok);
    }

    #[tokio::test]
    async fn rpc_without_connect_reports_not_connected() {
        let pool = GatewayPool::new();
        let err = pool.health(&InstanceId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected(_)));
    }

    #[tokio::test]
    async fn evict_removes_the_client() {
        let port = spawn_stub_agent().await;
        let pool = GatewayPool::new();
        let id = InstanceId::new("bot-2");

        pool.connect(&id, &endpoint(port), &quick_policy()).await.unwrap();
        pool.evict(&id).await;

        let err = pool.health(&id).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected(_)));
    }
}
