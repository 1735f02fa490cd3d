use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket connect failed: {0}")]
    ConnectFailed(String),

    #[error("websocket connect exhausted {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("no pooled connection for instance {0}")]
    NotConnected(String),

    #[error("rpc '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("connection closed")]
    Closed,

    #[error("agent rpc error: {0}")]
    Rpc(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}
