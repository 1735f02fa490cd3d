pub mod client;
pub mod error;
pub mod pool;
pub mod proto;

pub use client::{GatewayClient, GatewayEndpoint, RetryPolicy, RPC_TIMEOUT};
pub use error::GatewayError;
pub use pool::{Gateway, GatewayPool};
pub use proto::{ConfigApplyResult, ConfigGetResult, HealthResult, StatusResult};
