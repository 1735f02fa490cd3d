pub mod canonical;
pub mod error;
pub mod generator;
pub mod manifest;
mod raw;

pub use canonical::canonical_hash;
pub use error::ConfigError;
pub use generator::{
    generate_auth_token, generate_config, AiGatewaySettings, GeneratedConfig,
    DEFAULT_GATEWAY_PORT,
};
pub use manifest::{BotManifest, Environment, ManifestMetadata, SecurityOverrides};
