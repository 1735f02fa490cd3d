use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),

    #[error("invalid status transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid config hash '{0}': expected 64 lowercase hex chars")]
    InvalidConfigHash(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Validate the canonical-hash wire format (64 lowercase hex chars).
pub fn validate_config_hash(hash: &str) -> Result<(), DomainError> {
    let ok = hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if ok {
        Ok(())
    } else {
        Err(DomainError::InvalidConfigHash(hash.to_string()))
    }
}
