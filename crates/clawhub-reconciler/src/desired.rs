use clawhub_config::{canonical_hash, generate_config, AiGatewaySettings, BotManifest, GeneratedConfig};
use clawhub_domain::BotInstance;
use clawhub_store::StateStore;
use clawhub_target::{prepare_agent_config, TransformOverrides};

use crate::error::ReconcileError;
use crate::preprocess::{PreprocessContext, PreprocessorChain};

/// The desired manifest after preprocessing, plus the generated config it
/// hashes to.
pub struct DesiredConfig {
    pub manifest: BotManifest,
    pub generated: GeneratedConfig,
}

/// The shared front half of the pipeline: parse the stored manifest, run the
/// preprocessor chain, generate the config with the instance's previously
/// issued gateway token.
///
/// The engine and the drift detector must agree byte-for-byte on the desired
/// config, so both go through here.
pub async fn compute_desired(
    store: &dyn StateStore,
    chain: &PreprocessorChain,
    ai_gateway: Option<&AiGatewaySettings>,
    instance: &BotInstance,
) -> Result<DesiredConfig, ReconcileError> {
    let doc = instance
        .desired_manifest
        .as_ref()
        .ok_or_else(|| ReconcileError::InvalidManifest("no desired manifest recorded".to_string()))?;
    let mut manifest = BotManifest::parse(doc)
        .map_err(|e| ReconcileError::InvalidManifest(e.to_string()))?;

    let ctx = PreprocessContext { instance, store };
    chain.run(&ctx, &mut manifest).await;

    let existing_token = store
        .get_connection(&instance.id)
        .await?
        .map(|c| c.auth_token)
        .filter(|t| !t.is_empty());

    let mut generated = generate_config(&manifest, ai_gateway, existing_token.as_deref())
        .map_err(|e| ReconcileError::InvalidManifest(e.to_string()))?;

    // The fingerprint must cover exactly the document the adapter delivers,
    // so the backend transformation (including the container bind override)
    // runs before hashing. The adapters apply the same transformation again
    // at configure time; it is idempotent.
    generated.config = prepare_agent_config(
        &generated.config,
        TransformOverrides::for_deployment(instance.deployment_type),
    );
    generated.config_hash = canonical_hash(&generated.config);

    Ok(DesiredConfig { manifest, generated })
}
