//! Cirrus AWS Provider
//!
//! AWS half of the provider plugin: configuration, credentials and
//! client plumbing, tag policy, and error classification over the
//! cirrus-core lifecycle engine

pub mod classify;
pub mod client;
pub mod config;
pub mod meta;
pub mod tags;

use std::sync::Arc;

use cirrus_core::error::{EngineError, EngineResult};
use cirrus_core::server::ProviderServer;

use crate::config::ProviderConfig;
use crate::meta::{AwsMeta, AwsRegistry};

/// Configure the provider from the host's JSON block and stand up
/// the operation surface over a populated registry
pub async fn configure(
    config: &serde_json::Value,
    registry: Arc<AwsRegistry>,
) -> EngineResult<ProviderServer<AwsMeta>> {
    let config = ProviderConfig::from_json(config)
        .map_err(|e| EngineError::api(format!("invalid provider configuration: {}", e)))?;
    let meta = AwsMeta::configure(config).await?;
    Ok(ProviderServer::new(meta.into_dispatcher(registry)))
}
