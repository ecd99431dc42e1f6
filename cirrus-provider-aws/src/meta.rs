//! Provider meta - everything resource functions receive
//!
//! Built once from the provider configuration: validated caller
//! identity, the shared client bundle, and the provider-level tag
//! policy. Handed to every lifecycle function by the dispatcher.

use std::sync::Arc;

use cirrus_core::error::EngineResult;
use cirrus_core::lifecycle::Dispatcher;
use cirrus_core::registry::Registry;
use cirrus_core::resource::{DataSourceDefinition, ResourceDefinition};
use tracing::info;

use crate::client::{CallerIdentity, ClientBundle};
use crate::config::ProviderConfig;
use crate::tags::{IgnoreTags, TagMap};

pub struct AwsMeta {
    pub identity: CallerIdentity,
    pub region: String,
    pub partition: String,
    pub default_tags: TagMap,
    pub ignore_tags: IgnoreTags,
    pub clients: ClientBundle,
    pub max_retries: u32,
}

pub type AwsRegistry = Registry<AwsMeta>;
pub type AwsDispatcher = Dispatcher<AwsMeta>;
pub type AwsResource = ResourceDefinition<AwsMeta>;
pub type AwsDataSource = DataSourceDefinition<AwsMeta>;

impl AwsMeta {
    /// Connect, validate credentials, and capture the tag policy
    pub async fn configure(config: ProviderConfig) -> EngineResult<Self> {
        let default_tags = TagMap(config.default_tags.clone());
        let ignore_tags = IgnoreTags {
            keys: config.ignore_tags.keys.clone(),
            key_prefixes: config.ignore_tags.key_prefixes.clone(),
            managed_prefixes: config.ignore_tags.managed_prefixes.clone(),
        };
        let max_retries = config.max_retries;

        let clients = ClientBundle::connect(config).await?;
        let identity = clients.caller_identity().await?;
        let region = clients.region().to_string();
        let partition = identity.partition.clone();
        info!(
            account_id = %identity.account_id,
            region = %region,
            "provider configured"
        );
        Ok(Self {
            identity,
            region,
            partition,
            default_tags,
            ignore_tags,
            clients,
            max_retries,
        })
    }

    /// Build an ARN in the configured partition and region
    pub fn arn(&self, service: &str, resource: &str) -> String {
        format_arn(
            &self.partition,
            service,
            &self.region,
            &self.identity.account_id,
            resource,
        )
    }

    pub fn into_dispatcher(self, registry: Arc<AwsRegistry>) -> AwsDispatcher {
        let max_retries = self.max_retries;
        Dispatcher::new(registry, Arc::new(self)).with_max_retries(Some(max_retries))
    }
}

pub fn format_arn(
    partition: &str,
    service: &str,
    region: &str,
    account_id: &str,
    resource: &str,
) -> String {
    format!(
        "arn:{}:{}:{}:{}:{}",
        partition, service, region, account_id, resource
    )
}
