//! Client bundle - shared SDK configuration and per-service clients
//!
//! One bundle is built when the provider is configured and shared by
//! every resource function. Service clients are constructed lazily
//! from the base configuration, with per-service endpoint overrides
//! applied at construction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::Duration;

use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use cirrus_core::error::{EngineError, EngineResult};
use tracing::{debug, info};

use crate::config::ProviderConfig;

/// Identity of the configured credentials, from STS GetCallerIdentity
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
    pub user_id: String,
    pub partition: String,
}

/// Config, region, and fingerprint are fixed at `connect`, so every
/// cached client belongs to exactly one (region, credential set) and
/// can never go stale within a bundle. Reconfiguring the provider
/// builds a new bundle; a changed fingerprint identifies that the
/// credential set behind it changed.
pub struct ClientBundle {
    config: ProviderConfig,
    sdk_config: SdkConfig,
    region: String,
    /// Hash of the resolved credential material
    fingerprint: u64,
    sts: RwLock<Option<aws_sdk_sts::Client>>,
    tagging: RwLock<Option<aws_sdk_resourcegroupstagging::Client>>,
}

impl ClientBundle {
    /// Resolve credentials and region and load the base SDK
    /// configuration, assuming a role on top when one is configured
    pub async fn connect(config: ProviderConfig) -> EngineResult<Self> {
        config
            .check()
            .map_err(|e| EngineError::api(e.to_string()))?;
        let region = config
            .resolve_region()
            .map_err(|e| EngineError::api(e.to_string()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .retry_config(
                aws_config::retry::RetryConfig::standard()
                    .with_max_attempts(config.max_retries),
            );
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                config.token.clone(),
                None,
                "provider-config",
            ));
        }
        let mut sdk_config = loader.load().await;

        if let Some(role) = &config.assume_role {
            info!(role_arn = %role.role_arn, "assuming role");
            let mut builder = AssumeRoleProvider::builder(&role.role_arn)
                .session_name(
                    role.session_name
                        .clone()
                        .unwrap_or_else(|| "cirrus-provider".to_string()),
                )
                .configure(&sdk_config);
            if let Some(external_id) = &role.external_id {
                builder = builder.external_id(external_id);
            }
            if let Some(seconds) = role.duration_seconds {
                builder = builder.session_length(Duration::from_secs(seconds));
            }
            let provider = builder.build().await;
            sdk_config = sdk_config
                .to_builder()
                .credentials_provider(SharedCredentialsProvider::new(provider))
                .build();
        }

        let fingerprint = credential_fingerprint(&sdk_config).await?;
        debug!(region = %region, fingerprint, "client bundle ready");
        Ok(Self {
            config,
            sdk_config,
            region,
            fingerprint,
            sts: RwLock::new(None),
            tagging: RwLock::new(None),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn sdk_config(&self) -> &SdkConfig {
        &self.sdk_config
    }

    pub fn sts(&self) -> aws_sdk_sts::Client {
        if let Some(client) = self.sts.read().expect("client lock poisoned").as_ref() {
            return client.clone();
        }
        let mut builder = aws_sdk_sts::config::Builder::from(&self.sdk_config);
        if let Some(url) = self.config.endpoint_for("sts") {
            builder = builder.endpoint_url(url);
        }
        let client = aws_sdk_sts::Client::from_conf(builder.build());
        *self.sts.write().expect("client lock poisoned") = Some(client.clone());
        client
    }

    pub fn tagging(&self) -> aws_sdk_resourcegroupstagging::Client {
        if let Some(client) = self.tagging.read().expect("client lock poisoned").as_ref() {
            return client.clone();
        }
        let mut builder = aws_sdk_resourcegroupstagging::config::Builder::from(&self.sdk_config);
        if let Some(url) = self.config.endpoint_for("resourcegroupstaggingapi") {
            builder = builder.endpoint_url(url);
        }
        let client = aws_sdk_resourcegroupstagging::Client::from_conf(builder.build());
        *self.tagging.write().expect("client lock poisoned") = Some(client.clone());
        client
    }

    /// Validate the credentials and learn who we are. Always works
    /// when credentials are valid; the partition comes out of the
    /// caller ARN.
    pub async fn caller_identity(&self) -> EngineResult<CallerIdentity> {
        let identity = self
            .sts()
            .get_caller_identity()
            .send()
            .await
            .map_err(crate::classify::classify_sdk)?;
        let account_id = identity
            .account()
            .ok_or_else(|| EngineError::api("STS returned no account id"))?
            .to_string();
        let arn = identity
            .arn()
            .ok_or_else(|| EngineError::api("STS returned no caller ARN"))?
            .to_string();
        let user_id = identity.user_id().unwrap_or("").to_string();
        let partition = partition_of_arn(&arn)
            .ok_or_else(|| EngineError::api(format!("malformed caller ARN '{}'", arn)))?
            .to_string();
        info!(account_id = %account_id, partition = %partition, "credentials validated");
        Ok(CallerIdentity {
            account_id,
            arn,
            user_id,
            partition,
        })
    }
}

/// Hash the resolved credential material so credential changes are
/// observable without holding secrets
async fn credential_fingerprint(sdk_config: &SdkConfig) -> EngineResult<u64> {
    let provider = sdk_config
        .credentials_provider()
        .ok_or_else(|| EngineError::api("no credentials provider configured"))?;
    let credentials = provider
        .provide_credentials()
        .await
        .map_err(|e| EngineError::api(format!("cannot resolve credentials: {}", e)))?;
    Ok(fingerprint_of(&credentials))
}

fn fingerprint_of(credentials: &Credentials) -> u64 {
    let mut hasher = DefaultHasher::new();
    credentials.access_key_id().hash(&mut hasher);
    credentials.secret_access_key().hash(&mut hasher);
    credentials.session_token().hash(&mut hasher);
    hasher.finish()
}

fn partition_of_arn(arn: &str) -> Option<&str> {
    let mut parts = arn.split(':');
    if parts.next() != Some("arn") {
        return None;
    }
    parts.next().filter(|p| !p.is_empty())
}
