//! Provider configuration
//!
//! The host hands over one JSON block when it configures the
//! provider. Region resolution falls back to the standard environment
//! variables; endpoint overrides come from config first, then from
//! the `AWS_ENDPOINT_URL_<SERVICE>` family.

use std::collections::BTreeMap;
use std::env;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("no region configured; set `region` or the AWS_REGION environment variable")]
    MissingRegion,

    #[error("'{0}' does not look like an AWS region")]
    InvalidRegion(String),

    #[error("assume_role requires a role_arn")]
    MissingRoleArn,

    #[error("cannot mix static credentials with a profile")]
    CredentialConflict,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub token: Option<String>,
    pub assume_role: Option<AssumeRoleConfig>,
    /// Tags applied to every taggable resource
    #[serde(default)]
    pub default_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_tags: IgnoreTagsConfig,
    /// SDK attempt cap per API call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub skip_region_validation: bool,
    /// Per-service endpoint overrides, keyed by service name
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssumeRoleConfig {
    pub role_arn: String,
    pub session_name: Option<String>,
    pub external_id: Option<String>,
    pub policy: Option<String>,
    /// Session length in seconds
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IgnoreTagsConfig {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub key_prefixes: Vec<String>,
    /// Restrict tag management to keys under these prefixes
    #[serde(default)]
    pub managed_prefixes: Option<Vec<String>>,
}

fn default_max_retries() -> u32 {
    25
}

const REGION_PREFIXES: &[&str] = &[
    "us-", "eu-", "ap-", "sa-", "ca-", "me-", "af-", "il-", "cn-", "us-gov-",
];

impl ProviderConfig {
    pub fn from_json(config: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(config.clone())
    }

    /// Effective region: explicit config, then AWS_REGION, then
    /// AWS_DEFAULT_REGION
    pub fn resolve_region(&self) -> Result<String, ConfigError> {
        let region = self
            .region
            .clone()
            .or_else(|| env::var("AWS_REGION").ok())
            .or_else(|| env::var("AWS_DEFAULT_REGION").ok())
            .ok_or(ConfigError::MissingRegion)?;
        if !self.skip_region_validation {
            validate_region(&region)?;
        }
        Ok(region)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if let Some(assume_role) = &self.assume_role
            && assume_role.role_arn.is_empty()
        {
            return Err(ConfigError::MissingRoleArn);
        }
        if self.profile.is_some() && (self.access_key.is_some() || self.secret_key.is_some()) {
            return Err(ConfigError::CredentialConflict);
        }
        Ok(())
    }

    /// Endpoint override for a service: config block first, then the
    /// environment
    pub fn endpoint_for(&self, service: &str) -> Option<String> {
        if let Some(url) = self.endpoints.get(service) {
            return Some(url.clone());
        }
        let var = format!(
            "AWS_ENDPOINT_URL_{}",
            service.to_uppercase().replace('-', "_")
        );
        env::var(var).ok().or_else(|| env::var("AWS_ENDPOINT_URL").ok())
    }
}

pub fn validate_region(region: &str) -> Result<(), ConfigError> {
    // us-gov- sorts after us-, check longest prefixes first
    let mut prefixes: Vec<&str> = REGION_PREFIXES.to_vec();
    prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
    if prefixes.iter().any(|p| region.starts_with(p)) && region.len() > 4 {
        Ok(())
    } else {
        Err(ConfigError::InvalidRegion(region.to_string()))
    }
}

/// Partition a region belongs to, used to build ARNs
pub fn partition_for_region(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_config() {
        let config = ProviderConfig::from_json(&json!({
            "region": "us-west-2",
            "max_retries": 10,
            "default_tags": { "team": "infra" },
            "ignore_tags": {
                "key_prefixes": ["kubernetes.io/"],
                "managed_prefixes": ["app:"]
            },
            "assume_role": { "role_arn": "arn:aws:iam::123456789012:role/deploy" },
            "endpoints": { "sts": "http://localhost:4566" }
        }))
        .unwrap();
        assert_eq!(config.region.as_deref(), Some("us-west-2"));
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.default_tags["team"], "infra");
        assert_eq!(config.ignore_tags.key_prefixes, vec!["kubernetes.io/"]);
        assert_eq!(
            config.ignore_tags.managed_prefixes,
            Some(vec!["app:".to_string()])
        );
        assert_eq!(
            config.endpoint_for("sts").as_deref(),
            Some("http://localhost:4566")
        );
        config.check().unwrap();
    }

    #[test]
    fn max_retries_defaults() {
        let config = ProviderConfig::from_json(&json!({})).unwrap();
        assert_eq!(config.max_retries, 25);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(ProviderConfig::from_json(&json!({ "regin": "us-east-1" })).is_err());
    }

    #[test]
    fn region_validation() {
        assert!(validate_region("us-east-1").is_ok());
        assert!(validate_region("eu-central-1").is_ok());
        assert!(validate_region("us-gov-west-1").is_ok());
        assert!(validate_region("moon-base-1").is_err());
        assert!(validate_region("us-").is_err());
    }

    #[test]
    fn skip_region_validation_bypasses_the_check() {
        let config = ProviderConfig {
            region: Some("localstack".to_string()),
            skip_region_validation: true,
            ..ProviderConfig::default()
        };
        assert_eq!(config.resolve_region().unwrap(), "localstack");
    }

    #[test]
    fn partition_mapping() {
        assert_eq!(partition_for_region("us-east-1"), "aws");
        assert_eq!(partition_for_region("cn-north-1"), "aws-cn");
        assert_eq!(partition_for_region("us-gov-east-1"), "aws-us-gov");
    }

    #[test]
    fn profile_conflicts_with_static_keys() {
        let config = ProviderConfig {
            profile: Some("dev".to_string()),
            access_key: Some("AKIA...".to_string()),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            config.check(),
            Err(ConfigError::CredentialConflict)
        ));
    }
}
