//! Tag reconciliation
//!
//! Provider-level default tags merge under resource-level tags, with
//! the resource winning on key collisions. Ignore filters hide
//! externally-managed keys from the cloud-side comparison so a
//! controller writing its own tags never causes drift. The reconciled
//! diff is the minimal untag-then-tag pair.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cirrus_core::context::OpContext;
use cirrus_core::error::{EngineError, EngineResult};
use cirrus_core::resource::CustomizeDiffFn;
use cirrus_core::value::Value;
use tracing::debug;

/// A resource's tag set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap(pub BTreeMap<String, String>);

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Merge `other` over self; `other` wins on key collisions
    pub fn merge(&self, other: &TagMap) -> TagMap {
        let mut merged = self.0.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone());
        }
        TagMap(merged)
    }

    /// Keys present here but absent from `other`
    pub fn removed(&self, other: &TagMap) -> Vec<String> {
        self.0
            .keys()
            .filter(|k| !other.0.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Pairs in `other` that are new or carry a different value
    pub fn updated(&self, other: &TagMap) -> BTreeMap<String, String> {
        other
            .0
            .iter()
            .filter(|(k, v)| self.0.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drop every key the ignore configuration matches
    pub fn ignore(&self, ignore: &IgnoreTags) -> TagMap {
        TagMap(
            self.0
                .iter()
                .filter(|(k, _)| !ignore.is_ignored(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn from_value(value: &Value) -> TagMap {
        let mut tags = BTreeMap::new();
        if let Value::Map(entries) = value {
            for (k, v) in entries {
                if let Some(s) = v.as_str() {
                    tags.insert(k.clone(), s.to_string());
                }
            }
        }
        TagMap(tags)
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        TagMap(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Keys to exclude from cloud-side drift comparison
#[derive(Debug, Clone, Default)]
pub struct IgnoreTags {
    pub keys: Vec<String>,
    pub key_prefixes: Vec<String>,
    /// When set, only keys under one of these prefixes are managed at
    /// all; everything else is left to whoever wrote it
    pub managed_prefixes: Option<Vec<String>>,
}

impl IgnoreTags {
    pub fn is_ignored(&self, key: &str) -> bool {
        if let Some(managed) = &self.managed_prefixes
            && !managed.iter().any(|p| key.starts_with(p.as_str()))
        {
            return true;
        }
        self.keys.iter().any(|k| k == key)
            || self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}

/// The minimal API calls that bring cloud tags in line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagsDiff {
    pub add_or_update: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl TagsDiff {
    pub fn is_empty(&self) -> bool {
        self.add_or_update.is_empty() && self.remove.is_empty()
    }
}

/// Reconcile desired tags against what the cloud reports.
///
/// Desired is provider defaults merged under the user's tags; both
/// sides of the comparison are filtered through the ignore rules, so
/// an ignored key neither updates nor removes.
pub fn reconcile(
    defaults: &TagMap,
    user: &TagMap,
    ignore: &IgnoreTags,
    cloud: &TagMap,
) -> TagsDiff {
    let planned = defaults.merge(user).ignore(ignore);
    let prior = cloud.ignore(ignore);
    TagsDiff {
        add_or_update: prior.updated(&planned),
        remove: prior.removed(&planned),
    }
}

/// Effective tag set persisted to state: defaults merged under user
/// tags, ignore rules untouched
pub fn tags_all(defaults: &TagMap, user: &TagMap) -> TagMap {
    defaults.merge(user)
}

/// User-declared portion of an effective tag set: everything in `all`
/// the provider defaults did not contribute verbatim. Read uses this
/// to split cloud-reported tags back into the `tags` attribute.
pub fn tags(defaults: &TagMap, all: &TagMap) -> TagMap {
    TagMap(
        all.0
            .iter()
            .filter(|(k, v)| defaults.0.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

/// Customize-diff hook that recomputes the `tags_all` attribute from
/// the planned `tags` whenever tags change
pub fn set_tags_diff(defaults: TagMap) -> CustomizeDiffFn {
    std::sync::Arc::new(move |modifier| {
        if !modifier.has_change("tags") {
            return Ok(());
        }
        let user = TagMap::from_value(&modifier.get("tags"));
        let all = tags_all(&defaults, &user);
        modifier.set_new("tags_all", all.to_value())?;
        Ok(())
    })
}

/// Tagging calls a resource needs; implemented over the Resource
/// Groups Tagging API and mocked in tests
#[async_trait]
pub trait TagApi: Send + Sync {
    async fn tag_resource(
        &self,
        arn: &str,
        tags: &BTreeMap<String, String>,
    ) -> EngineResult<()>;

    async fn untag_resource(&self, arn: &str, keys: &[String]) -> EngineResult<()>;
}

/// Apply a reconciled diff with the minimal call pair: removals
/// first, then additions and updates. Neither call is made when its
/// half is empty.
pub async fn update_tags(
    ctx: &OpContext,
    api: &dyn TagApi,
    arn: &str,
    diff: &TagsDiff,
) -> EngineResult<()> {
    if diff.is_empty() {
        return Ok(());
    }
    ctx.check()?;
    if !diff.remove.is_empty() {
        debug!(arn, keys = ?diff.remove, "removing tags");
        api.untag_resource(arn, &diff.remove).await?;
    }
    if !diff.add_or_update.is_empty() {
        debug!(arn, count = diff.add_or_update.len(), "writing tags");
        api.tag_resource(arn, &diff.add_or_update).await?;
    }
    Ok(())
}

/// `TagApi` over the Resource Groups Tagging API
pub struct TaggingClient {
    client: aws_sdk_resourcegroupstagging::Client,
}

impl TaggingClient {
    pub fn new(client: aws_sdk_resourcegroupstagging::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TagApi for TaggingClient {
    async fn tag_resource(
        &self,
        arn: &str,
        tags: &BTreeMap<String, String>,
    ) -> EngineResult<()> {
        let mut request = self.client.tag_resources().resource_arn_list(arn);
        for (k, v) in tags {
            request = request.tags(k, v);
        }
        let output = request
            .send()
            .await
            .map_err(crate::classify::classify_sdk)?;
        if let Some(failure) = output
            .failed_resources_map()
            .and_then(|m| m.values().next())
        {
            return Err(EngineError::api(format!(
                "tagging failed: {} {}",
                failure.error_code().map(|c| c.as_str()).unwrap_or("Unknown"),
                failure.error_message().unwrap_or("")
            )));
        }
        Ok(())
    }

    async fn untag_resource(&self, arn: &str, keys: &[String]) -> EngineResult<()> {
        let mut request = self.client.untag_resources().resource_arn_list(arn);
        for key in keys {
            request = request.tag_keys(key);
        }
        let output = request
            .send()
            .await
            .map_err(crate::classify::classify_sdk)?;
        if let Some(failure) = output
            .failed_resources_map()
            .and_then(|m| m.values().next())
        {
            return Err(EngineError::api(format!(
                "untagging failed: {} {}",
                failure.error_code().map(|c| c.as_str()).unwrap_or("Unknown"),
                failure.error_message().unwrap_or("")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn user_tags_win_over_defaults() {
        let defaults = tags(&[("env", "staging"), ("team", "infra")]);
        let user = tags(&[("env", "prod")]);
        let all = tags_all(&defaults, &user);
        assert_eq!(all.get("env"), Some("prod"));
        assert_eq!(all.get("team"), Some("infra"));
    }

    #[test]
    fn reconcile_produces_minimal_pair() {
        let defaults = tags(&[("team", "infra")]);
        let user = tags(&[("app", "web")]);
        let cloud = tags(&[("team", "infra"), ("app", "old"), ("stale", "1")]);
        let diff = reconcile(&defaults, &user, &IgnoreTags::default(), &cloud);
        assert_eq!(diff.add_or_update, tags(&[("app", "web")]).0);
        assert_eq!(diff.remove, vec!["stale".to_string()]);
    }

    #[test]
    fn ignored_keys_never_appear_in_the_diff() {
        // An ignored key that drifted cloud-side must be left alone,
        // and one the config sets must not be rewritten either
        let defaults = tags(&[("env", "staging")]);
        let user = tags(&[("env", "prod"), ("app", "web")]);
        let ignore = IgnoreTags {
            keys: vec!["env".to_string()],
            key_prefixes: vec!["kubernetes.io/".to_string()],
            ..IgnoreTags::default()
        };
        let cloud = tags(&[
            ("env", "drifted"),
            ("kubernetes.io/cluster", "c1"),
            ("app", "old"),
        ]);
        let diff = reconcile(&defaults, &user, &ignore, &cloud);
        assert_eq!(diff.add_or_update, tags(&[("app", "web")]).0);
        assert!(diff.remove.is_empty());

        // while tags_all still records the effective merged set
        let all = tags_all(&defaults, &user);
        assert_eq!(all.get("env"), Some("prod"));
    }

    #[test]
    fn prefix_matching() {
        let ignore = IgnoreTags {
            key_prefixes: vec!["aws:".to_string()],
            ..IgnoreTags::default()
        };
        assert!(ignore.is_ignored("aws:cloudformation:stack"));
        assert!(!ignore.is_ignored("team"));
    }

    #[test]
    fn managed_prefix_allowlist_limits_scope() {
        let ignore = IgnoreTags {
            managed_prefixes: Some(vec!["app:".to_string()]),
            ..IgnoreTags::default()
        };
        assert!(!ignore.is_ignored("app:name"));
        assert!(ignore.is_ignored("team"));
        assert!(ignore.is_ignored("aws:cloudformation:stack"));

        // explicit ignores still apply inside the allowlist
        let ignore = IgnoreTags {
            keys: vec!["app:env".to_string()],
            managed_prefixes: Some(vec!["app:".to_string()]),
            ..IgnoreTags::default()
        };
        assert!(ignore.is_ignored("app:env"));
        assert!(!ignore.is_ignored("app:name"));
    }

    #[test]
    fn unmanaged_keys_never_reconcile() {
        let ignore = IgnoreTags {
            managed_prefixes: Some(vec!["app:".to_string()]),
            ..IgnoreTags::default()
        };
        let defaults = tags(&[("app:team", "infra")]);
        let user = tags(&[("app:name", "web")]);
        // the operator-owned key outside the allowlist stays put
        let cloud = tags(&[("app:team", "infra"), ("operator", "manual")]);
        let diff = reconcile(&defaults, &user, &ignore, &cloud);
        assert_eq!(diff.add_or_update, tags(&[("app:name", "web")]).0);
        assert!(diff.remove.is_empty());
    }

    #[test]
    fn user_tags_split_back_out_of_the_effective_set() {
        let defaults = tags(&[("env", "prod"), ("team", "infra")]);
        let all = tags(&[("env", "prod"), ("team", "red"), ("ticket", "42")]);
        // a key overriding its default belongs to the user
        assert_eq!(
            super::tags(&defaults, &all),
            tags(&[("team", "red"), ("ticket", "42")])
        );
        assert_eq!(super::tags(&TagMap::new(), &all), all);
    }

    #[test]
    fn reconcile_with_defaults_ignores_and_drift() {
        let defaults = tags(&[("env", "prod"), ("team", "blue")]);
        let user = tags(&[("team", "red"), ("ticket", "42")]);
        let ignore = IgnoreTags {
            keys: vec!["env".to_string()],
            ..IgnoreTags::default()
        };
        let cloud = tags(&[
            ("env", "dev"),
            ("team", "blue"),
            ("ticket", "99"),
            ("legacy", "x"),
        ]);
        let diff = reconcile(&defaults, &user, &ignore, &cloud);
        assert_eq!(
            diff.add_or_update,
            tags(&[("team", "red"), ("ticket", "42")]).0
        );
        assert_eq!(diff.remove, vec!["legacy".to_string()]);
        // the drifted ignored key is untouched, yet the effective set
        // still records the configured default
        let all = tags_all(&defaults, &user);
        assert_eq!(all, tags(&[("env", "prod"), ("team", "red"), ("ticket", "42")]));
    }

    #[test]
    fn value_round_trip() {
        let original = tags(&[("a", "1"), ("b", "2")]);
        assert_eq!(TagMap::from_value(&original.to_value()), original);
        assert_eq!(TagMap::from_value(&Value::Null), TagMap::new());
    }

    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TagApi for RecordingApi {
        async fn tag_resource(
            &self,
            _arn: &str,
            tags: &BTreeMap<String, String>,
        ) -> EngineResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("tag:{}", tags.len()));
            Ok(())
        }

        async fn untag_resource(&self, _arn: &str, keys: &[String]) -> EngineResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("untag:{}", keys.len()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn update_tags_skips_empty_halves() {
        let ctx = OpContext::new(Duration::from_secs(5));
        let api = RecordingApi::default();

        let diff = TagsDiff::default();
        update_tags(&ctx, &api, "arn:x", &diff).await.unwrap();
        assert!(api.calls.lock().unwrap().is_empty());

        let diff = TagsDiff {
            add_or_update: tags(&[("a", "1")]).0,
            remove: vec![],
        };
        update_tags(&ctx, &api, "arn:x", &diff).await.unwrap();
        assert_eq!(*api.calls.lock().unwrap(), vec!["tag:1".to_string()]);
    }

    #[tokio::test]
    async fn update_tags_removes_before_writing() {
        let ctx = OpContext::new(Duration::from_secs(5));
        let api = RecordingApi::default();
        let diff = TagsDiff {
            add_or_update: tags(&[("a", "1")]).0,
            remove: vec!["stale".to_string()],
        };
        update_tags(&ctx, &api, "arn:x", &diff).await.unwrap();
        assert_eq!(
            *api.calls.lock().unwrap(),
            vec!["untag:1".to_string(), "tag:1".to_string()]
        );
    }
}
