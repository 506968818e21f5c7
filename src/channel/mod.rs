pub mod base;
mod openai;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderMap, Uri};
use reqwest::Url;

use crate::error::{ProxyError, Result as AppResult};
use crate::groups::Group;
use crate::keypool::ApiKey;

/// Result of a key-validation probe against the channel's upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCheck {
    Valid,
    Invalid { status: u16, reason: String },
}

/// Protocol-family adapter. Implementations are immutable after
/// construction and shared across requests.
#[async_trait]
pub trait ChannelProxy: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_upstream_url(&self, uri: &Uri, original_group_name: &str) -> AppResult<String>;

    /// Injects the upstream auth header (replacing whatever the client sent)
    /// plus channel-specific headers.
    fn modify_request(&self, headers: &mut HeaderMap, url: &Url, api_key: &ApiKey, group: &Group);

    fn is_stream_request(&self, headers: &HeaderMap, query: Option<&str>, body: &[u8]) -> bool;

    fn extract_model(&self, body: &[u8]) -> String;

    fn apply_model_redirect(&self, body: Vec<u8>, group: &Group) -> AppResult<Vec<u8>>;

    async fn validate_key(&self, api_key: &ApiKey, group: &Group) -> AppResult<KeyCheck>;

    fn http_client(&self) -> &reqwest::Client;

    fn stream_client(&self) -> &reqwest::Client;
}

type Constructor = fn(&Group) -> AppResult<Arc<dyn ChannelProxy>>;

/// Builds channels by lowercase name and caches one instance per group.
pub struct ChannelFactory {
    constructors: HashMap<&'static str, Constructor>,
    cache: Mutex<HashMap<i64, Arc<dyn ChannelProxy>>>,
}

impl Default for ChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory {
    pub fn new() -> Self {
        let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
        constructors.insert("openai", openai::create);

        Self {
            constructors,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_channel(&self, group: &Group) -> AppResult<Arc<dyn ChannelProxy>> {
        if let Some(found) = self
            .cache
            .lock()
            .expect("channel cache lock poisoned")
            .get(&group.id)
        {
            return Ok(found.clone());
        }

        let channel_type = group.channel_type.to_ascii_lowercase();
        let constructor = self.constructors.get(channel_type.as_str()).ok_or_else(|| {
            ProxyError::Internal(format!("unknown channel type '{}'", group.channel_type))
        })?;

        let channel = constructor(group)?;
        self.cache
            .lock()
            .expect("channel cache lock poisoned")
            .insert(group.id, channel.clone());
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EffectiveConfig, GroupConfig, GroupType};

    fn group(channel_type: &str) -> Group {
        Group::from_config(
            7,
            &GroupConfig {
                name: "g1".into(),
                display_name: None,
                group_type: GroupType::Standard,
                channel_type: channel_type.into(),
                upstream_url: "https://api.openai.com".into(),
                test_model: "gpt-4o-mini".into(),
                validation_endpoint: "/v1/chat/completions".into(),
                api_keys: vec![],
                sub_groups: vec![],
                header_rules: vec![],
                config: EffectiveConfig::default(),
            },
        )
    }

    #[tokio::test]
    async fn factory_caches_channel_per_group() {
        let factory = ChannelFactory::new();
        let g = group("OpenAI");
        let a = factory.get_channel(&g).unwrap();
        let b = factory.get_channel(&g).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "openai");
    }

    #[tokio::test]
    async fn unknown_channel_type_is_internal_error() {
        let factory = ChannelFactory::new();
        assert!(matches!(
            factory.get_channel(&group("gemini")),
            Err(ProxyError::Internal(_))
        ));
    }
}
