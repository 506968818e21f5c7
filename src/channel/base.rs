use axum::http::{header, HeaderMap, HeaderValue, Uri};
use reqwest::Url;
use std::time::Duration;

use crate::error::{ProxyError, Result as AppResult};
use crate::groups::Group;
use crate::http_client;

/// Shared plumbing for protocol-family adapters: upstream URL handling,
/// validation endpoint joining, tuned HTTP clients, and the OpenRouter
/// header convention.
pub struct BaseChannel {
    pub name: &'static str,
    pub upstream_url: Url,
    pub validation_endpoint: String,
    pub test_model: String,
    http_client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl BaseChannel {
    pub fn new(name: &'static str, group: &Group) -> AppResult<Self> {
        let upstream_url = Url::parse(&group.upstream_url).map_err(|e| {
            ProxyError::Config(format!(
                "group '{}' has an invalid upstream_url: {}",
                group.name, e
            ))
        })?;

        Ok(Self {
            name,
            upstream_url,
            validation_endpoint: group.validation_endpoint.clone(),
            test_model: group.test_model.clone(),
            http_client: http_client::timeout_client(Duration::from_secs(
                group.config.request_timeout_secs,
            ))?,
            stream_client: http_client::streaming_client()?,
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn stream_client(&self) -> &reqwest::Client {
        &self.stream_client
    }

    /// Maps the inbound proxy path onto the upstream base URL, keeping the
    /// path suffix after the group-name prefix and the whole query string.
    pub fn build_upstream_url(&self, uri: &Uri, original_group_name: &str) -> AppResult<String> {
        let path = uri.path();
        let prefix = format!("/proxy/{}", original_group_name);
        let suffix = path.strip_prefix(&prefix).unwrap_or(path);

        let mut url = self.upstream_url.clone();
        let joined = format!("{}{}", url.path().trim_end_matches('/'), suffix);
        url.set_path(if joined.is_empty() { "/" } else { &joined });
        url.set_query(uri.query());

        Ok(url.to_string())
    }

    /// URL of the key-validation probe. When the upstream base path already
    /// ends in `/v1` and the endpoint starts with `/v1`, the duplicate
    /// prefix is dropped (base `https://h/api/v1` + `/v1/chat/completions`
    /// => `https://h/api/v1/chat/completions`).
    pub fn validation_url(&self) -> String {
        let (endpoint_path, endpoint_query) = match self.validation_endpoint.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (self.validation_endpoint.as_str(), None),
        };

        let base_path = self.upstream_url.path().trim_end_matches('/');
        let mut endpoint_path = endpoint_path.to_string();
        if base_path.ends_with("/v1") && endpoint_path.starts_with("/v1") {
            endpoint_path = endpoint_path["/v1".len()..].to_string();
            if endpoint_path.is_empty() {
                endpoint_path = "/".to_string();
            }
        }

        let mut url = self.upstream_url.clone();
        url.set_path(&format!("{}{}", base_path, endpoint_path));
        url.set_query(endpoint_query);
        url.to_string()
    }

    pub fn is_openrouter(url: &Url) -> bool {
        url.host_str()
            .map(|h| h.to_ascii_lowercase().contains("openrouter.ai"))
            .unwrap_or(false)
    }

    /// OpenRouter recommends these headers and may enforce them for some
    /// (e.g. free) routes; client-provided values win.
    pub fn apply_openrouter_headers(headers: &mut HeaderMap, url: &Url, group: &Group) {
        if !Self::is_openrouter(url) {
            return;
        }

        if !headers.contains_key("http-referer") {
            let referer = header_str(headers, "origin")
                .or_else(|| header_str(headers, header::REFERER.as_str()))
                .unwrap_or_else(|| group.config.app_url.clone());
            if !referer.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&referer) {
                    headers.insert("http-referer", value);
                }
            }
        }

        if !headers.contains_key("x-title") {
            let title = group.title();
            if !title.is_empty() {
                if let Ok(value) = HeaderValue::from_str(title) {
                    headers.insert("x-title", value);
                }
            }
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EffectiveConfig, GroupConfig, GroupType};

    fn group_with_upstream(upstream: &str) -> Group {
        Group::from_config(
            1,
            &GroupConfig {
                name: "g1".into(),
                display_name: Some("Group One".into()),
                group_type: GroupType::Standard,
                channel_type: "openai".into(),
                upstream_url: upstream.into(),
                test_model: "gpt-4o-mini".into(),
                validation_endpoint: "/v1/chat/completions".into(),
                api_keys: vec![],
                sub_groups: vec![],
                header_rules: vec![],
                config: EffectiveConfig::default(),
            },
        )
    }

    fn base(upstream: &str) -> BaseChannel {
        BaseChannel::new("openai", &group_with_upstream(upstream)).unwrap()
    }

    #[test]
    fn upstream_url_keeps_suffix_and_query() {
        let ch = base("https://api.openai.com");
        let uri: Uri = "/proxy/g1/v1/chat/completions?foo=bar".parse().unwrap();
        assert_eq!(
            ch.build_upstream_url(&uri, "g1").unwrap(),
            "https://api.openai.com/v1/chat/completions?foo=bar"
        );
    }

    #[test]
    fn upstream_url_joins_base_path() {
        let ch = base("https://gateway.example.com/openai/");
        let uri: Uri = "/proxy/g1/v1/models".parse().unwrap();
        assert_eq!(
            ch.build_upstream_url(&uri, "g1").unwrap(),
            "https://gateway.example.com/openai/v1/models"
        );
    }

    #[test]
    fn upstream_url_with_empty_suffix() {
        let ch = base("https://api.openai.com/v1");
        let uri: Uri = "/proxy/g1".parse().unwrap();
        assert_eq!(
            ch.build_upstream_url(&uri, "g1").unwrap(),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn validation_url_dedups_version_prefix() {
        let ch = base("https://h/api/v1");
        assert_eq!(ch.validation_url(), "https://h/api/v1/chat/completions");
    }

    #[test]
    fn validation_url_without_duplicate_prefix() {
        let ch = base("https://api.openai.com");
        assert_eq!(
            ch.validation_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn validation_url_degenerate_endpoint_becomes_root() {
        let mut group = group_with_upstream("https://h/api/v1");
        group.validation_endpoint = "/v1".into();
        let ch = BaseChannel::new("openai", &group).unwrap();
        assert_eq!(ch.validation_url(), "https://h/api/v1/");
    }

    #[test]
    fn openrouter_referer_prefers_origin_then_referer_then_app_url() {
        let mut group = group_with_upstream("https://openrouter.ai/api/v1");
        group.config.app_url = "https://fallback.example".into();
        let url = Url::parse("https://openrouter.ai/api/v1/chat/completions").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("https://from-origin"));
        headers.insert("referer", HeaderValue::from_static("https://from-referer"));
        BaseChannel::apply_openrouter_headers(&mut headers, &url, &group);
        assert_eq!(headers.get("http-referer").unwrap(), "https://from-origin");

        let mut headers = HeaderMap::new();
        headers.insert("referer", HeaderValue::from_static("https://from-referer"));
        BaseChannel::apply_openrouter_headers(&mut headers, &url, &group);
        assert_eq!(headers.get("http-referer").unwrap(), "https://from-referer");

        let mut headers = HeaderMap::new();
        BaseChannel::apply_openrouter_headers(&mut headers, &url, &group);
        assert_eq!(
            headers.get("http-referer").unwrap(),
            "https://fallback.example"
        );
        assert_eq!(headers.get("x-title").unwrap(), "Group One");
    }

    #[test]
    fn openrouter_headers_respect_client_values() {
        let group = group_with_upstream("https://openrouter.ai/api/v1");
        let url = Url::parse("https://openrouter.ai/api/v1/chat/completions").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("http-referer", HeaderValue::from_static("https://client"));
        headers.insert("x-title", HeaderValue::from_static("Client Title"));
        BaseChannel::apply_openrouter_headers(&mut headers, &url, &group);
        assert_eq!(headers.get("http-referer").unwrap(), "https://client");
        assert_eq!(headers.get("x-title").unwrap(), "Client Title");
    }

    #[test]
    fn non_openrouter_hosts_are_untouched() {
        let group = group_with_upstream("https://api.openai.com");
        let url = Url::parse("https://api.openai.com/v1/chat/completions").unwrap();
        let mut headers = HeaderMap::new();
        BaseChannel::apply_openrouter_headers(&mut headers, &url, &group);
        assert!(headers.is_empty());
    }
}
