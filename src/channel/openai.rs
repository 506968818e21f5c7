use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Uri};
use reqwest::Url;
use serde_json::Value;

use crate::channel::base::BaseChannel;
use crate::channel::{ChannelProxy, KeyCheck};
use crate::error::{ProxyError, Result as AppResult};
use crate::groups::Group;
use crate::headers::{apply_header_rules, HeaderVariableContext};
use crate::keypool::ApiKey;
use crate::server::upstream_error::{decompress_if_gzip, parse_upstream_error};

/// OpenAI protocol family: bearer auth, `stream` flag in the JSON body, and
/// the OpenRouter attribution headers when the upstream is openrouter.ai.
pub struct OpenAIChannel {
    base: BaseChannel,
}

pub(super) fn create(group: &Group) -> AppResult<Arc<dyn ChannelProxy>> {
    Ok(Arc::new(OpenAIChannel {
        base: BaseChannel::new("openai", group)?,
    }))
}

#[async_trait]
impl ChannelProxy for OpenAIChannel {
    fn name(&self) -> &'static str {
        self.base.name
    }

    fn build_upstream_url(&self, uri: &Uri, original_group_name: &str) -> AppResult<String> {
        self.base.build_upstream_url(uri, original_group_name)
    }

    fn modify_request(&self, headers: &mut HeaderMap, url: &Url, api_key: &ApiKey, group: &Group) {
        let bearer = format!("Bearer {}", api_key.key_value);
        if let Ok(value) = HeaderValue::from_str(&bearer) {
            headers.insert(header::AUTHORIZATION, value);
        }
        BaseChannel::apply_openrouter_headers(headers, url, group);
    }

    fn is_stream_request(&self, headers: &HeaderMap, query: Option<&str>, body: &[u8]) -> bool {
        if headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"))
        {
            return true;
        }

        if query.is_some_and(query_requests_stream) {
            return true;
        }

        // Best effort: malformed JSON simply means "not streaming".
        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("stream").and_then(Value::as_bool))
            .unwrap_or(false)
    }

    fn extract_model(&self, body: &[u8]) -> String {
        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("model").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default()
    }

    fn apply_model_redirect(&self, body: Vec<u8>, group: &Group) -> AppResult<Vec<u8>> {
        if group.config.model_redirects.is_empty() || body.is_empty() {
            return Ok(body);
        }

        let mut value: Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::BadRequest(format!("model redirect needs a JSON body: {}", e)))?;

        let Some(model) = value.get("model").and_then(Value::as_str) else {
            return Ok(body);
        };

        let (resolved, changed) = resolve_redirect_chain(&group.config.model_redirects, model, 16);
        if !changed {
            return Ok(body);
        }

        value["model"] = Value::String(resolved);
        Ok(serde_json::to_vec(&value)?)
    }

    async fn validate_key(&self, api_key: &ApiKey, group: &Group) -> AppResult<KeyCheck> {
        let payload = serde_json::json!({
            "model": self.base.test_model,
            "messages": [{"role": "user", "content": "hi"}],
        });

        let url = Url::parse(&self.base.validation_url())
            .map_err(|e| ProxyError::Internal(format!("invalid validation URL: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.modify_request(&mut headers, &url, api_key, group);
        if !group.header_rules.is_empty() {
            let ctx = HeaderVariableContext {
                api_key: api_key.key_value.clone(),
                group_name: group.name.clone(),
                ..Default::default()
            };
            apply_header_rules(&mut headers, &group.header_rules, &ctx);
        }

        let resp = self
            .base
            .http_client()
            .post(url)
            .headers(headers)
            .json(&payload)
            .send()
            .await?;

        // Any 2xx means the key works; organization verification is NOT
        // decided here (the test model does not require it).
        let status = resp.status();
        if status.is_success() {
            return Ok(KeyCheck::Valid);
        }

        let encoding = resp
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let raw = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        let body = decompress_if_gzip(encoding.as_deref(), raw);

        Ok(KeyCheck::Invalid {
            status: status.as_u16(),
            reason: parse_upstream_error(&body),
        })
    }

    fn http_client(&self) -> &reqwest::Client {
        self.base.http_client()
    }

    fn stream_client(&self) -> &reqwest::Client {
        self.base.stream_client()
    }
}

fn query_requests_stream(query: &str) -> bool {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(k, v)| k == "stream" && v == "true")
}

/// Follows the redirect map until it stops changing, guarding against
/// cycles and runaway chains.
fn resolve_redirect_chain(
    map: &HashMap<String, String>,
    source_model: &str,
    max_hops: usize,
) -> (String, bool) {
    let mut current = source_model.to_string();
    let mut seen = HashSet::<String>::new();
    for _ in 0..max_hops {
        if !seen.insert(current.clone()) {
            break;
        }
        match map.get(&current) {
            Some(next) if next != &current => current = next.clone(),
            _ => break,
        }
    }
    let changed = current != source_model;
    (current, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EffectiveConfig, GroupConfig, GroupType};

    fn group() -> Group {
        Group::from_config(
            1,
            &GroupConfig {
                name: "g1".into(),
                display_name: None,
                group_type: GroupType::Standard,
                channel_type: "openai".into(),
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

    fn channel() -> OpenAIChannel {
        OpenAIChannel {
            base: BaseChannel::new("openai", &group()).unwrap(),
        }
    }

    #[test]
    fn stream_detection_from_accept_header() {
        let ch = channel();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        assert!(ch.is_stream_request(&headers, None, b""));
    }

    #[test]
    fn stream_detection_from_query() {
        let ch = channel();
        let headers = HeaderMap::new();
        assert!(ch.is_stream_request(&headers, Some("stream=true"), b""));
        assert!(!ch.is_stream_request(&headers, Some("stream=false"), b""));
        assert!(!ch.is_stream_request(&headers, Some("streamer=true"), b""));
    }

    #[test]
    fn stream_detection_from_body_is_pure() {
        let ch = channel();
        let headers = HeaderMap::new();
        let body = br#"{"model":"gpt-4o","stream":true}"#;
        assert!(ch.is_stream_request(&headers, None, body));
        // Idempotent: a second call sees the same answer.
        assert!(ch.is_stream_request(&headers, None, body));

        assert!(!ch.is_stream_request(&headers, None, br#"{"stream":false}"#));
        assert!(!ch.is_stream_request(&headers, None, b"not json"));
    }

    #[test]
    fn extract_model_best_effort() {
        let ch = channel();
        assert_eq!(ch.extract_model(br#"{"model":"gpt-4o-mini"}"#), "gpt-4o-mini");
        assert_eq!(ch.extract_model(b"oops"), "");
        assert_eq!(ch.extract_model(br#"{"model":7}"#), "");
    }

    #[test]
    fn modify_request_sets_single_bearer_auth() {
        let ch = channel();
        let key = ApiKey::new(1, "sk-live".into(), false, None);
        let url = Url::parse("https://api.openai.com/v1/chat/completions").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer client-supplied"),
        );
        ch.modify_request(&mut headers, &url, &key, &group());

        let values: Vec<_> = headers.get_all(header::AUTHORIZATION).iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "Bearer sk-live");
    }

    #[test]
    fn model_redirect_rewrites_body() {
        let ch = channel();
        let mut g = group();
        g.config.model_redirects =
            HashMap::from([("gpt-4".to_string(), "gpt-4o".to_string())]);

        let out = ch
            .apply_model_redirect(br#"{"model":"gpt-4","stream":false}"#.to_vec(), &g)
            .unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["stream"], false);
    }

    #[test]
    fn model_redirect_leaves_unmapped_body_alone() {
        let ch = channel();
        let mut g = group();
        g.config.model_redirects =
            HashMap::from([("gpt-4".to_string(), "gpt-4o".to_string())]);

        let body = br#"{"model":"gpt-3.5-turbo"}"#.to_vec();
        assert_eq!(ch.apply_model_redirect(body.clone(), &g).unwrap(), body);
    }

    #[test]
    fn model_redirect_rejects_bad_json_when_policy_active() {
        let ch = channel();
        let mut g = group();
        g.config.model_redirects =
            HashMap::from([("a".to_string(), "b".to_string())]);
        assert!(ch.apply_model_redirect(b"not json".to_vec(), &g).is_err());
    }

    #[test]
    fn redirect_chain_follows_and_stops_on_cycle() {
        let map = HashMap::from([
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "c".to_string()),
        ]);
        assert_eq!(resolve_redirect_chain(&map, "a", 16), ("c".to_string(), true));

        // A full cycle lands back on the source and reports no change.
        let cyclic = HashMap::from([
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "a".to_string()),
        ]);
        let (resolved, changed) = resolve_redirect_chain(&cyclic, "a", 16);
        assert!(!changed);
        assert_eq!(resolved, "a");
    }
}
