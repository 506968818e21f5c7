use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    Set,
    Remove,
}

/// Per-group header rewrite rule; `value` supports `${var}` substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub action: HeaderAction,
}

/// Variables available to header rules for one request.
#[derive(Debug, Clone, Default)]
pub struct HeaderVariableContext {
    pub api_key: String,
    pub group_name: String,
    pub client_ip: String,
    pub user_agent: String,
}

impl HeaderVariableContext {
    fn render(&self, template: &str) -> String {
        template
            .replace("${api_key}", &self.api_key)
            .replace("${group_name}", &self.group_name)
            .replace("${client_ip}", &self.client_ip)
            .replace("${user_agent}", &self.user_agent)
    }
}

pub fn apply_header_rules(
    headers: &mut HeaderMap,
    rules: &[HeaderRule],
    ctx: &HeaderVariableContext,
) {
    for rule in rules {
        let Ok(name) = HeaderName::try_from(rule.key.as_str()) else {
            tracing::warn!(rule = %rule.key, "skipping header rule with invalid name");
            continue;
        };
        match rule.action {
            HeaderAction::Remove => {
                headers.remove(&name);
            }
            HeaderAction::Set => {
                let rendered = ctx.render(&rule.value);
                match HeaderValue::from_str(&rendered) {
                    Ok(value) => {
                        headers.insert(name, value);
                    }
                    Err(_) => {
                        tracing::warn!(rule = %rule.key, "skipping header rule with invalid value");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HeaderVariableContext {
        HeaderVariableContext {
            api_key: "sk-123".into(),
            group_name: "g1".into(),
            client_ip: "10.0.0.9".into(),
            user_agent: "curl/8".into(),
        }
    }

    #[test]
    fn set_with_substitution() {
        let mut headers = HeaderMap::new();
        let rules = vec![HeaderRule {
            key: "X-Forwarded-Key".into(),
            value: "key=${api_key};group=${group_name}".into(),
            action: HeaderAction::Set,
        }];
        apply_header_rules(&mut headers, &rules, &ctx());
        assert_eq!(
            headers.get("X-Forwarded-Key").unwrap(),
            "key=sk-123;group=g1"
        );
    }

    #[test]
    fn remove_existing_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-debug", HeaderValue::from_static("1"));
        let rules = vec![HeaderRule {
            key: "X-Debug".into(),
            value: String::new(),
            action: HeaderAction::Remove,
        }];
        apply_header_rules(&mut headers, &rules, &ctx());
        assert!(headers.get("x-debug").is_none());
    }

    #[test]
    fn invalid_rule_is_skipped() {
        let mut headers = HeaderMap::new();
        let rules = vec![
            HeaderRule {
                key: "bad header name".into(),
                value: "v".into(),
                action: HeaderAction::Set,
            },
            HeaderRule {
                key: "X-Ok".into(),
                value: "ok".into(),
                action: HeaderAction::Set,
            },
        ];
        apply_header_rules(&mut headers, &rules, &ctx());
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-Ok").unwrap(), "ok");
    }
}
