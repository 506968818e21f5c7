use crate::error::{ProxyError, Result as AppResult};
use crate::headers::HeaderRule;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Capacity of the in-flight request-log queue; entries are dropped
    /// with a warning once it fills up.
    #[serde(default = "default_log_queue_size")]
    pub queue_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            queue_size: default_log_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Secret mixed into the key-at-rest obfuscation and the deterministic
    /// key hash. Override in production.
    #[serde(default = "default_encryption_secret")]
    pub secret: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            secret: default_encryption_secret(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum GroupType {
    #[default]
    Standard,
    Aggregate,
}

/// 分组配置：一个分组绑定一个通道类型与一批密钥
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub group_type: GroupType,
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
    /// Upstream base URL; required for standard groups, ignored for aggregates.
    #[serde(default)]
    pub upstream_url: String,
    #[serde(default = "default_test_model")]
    pub test_model: String,
    #[serde(default = "default_validation_endpoint")]
    pub validation_endpoint: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub sub_groups: Vec<SubGroupRef>,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    #[serde(default)]
    pub config: EffectiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubGroupRef {
    pub name: String,
    #[serde(default = "default_sub_group_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    /// Applied to non-streaming upstream attempts only.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Origin used as the OpenRouter Referer fallback.
    #[serde(default)]
    pub app_url: String,
    #[serde(default)]
    pub enable_request_body_logging: bool,
    /// Models that prefer organization-verified keys.
    #[serde(default)]
    pub premium_models: HashSet<String>,
    /// JSON object merged into request bodies; these keys win.
    #[serde(default)]
    pub param_overrides: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub model_redirects: HashMap<String, String>,
    /// Model ids kept by the model-list interceptor; empty = no filtering.
    #[serde(default)]
    pub model_filter: Vec<String>,
    /// Consecutive failures before a key is quarantined.
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: u32,
    /// Interval of the quarantined-key revalidation sweep; 0 disables it.
    #[serde(default = "default_key_recovery_interval")]
    pub key_recovery_interval_secs: u64,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            app_url: String::new(),
            enable_request_body_logging: false,
            premium_models: HashSet::new(),
            param_overrides: serde_json::Map::new(),
            model_redirects: HashMap::new(),
            model_filter: Vec::new(),
            blacklist_threshold: default_blacklist_threshold(),
            key_recovery_interval_secs: default_key_recovery_interval(),
        }
    }
}

fn default_database_path() -> String {
    "data/keygate.db".to_string()
}

fn default_log_queue_size() -> usize {
    1024
}

fn default_encryption_secret() -> String {
    "keygate-insecure-default".to_string()
}

fn default_channel_type() -> String {
    "openai".to_string()
}

fn default_test_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_validation_endpoint() -> String {
    "/v1/chat/completions".to_string()
}

fn default_sub_group_weight() -> u32 {
    1
}

fn default_request_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_blacklist_threshold() -> u32 {
    3
}

fn default_key_recovery_interval() -> u64 {
    600
}

impl Settings {
    pub fn load() -> AppResult<Self> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let settings: Settings = toml::from_str(&config_content)?;
        settings.validate()?;

        Ok(settings)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        for group in &self.groups {
            match group.group_type {
                GroupType::Standard => {
                    if group.upstream_url.is_empty() {
                        return Err(ProxyError::Config(format!(
                            "group '{}' has no upstream_url",
                            group.name
                        )));
                    }
                }
                GroupType::Aggregate => {
                    if group.sub_groups.is_empty() {
                        return Err(ProxyError::Config(format!(
                            "aggregate group '{}' has no sub_groups",
                            group.name
                        )));
                    }
                    if !group.api_keys.is_empty() {
                        return Err(ProxyError::Config(format!(
                            "aggregate group '{}' must not carry api_keys",
                            group.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn find_config_file() -> AppResult<String> {
        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err(ProxyError::Config(
            "Configuration file not found. Please create custom-config.toml or config.toml".into(),
        ))
    }
}
