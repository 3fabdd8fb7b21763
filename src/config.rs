use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::provider::DynProvider;
use crate::provider::anthropic_messages::{self, AnthropicMessagesProvider};
use crate::provider::google_gemini::{self, GoogleGeminiProvider};
use crate::provider::ollama::{self, OllamaProvider};
use crate::provider::openai_chat::{self, OpenAiChatProvider};
use crate::types::Pacing;

/// Runtime settings of the chat pipeline.
///
/// Every field has a default, so an empty JSON object is a valid config.
///
/// # Examples
///
/// ```
/// use kotoba_chat::config::ChatConfig;
///
/// let config = ChatConfig::from_json_str(r#"{"chunk_size": 5, "endpoints": {"ollama": "http://gpu:11434"}}"#).unwrap();
/// assert_eq!(config.pacing().chunk_size, 5);
/// assert_eq!(config.pacing().interval.as_millis(), 20);
/// assert_eq!(config.endpoints.ollama, "http://gpu:11434");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// 每次输出的字符数
    pub chunk_size: usize,
    /// 输出节拍 毫秒
    pub interval_ms: u64,
    /// 凭证缓存有效期
    pub credential_ttl_secs: u64,
    /// 上游请求超时 0 表示不限制
    pub request_timeout_secs: u64,
    /// 单个附件大小上限
    pub max_attachment_bytes: usize,
    /// 日志级别 传给 [`crate::logging::init`]
    pub log_level: String,
    pub endpoints: ProviderEndpoints,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            chunk_size: 3,
            interval_ms: 20,
            credential_ttl_secs: 30,
            request_timeout_secs: 300,
            max_attachment_bytes: 20 * 1024 * 1024,
            log_level: "info".to_string(),
            endpoints: ProviderEndpoints::default(),
        }
    }
}

impl ChatConfig {
    /// 从 JSON 文本加载配置
    pub fn from_json_str(text: &str) -> Result<Self, LLMError> {
        let config: ChatConfig =
            serde_json::from_str(text).map_err(|err| LLMError::InvalidConfig {
                field: "chat_config".to_string(),
                reason: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the pipeline unusable.
    pub fn validate(&self) -> Result<(), LLMError> {
        if self.max_attachment_bytes == 0 {
            return Err(LLMError::InvalidConfig {
                field: "max_attachment_bytes".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        crate::logging::parse_level(&self.log_level)?;
        for (field, url) in self.endpoints.urls() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(LLMError::InvalidConfig {
                    field: format!("endpoints.{field}"),
                    reason: format!("expected an http(s) URL, got {url:?}"),
                });
            }
        }
        Ok(())
    }

    /// Default pacing; zero values are resolved by the smoother.
    pub fn pacing(&self) -> Pacing {
        Pacing::new(self.chunk_size, Duration::from_millis(self.interval_ms))
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Upstream base URLs, overridable for proxies and self-hosted gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub openai: String,
    pub anthropic: String,
    pub anthropic_version: String,
    pub gemini: String,
    /// Used when the user did not store their own Ollama URL.
    pub ollama: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai: openai_chat::DEFAULT_BASE_URL.to_string(),
            anthropic: anthropic_messages::DEFAULT_BASE_URL.to_string(),
            anthropic_version: anthropic_messages::DEFAULT_VERSION.to_string(),
            gemini: google_gemini::DEFAULT_BASE_URL.to_string(),
            ollama: ollama::DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl ProviderEndpoints {
    fn urls(&self) -> [(&'static str, &str); 4] {
        [
            ("openai", &self.openai),
            ("anthropic", &self.anthropic),
            ("gemini", &self.gemini),
            ("ollama", &self.ollama),
        ]
    }
}

/// 供应商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Ollama,
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
    ];

    /// Parses the logical provider id used on the wire.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }

    /// Local providers run without stored credentials.
    pub fn requires_credential(&self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }
}

/// 鉴权信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// 简单 API Key 可选自定义 base_url
    ApiKey {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
    },
    /// 无需鉴权的自建服务 例如用户自己的 Ollama
    Endpoint { base_url: String },
}

/// Builds the adapter for `kind` from the user's credential and the configured endpoints.
///
/// # Errors
///
/// Returns [`LLMError::Auth`] when a cloud provider has no usable key.
pub fn build_provider(
    kind: ProviderKind,
    credential: Option<&Credential>,
    config: &ChatConfig,
    transport: DynHttpTransport,
) -> Result<DynProvider, LLMError> {
    let endpoints = &config.endpoints;
    let timeout = config.request_timeout();

    let provider: DynProvider = match kind {
        ProviderKind::Ollama => {
            let base_url = match credential {
                Some(Credential::Endpoint { base_url })
                | Some(Credential::ApiKey {
                    base_url: Some(base_url),
                    ..
                }) => base_url.clone(),
                _ => endpoints.ollama.clone(),
            };
            let mut provider = OllamaProvider::new(transport, base_url);
            if let Some(timeout) = timeout {
                provider = provider.with_timeout(timeout);
            }
            Arc::new(provider)
        }
        ProviderKind::OpenAi => {
            let mut provider = match credential {
                Some(Credential::ApiKey { key, base_url }) if !key.trim().is_empty() => {
                    OpenAiChatProvider::new(transport, key.clone())
                        .with_base_url(base_url.clone().unwrap_or_else(|| endpoints.openai.clone()))
                }
                // OpenAI-compatible host that takes no key.
                Some(Credential::Endpoint { base_url }) => {
                    OpenAiChatProvider::compatible(transport, base_url.clone())
                }
                _ => return Err(missing_credential(kind)),
            };
            if let Some(timeout) = timeout {
                provider = provider.with_timeout(timeout);
            }
            Arc::new(provider)
        }
        ProviderKind::Anthropic => {
            let (key, base_url) = extract_api_key(credential, kind)?;
            let mut provider = AnthropicMessagesProvider::new(transport, key)
                .with_base_url(base_url.unwrap_or_else(|| endpoints.anthropic.clone()))
                .with_version(endpoints.anthropic_version.clone());
            if let Some(timeout) = timeout {
                provider = provider.with_timeout(timeout);
            }
            Arc::new(provider)
        }
        ProviderKind::Gemini => {
            let (key, base_url) = extract_api_key(credential, kind)?;
            let mut provider = GoogleGeminiProvider::new(transport, key)
                .with_base_url(base_url.unwrap_or_else(|| endpoints.gemini.clone()));
            if let Some(timeout) = timeout {
                provider = provider.with_timeout(timeout);
            }
            Arc::new(provider)
        }
    };

    Ok(provider)
}

fn extract_api_key(
    credential: Option<&Credential>,
    kind: ProviderKind,
) -> Result<(String, Option<String>), LLMError> {
    match credential {
        Some(Credential::ApiKey { key, base_url }) if !key.trim().is_empty() => {
            Ok((key.clone(), base_url.clone()))
        }
        _ => Err(missing_credential(kind)),
    }
}

fn missing_credential(kind: ProviderKind) -> LLMError {
    LLMError::Auth {
        message: format!("provider {} requires an API key", kind.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::reqwest::default_dyn_transport;

    fn api_key(key: &str) -> Credential {
        Credential::ApiKey {
            key: key.to_string(),
            base_url: None,
        }
    }

    /// 验证所有 ProviderKind 分支都可以被构建
    #[test]
    fn build_provider_supports_all_kinds() {
        let transport = default_dyn_transport().expect("transport");
        let config = ChatConfig::default();

        for kind in ProviderKind::ALL {
            let credential = api_key("test-key");
            let provider =
                build_provider(kind, Some(&credential), &config, transport.clone()).expect("provider");
            assert_eq!(provider.name(), kind.id());
        }
    }

    #[test]
    fn cloud_providers_require_credentials() {
        let transport = default_dyn_transport().expect("transport");
        let config = ChatConfig::default();

        for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic, ProviderKind::Gemini] {
            match build_provider(kind, None, &config, transport.clone()) {
                Err(LLMError::Auth { message }) => assert!(message.contains(kind.id())),
                Err(other) => panic!("unexpected error: {other:?}"),
                Ok(_) => panic!("{} should require a key", kind.id()),
            }
        }

        let blank = api_key("  ");
        assert!(build_provider(ProviderKind::Gemini, Some(&blank), &config, transport).is_err());
    }

    #[test]
    fn ollama_runs_without_credentials() {
        let transport = default_dyn_transport().expect("transport");
        let provider = build_provider(ProviderKind::Ollama, None, &ChatConfig::default(), transport)
            .expect("ollama needs no key");
        assert_eq!(provider.name(), "ollama");
        assert!(!ProviderKind::Ollama.requires_credential());
    }

    #[test]
    fn provider_ids_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::from_id(kind.id()), Some(kind));
            let json = serde_json::to_value(kind).expect("serialize");
            assert_eq!(json, serde_json::json!(kind.id()));
        }
        assert_eq!(ProviderKind::from_id("mistral"), None);
    }

    #[test]
    fn credential_uses_tagged_json() {
        let credential: Credential =
            serde_json::from_str(r#"{"type":"endpoint","base_url":"http://10.0.0.2:11434"}"#)
                .expect("parse");
        assert_eq!(
            credential,
            Credential::Endpoint {
                base_url: "http://10.0.0.2:11434".to_string()
            }
        );
    }

    #[test]
    fn config_defaults_and_validation() {
        let config = ChatConfig::from_json_str("{}").expect("defaults");
        assert_eq!(config, ChatConfig::default());
        assert_eq!(config.credential_ttl(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(300)));

        let err = ChatConfig::from_json_str(r#"{"endpoints":{"openai":"api.openai.com"}}"#)
            .expect_err("scheme missing");
        match err {
            LLMError::InvalidConfig { field, .. } => assert_eq!(field, "endpoints.openai"),
            other => panic!("unexpected error: {other:?}"),
        }

        let no_timeout = ChatConfig::from_json_str(r#"{"request_timeout_secs":0}"#).expect("ok");
        assert_eq!(no_timeout.request_timeout(), None);
    }
}
