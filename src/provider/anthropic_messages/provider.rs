use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LLMError;
use crate::http::{
    DynHttpTransport, post_json_stream_with_headers, post_json_with_headers, retry_after,
};
use crate::provider::{ChatStream, LLMProvider, parse_payload};
use crate::stream::collect_stream_text;
use crate::types::{CapabilityDescriptor, ChatResponse, ProviderRequest};

use super::error::parse_anthropic_error;
use super::request::build_anthropic_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::AnthropicMessageResponse;

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub(crate) const DEFAULT_VERSION: &str = "2023-06-01";

/// Anthropic Messages provider.
pub struct AnthropicMessagesProvider {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) version: String,
    pub(crate) timeout: Option<Duration>,
}

impl AnthropicMessagesProvider {
    /// 使用默认 base_url 与 anthropic-version 创建 Provider
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            version: DEFAULT_VERSION.to_string(),
            timeout: None,
        }
    }

    /// 自定义 base_url
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// 自定义 Anthropic API 版本（anthropic-version）
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 设置请求超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        }
    }

    fn build_headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), self.version.clone()),
        ])
    }
}

#[async_trait]
impl LLMProvider for AnthropicMessagesProvider {
    async fn chat(&self, request: ProviderRequest) -> Result<ChatResponse, LLMError> {
        let body = build_anthropic_body(&request, false);
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(),
            self.timeout,
            &body,
        )
        .await?;
        let status = response.status;
        let wait = retry_after(&response.headers);
        let text = response.into_string()?;
        if !(200..300).contains(&status) {
            return Err(parse_anthropic_error(status, &text, wait));
        }
        let parsed: AnthropicMessageResponse = parse_payload(self.name(), &text)?;
        Ok(map_response(parsed))
    }

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChatStream, LLMError> {
        let body = build_anthropic_body(&request, true);
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(),
            self.timeout,
            &body,
        )
        .await?;
        if !response.is_success() {
            let wait = retry_after(&response.headers);
            let text = collect_stream_text(response.body, self.name()).await?;
            return Err(parse_anthropic_error(response.status, &text, wait));
        }
        Ok(create_stream(response.body, self.name()))
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_stream: true,
            supports_image_input: true,
            supports_image_output: false,
        }
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
