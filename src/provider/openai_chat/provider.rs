use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LLMError;
use crate::http::{DynHttpTransport, post_json_stream_with_headers, post_json_with_headers};
use crate::provider::{ChatStream, LLMProvider, parse_payload};
use crate::stream::collect_stream_text;
use crate::types::{CapabilityDescriptor, ChatResponse, ProviderRequest};

use super::error::parse_openai_error;
use super::request::build_openai_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::OpenAiChatResponse;

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI Chat Completions provider.
pub struct OpenAiChatProvider {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl OpenAiChatProvider {
    /// 创建带默认 base_url 的 Provider
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: Some(api_key.into()),
            timeout: None,
        }
    }

    /// 指向兼容 OpenAI 协议的自建服务 不需要密钥
    pub fn compatible(transport: DynHttpTransport, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            api_key: None,
            timeout: None,
        }
    }

    /// 自定义 base_url
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
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
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn build_headers(&self, stream: bool) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
        }
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        headers.insert("Accept".to_string(), accept.to_string());
        headers
    }
}

#[async_trait]
impl LLMProvider for OpenAiChatProvider {
    async fn chat(&self, request: ProviderRequest) -> Result<ChatResponse, LLMError> {
        let body = build_openai_body(&request, false);
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(false),
            self.timeout,
            &body,
        )
        .await?;
        let status = response.status;
        let headers = response.headers.clone();
        let text = response.into_string()?;
        if !(200..300).contains(&status) {
            return Err(parse_openai_error(status, &text, &headers));
        }
        let parsed: OpenAiChatResponse = parse_payload(self.name(), &text)?;
        Ok(map_response(parsed))
    }

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChatStream, LLMError> {
        let body = build_openai_body(&request, true);
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(true),
            self.timeout,
            &body,
        )
        .await?;
        if !response.is_success() {
            let text = collect_stream_text(response.body, self.name()).await?;
            return Err(parse_openai_error(response.status, &text, &response.headers));
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
        "openai"
    }
}
