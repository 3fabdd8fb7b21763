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

use super::error::parse_gemini_error;
use super::request::build_gemini_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::GeminiResponse;

pub(crate) const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini provider.
pub struct GoogleGeminiProvider {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) timeout: Option<Duration>,
}

impl GoogleGeminiProvider {
    /// 使用默认 base_url 创建 Provider
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
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

    /// Builds the non-streaming endpoint URL for GenerateContent.
    pub(crate) fn endpoint(&self, model: &str) -> String {
        format!("{}:generateContent", self.model_url(model))
    }

    /// Builds the streaming endpoint URL (SSE) for GenerateContent.
    pub(crate) fn stream_endpoint(&self, model: &str) -> String {
        format!("{}:streamGenerateContent?alt=sse", self.model_url(model))
    }

    fn model_url(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let model_path = normalize_model(model);
        if base.ends_with("/v1beta") {
            format!("{base}/{model_path}")
        } else {
            format!("{base}/v1beta/{model_path}")
        }
    }

    fn build_headers(&self) -> HashMap<String, String> {
        HashMap::from([("x-goog-api-key".to_string(), self.api_key.clone())])
    }
}

fn normalize_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

#[async_trait]
impl LLMProvider for GoogleGeminiProvider {
    async fn chat(&self, request: ProviderRequest) -> Result<ChatResponse, LLMError> {
        let body = build_gemini_body(&request);
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(&request.model),
            self.build_headers(),
            self.timeout,
            &body,
        )
        .await?;
        let status = response.status;
        let wait = retry_after(&response.headers);
        let text = response.into_string()?;
        if !(200..300).contains(&status) {
            return Err(parse_gemini_error(status, &text, wait));
        }
        let parsed: GeminiResponse = parse_payload(self.name(), &text)?;
        map_response(parsed, self.name())
    }

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChatStream, LLMError> {
        let body = build_gemini_body(&request);
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.stream_endpoint(&request.model),
            self.build_headers(),
            self.timeout,
            &body,
        )
        .await?;
        if !response.is_success() {
            let wait = retry_after(&response.headers);
            let text = collect_stream_text(response.body, self.name()).await?;
            return Err(parse_gemini_error(response.status, &text, wait));
        }
        Ok(create_stream(response.body, self.name()))
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_stream: true,
            supports_image_input: true,
            supports_image_output: true,
        }
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}
