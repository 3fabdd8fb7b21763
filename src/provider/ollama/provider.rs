use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LLMError;
use crate::http::{DynHttpTransport, post_json_stream_with_headers, post_json_with_headers};
use crate::provider::{ChatStream, LLMProvider, parse_payload};
use crate::stream::collect_stream_text;
use crate::types::{CapabilityDescriptor, ChatResponse, ProviderRequest};

use super::error::{map_error_message, parse_ollama_error};
use super::request::build_ollama_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::OllamaChatChunk;

pub(crate) const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local Ollama server; needs no credentials.
pub struct OllamaProvider {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) timeout: Option<Duration>,
}

impl OllamaProvider {
    /// 连接指定地址的 Ollama 服务
    pub fn new(transport: DynHttpTransport, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            timeout: None,
        }
    }

    /// 设置请求超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    async fn chat(&self, request: ProviderRequest) -> Result<ChatResponse, LLMError> {
        let body = build_ollama_body(&request, false);
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            HashMap::new(),
            self.timeout,
            &body,
        )
        .await?;
        let status = response.status;
        let text = response.into_string()?;
        if !(200..300).contains(&status) {
            return Err(parse_ollama_error(status, &text));
        }
        let parsed: OllamaChatChunk = parse_payload(self.name(), &text)?;
        if let Some(error) = &parsed.error {
            return Err(map_error_message(None, error));
        }
        Ok(map_response(parsed))
    }

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChatStream, LLMError> {
        let body = build_ollama_body(&request, true);
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            HashMap::new(),
            self.timeout,
            &body,
        )
        .await?;
        if !response.is_success() {
            let text = collect_stream_text(response.body, self.name()).await?;
            return Err(parse_ollama_error(response.status, &text));
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
        "ollama"
    }
}
