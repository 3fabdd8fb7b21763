//! Shared data structures for one chat turn.
//!
//! Requests are normalized here so adapters only translate a single shape into
//! their native wire format, and every adapter reports back through
//! [`ProviderEvent`].

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, ErrorCode};

mod record;

pub use record::{
    AssembledMessage, AttachmentRef, CANCELLATION_MARKER, Conversation, MetricOutcome,
    StoredMessage, UsageMetric,
};

/// Chat role string compatible with provider-specific semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub String);

impl Role {
    pub fn system() -> Self {
        Self("system".to_string())
    }

    pub fn user() -> Self {
        Self("user".to_string())
    }

    pub fn assistant() -> Self {
        Self("assistant".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Binary file uploaded alongside a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Text-like attachments are inlined into the prompt instead of being sent as media.
    pub fn is_text(&self) -> bool {
        self.mime_type.starts_with("text/")
            || matches!(
                self.mime_type.as_str(),
                "application/json" | "application/xml" | "application/x-yaml"
            )
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// Lossy UTF-8 view used when inlining text attachments.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// One prior or current turn of the conversation as seen by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::user(),
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::assistant(),
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

/// Sampling knobs forwarded to the provider when set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingParams {
    /// Sampling temperature, typically within `0.0..=2.0`.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter where `1.0` disables the filter.
    pub top_p: Option<f32>,
    /// Restricts sampling to the `k` most likely tokens.
    pub top_k: Option<u32>,
    /// Maximum number of output tokens.
    pub max_tokens: Option<u32>,
}

impl SamplingParams {
    pub(crate) fn validate(&self) -> Result<(), ChatError> {
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ChatError::validation(format!(
                    "temperature must be within 0.0..=2.0, got {temperature}"
                )));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ChatError::validation(format!(
                    "top_p must be within 0.0..=1.0, got {top_p}"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ChatError::validation("max_tokens must be positive"));
        }
        Ok(())
    }
}

/// Chunk size and cadence used to re-pace text deltas.
///
/// Zero values fall back to the smoother defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pacing {
    pub chunk_size: usize,
    pub interval: Duration,
}

impl Pacing {
    pub fn new(chunk_size: usize, interval: Duration) -> Self {
        Self {
            chunk_size,
            interval,
        }
    }
}

/// Reference to a stored prompt template plus its variable bindings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromptRef {
    pub id: String,
    pub variables: HashMap<String, String>,
}

/// One inbound chat turn, immutable once built.
///
/// # Examples
///
/// ```
/// use kotoba_chat::types::{CompletionRequest, SamplingParams};
///
/// let request = CompletionRequest::builder("user-1", "openai", "gpt-4.1-mini", "Hello!")
///     .sampling(SamplingParams { temperature: Some(0.2), ..Default::default() })
///     .stream(true)
///     .build()
///     .unwrap();
/// assert!(request.conversation_id().is_none());
/// assert_eq!(request.provider(), "openai");
/// ```
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    conversation_id: Option<Uuid>,
    user_id: String,
    message: String,
    history: Option<Vec<ChatTurn>>,
    persona_id: Option<String>,
    system_prompt: Option<String>,
    prompt: Option<PromptRef>,
    sampling: SamplingParams,
    attachments: Vec<Attachment>,
    provider: String,
    model: String,
    stream: bool,
    pacing: Option<Pacing>,
}

impl CompletionRequest {
    pub fn builder(
        user_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> CompletionRequestBuilder {
        CompletionRequestBuilder {
            inner: CompletionRequest {
                conversation_id: None,
                user_id: user_id.into(),
                message: message.into(),
                history: None,
                persona_id: None,
                system_prompt: None,
                prompt: None,
                sampling: SamplingParams::default(),
                attachments: Vec::new(),
                provider: provider.into(),
                model: model.into(),
                stream: true,
                pacing: None,
            },
        }
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.conversation_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Caller-supplied prior turns; `None` means "load the stored history".
    pub fn history(&self) -> Option<&[ChatTurn]> {
        self.history.as_deref()
    }

    pub fn persona_id(&self) -> Option<&str> {
        self.persona_id.as_deref()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn prompt(&self) -> Option<&PromptRef> {
        self.prompt.as_ref()
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn pacing(&self) -> Option<Pacing> {
        self.pacing
    }
}

/// Builder for [`CompletionRequest`]; `build` runs the synchronous validation.
pub struct CompletionRequestBuilder {
    inner: CompletionRequest,
}

impl CompletionRequestBuilder {
    pub fn conversation_id(mut self, id: Uuid) -> Self {
        self.inner.conversation_id = Some(id);
        self
    }

    pub fn history(mut self, turns: Vec<ChatTurn>) -> Self {
        self.inner.history = Some(turns);
        self
    }

    pub fn persona_id(mut self, persona_id: impl Into<String>) -> Self {
        self.inner.persona_id = Some(persona_id.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.inner.system_prompt = Some(prompt.into());
        self
    }

    pub fn prompt(mut self, prompt: PromptRef) -> Self {
        self.inner.prompt = Some(prompt);
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.inner.sampling = sampling;
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.inner.attachments.push(attachment);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.inner.stream = stream;
        self
    }

    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.inner.pacing = Some(pacing);
        self
    }

    pub fn build(self) -> Result<CompletionRequest, ChatError> {
        let request = self.inner;
        if request.user_id.trim().is_empty() {
            return Err(ChatError::validation("user id is required"));
        }
        if request.provider.trim().is_empty() {
            return Err(ChatError::validation("provider is required"));
        }
        if request.model.trim().is_empty() {
            return Err(ChatError::validation("model is required"));
        }
        if request.message.trim().is_empty() && request.attachments.is_empty() {
            return Err(ChatError::validation(
                "message must contain text or at least one attachment",
            ));
        }
        request.sampling.validate()?;
        Ok(request)
    }
}

/// Normalized request handed to a provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    /// System instruction, already resolved from override or persona.
    pub system: Option<String>,
    /// Prior turns followed by the new user turn.
    pub messages: Vec<ChatTurn>,
    pub sampling: SamplingParams,
}

/// Image produced by a provider, either hosted or inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base64 payload for inline images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub mime_type: String,
}

impl ImageData {
    pub fn inline(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            url: None,
            data: Some(data.into()),
            mime_type: mime_type.into(),
        }
    }

    pub fn hosted(url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            data: None,
            mime_type: mime_type.into(),
        }
    }
}

/// Token usage reported by the provider.
///
/// Providers often split usage across several stream payloads; [`TokenUsage::merge`]
/// folds them into one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
        }
    }

    /// Later reports win field by field; missing fields keep the earlier value.
    pub fn merge(self, later: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: later.prompt_tokens.or(self.prompt_tokens),
            completion_tokens: later.completion_tokens.or(self.completion_tokens),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none()
    }

    pub fn prompt(&self) -> u64 {
        self.prompt_tokens.unwrap_or(0)
    }

    pub fn completion(&self) -> u64 {
        self.completion_tokens.unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.prompt() + self.completion()
    }
}

/// Why a response stopped generating content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Cancelled,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Other(other) => other,
        }
    }
}

impl From<String> for FinishReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            "error" => FinishReason::Error,
            "cancelled" => FinishReason::Cancelled,
            _ => FinishReason::Other(value),
        }
    }
}

impl From<FinishReason> for String {
    fn from(value: FinishReason) -> Self {
        value.as_str().to_string()
    }
}

/// Raw event produced by a provider adapter.
///
/// A well-formed stream carries any number of deltas, at most one `Usage`
/// and exactly one terminal event (`Finished` or `Failed`).
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ImageDelta(ImageData),
    Usage(TokenUsage),
    Finished(FinishReason),
    Failed { code: ErrorCode, message: String },
}

impl ProviderEvent {
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        ProviderEvent::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderEvent::Finished(_) | ProviderEvent::Failed { .. }
        )
    }
}

/// Complete, non-streamed provider answer.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub images: Vec<ImageData>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
    /// Effective model identifier reported by the provider.
    pub model: Option<String>,
}

impl ChatResponse {
    /// Replays a batch answer as the event sequence a streaming provider would emit.
    pub fn into_events(self) -> Vec<ProviderEvent> {
        let mut events = Vec::with_capacity(self.images.len() + 3);
        if !self.text.is_empty() {
            events.push(ProviderEvent::TextDelta(self.text));
        }
        events.extend(self.images.into_iter().map(ProviderEvent::ImageDelta));
        if let Some(usage) = self.usage {
            events.push(ProviderEvent::Usage(usage));
        }
        events.push(ProviderEvent::Finished(
            self.finish_reason.unwrap_or(FinishReason::Stop),
        ));
        events
    }
}

/// Capability descriptor used by the adapter boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilityDescriptor {
    /// Whether the provider supports streaming outputs.
    pub supports_stream: bool,
    /// Whether image inputs are supported.
    pub supports_image_input: bool,
    /// Whether the provider may answer with images.
    pub supports_image_output: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_empty_message_without_attachments() {
        let err = CompletionRequest::builder("u1", "openai", "gpt", "   ")
            .build()
            .expect_err("should fail");
        assert!(matches!(err, ChatError::Validation { .. }));

        let ok = CompletionRequest::builder("u1", "openai", "gpt", "")
            .attachment(Attachment::new("a.png", "image/png", vec![1, 2, 3]))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn builder_validates_sampling_ranges() {
        let err = CompletionRequest::builder("u1", "openai", "gpt", "hi")
            .sampling(SamplingParams {
                temperature: Some(3.5),
                ..Default::default()
            })
            .build()
            .expect_err("temperature out of range");
        match err {
            ChatError::Validation { message } => assert!(message.contains("temperature")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn usage_merge_keeps_latest_known_values() {
        let start = TokenUsage {
            prompt_tokens: Some(12),
            completion_tokens: Some(1),
        };
        let delta = TokenUsage {
            prompt_tokens: None,
            completion_tokens: Some(40),
        };
        let merged = start.merge(delta);
        assert_eq!(merged.prompt_tokens, Some(12));
        assert_eq!(merged.completion_tokens, Some(40));
        assert_eq!(merged.total(), 52);
    }

    #[test]
    fn finish_reason_round_trips_through_strings() {
        assert_eq!(FinishReason::from("length".to_string()), FinishReason::Length);
        assert_eq!(
            FinishReason::from("end_turn".to_string()),
            FinishReason::Other("end_turn".to_string())
        );
        let json = serde_json::to_value(FinishReason::ContentFilter).expect("serialize");
        assert_eq!(json, serde_json::json!("content_filter"));
    }

    #[test]
    fn batch_response_replays_as_single_delta() {
        let response = ChatResponse {
            text: "whole answer".to_string(),
            images: Vec::new(),
            usage: Some(TokenUsage::new(3, 2)),
            finish_reason: None,
            model: None,
        };
        let events = response.into_events();
        assert_eq!(
            events,
            vec![
                ProviderEvent::TextDelta("whole answer".to_string()),
                ProviderEvent::Usage(TokenUsage::new(3, 2)),
                ProviderEvent::Finished(FinishReason::Stop),
            ]
        );
    }

    #[test]
    fn text_attachments_are_detected() {
        assert!(Attachment::new("n.md", "text/markdown", Vec::new()).is_text());
        assert!(Attachment::new("d.json", "application/json", Vec::new()).is_text());
        assert!(!Attachment::new("p.png", "image/png", Vec::new()).is_text());
    }
}
