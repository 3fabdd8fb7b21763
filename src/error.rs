use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Aggregates every failure mode a provider adapter can run into.
///
/// These never cross the adapter boundary: [`crate::provider::stream_events`]
/// folds them into a `Failed` event carrying an [`ErrorCode`], so the
/// orchestrator finalizes every outcome the same way.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Represents transport-layer or networking failures.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Reports invalid or missing credentials.
    #[error("auth failure: {message}")]
    Auth { message: String },
    /// Indicates that the provider throttled the request.
    #[error("rate limited: {message}")]
    RateLimit {
        /// Raw message returned by the upstream provider.
        message: String,
        /// Optional wait duration suggested by the provider before retrying.
        retry_after: Option<Duration>,
    },
    /// Indicates that the prompt or expected completion exceeds the allowed token budget.
    #[error("token limit exceeded: {message}")]
    TokenLimitExceeded { message: String },
    /// Signals validation failures in the request payload.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Declares that a capability is not supported by the selected provider.
    #[error("feature unsupported: {feature}")]
    UnsupportedFeature { feature: &'static str },
    /// Indicates that a requested model could not be resolved.
    #[error("model not found: {message}")]
    ModelNotFound {
        /// Model identifier extracted from the error payload when available.
        model: Option<String>,
        /// Full error message returned by the provider for debugging.
        message: String,
    },
    /// Raised when building or validating configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
    /// Signals that a streaming channel closed before delivering a terminal marker.
    #[error("stream closed unexpectedly: {message}")]
    StreamClosed { message: String },
    /// Upstream payload that could not be understood.
    ///
    /// `raw` keeps the offending payload for the logs; it is never forwarded to clients.
    #[error("provider {provider} sent an unexpected payload: {message}")]
    Protocol {
        provider: &'static str,
        message: String,
        raw: Option<String>,
    },
    /// Wraps provider-defined errors that cannot be normalized.
    #[error("provider {provider} error: {message}")]
    Provider {
        /// Name of the provider, such as `openai`.
        provider: &'static str,
        /// Human-readable error message returned by the provider.
        message: String,
    },
}

impl LLMError {
    /// Creates an [`LLMError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba_chat::error::LLMError;
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert!(matches!(err, LLMError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Provider`] with the given provider name and message.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba_chat::error::LLMError;
    ///
    /// let err = LLMError::provider("openai", "overloaded");
    /// assert!(matches!(err, LLMError::Provider { provider: "openai", .. }));
    /// ```
    pub fn provider<T: Into<String>>(provider: &'static str, message: T) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Protocol`] that remembers the raw payload.
    pub fn protocol<T: Into<String>>(
        provider: &'static str,
        message: T,
        raw: impl Into<Option<String>>,
    ) -> Self {
        Self::Protocol {
            provider,
            message: message.into(),
            raw: raw.into(),
        }
    }

    /// Stable wire code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            LLMError::Transport { .. } | LLMError::StreamClosed { .. } => {
                ErrorCode::ProviderTransportError
            }
            LLMError::Provider { .. } => ErrorCode::ProviderTransportError,
            LLMError::Auth { .. } => ErrorCode::AuthenticationFailed,
            LLMError::RateLimit { .. } => ErrorCode::RateLimited,
            LLMError::TokenLimitExceeded { .. } => ErrorCode::ContextLengthExceeded,
            LLMError::ModelNotFound { .. } => ErrorCode::ModelNotFound,
            LLMError::Protocol { .. } => ErrorCode::ProviderProtocolError,
            LLMError::InvalidConfig { .. } => ErrorCode::ProviderNotConfigured,
            LLMError::Validation { .. } | LLMError::UnsupportedFeature { .. } => {
                ErrorCode::GenerationFailed
            }
        }
    }

    /// Message that is safe to show to the end user.
    ///
    /// Protocol failures are reduced to a generic sentence; the payload only goes to the logs.
    pub fn public_message(&self) -> String {
        match self {
            LLMError::Protocol { provider, .. } => {
                format!("provider {provider} returned a response that could not be understood")
            }
            other => other.to_string(),
        }
    }
}

/// Stable error codes carried by the `error` wire event.
///
/// Clients branch on these to tell "configure your API key" apart from
/// "upstream is down" and "generation failed mid-way".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ProviderNotConfigured,
    ProviderTransportError,
    ProviderProtocolError,
    RateLimited,
    AuthenticationFailed,
    ContextLengthExceeded,
    ModelNotFound,
    GenerationFailed,
}

impl ErrorCode {
    /// Wire spelling, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProviderNotConfigured => "ProviderNotConfigured",
            ErrorCode::ProviderTransportError => "ProviderTransportError",
            ErrorCode::ProviderProtocolError => "ProviderProtocolError",
            ErrorCode::RateLimited => "RateLimited",
            ErrorCode::AuthenticationFailed => "AuthenticationFailed",
            ErrorCode::ContextLengthExceeded => "ContextLengthExceeded",
            ErrorCode::ModelNotFound => "ModelNotFound",
            ErrorCode::GenerationFailed => "GenerationFailed",
        }
    }

    /// Short human-readable headline for the error event.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorCode::ProviderNotConfigured => "Provider not configured",
            ErrorCode::ProviderTransportError => "Provider unavailable",
            ErrorCode::ProviderProtocolError => "Unexpected provider response",
            ErrorCode::RateLimited => "Rate limited",
            ErrorCode::AuthenticationFailed => "Authentication failed",
            ErrorCode::ContextLengthExceeded => "Conversation too long",
            ErrorCode::ModelNotFound => "Model not found",
            ErrorCode::GenerationFailed => "Generation failed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures raised synchronously by the pipeline, before any stream starts.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The inbound request is malformed.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// The provider identifier is not one this crate knows about.
    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },
    /// The user has no usable credentials for the provider.
    #[error("provider {provider} is not configured for this user")]
    ProviderNotConfigured { provider: String },
    /// The conversation does not exist or belongs to someone else.
    #[error("conversation {id} not found")]
    ConversationNotFound { id: uuid::Uuid },
    /// A collaborator store failed before the stream started.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Failures reported by persistence and lookup collaborators.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },
    #[error("record not found: {message}")]
    NotFound { message: String },
}

impl StoreError {
    pub fn unavailable<T: Into<String>>(message: T) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Returns `true` when an error code or message suggests a context/window overflow.
pub(crate) fn looks_like_token_limit_error(code_hint: Option<&str>, message: &str) -> bool {
    if let Some(code) = code_hint {
        let lower = code.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "context_length_exceeded"
                | "max_context_length_exceeded"
                | "prompt_tokens_exceeded"
                | "context_window_exceeded"
        ) || lower.contains("token")
        {
            return true;
        }
    }

    let lower_message = message.to_ascii_lowercase();
    const HINTS: [&str; 6] = [
        "context length",
        "context window",
        "token limit",
        "maximum output tokens",
        "max output tokens",
        "prompt is too long",
    ];
    HINTS.iter().any(|needle| lower_message.contains(needle))
}

/// Attempts to extract a model identifier from an error payload.
pub(crate) fn extract_model_identifier(message: &str) -> Option<String> {
    for delimiter in ['`', '"', '\''] {
        if let Some(value) = between_delimiters(message, delimiter) {
            if !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn between_delimiters(message: &str, delimiter: char) -> Option<String> {
    let start = message.find(delimiter)? + delimiter.len_utf8();
    let rest = message.get(start..)?;
    let end = rest.find(delimiter)?;
    Some(rest[..end].to_string())
}
