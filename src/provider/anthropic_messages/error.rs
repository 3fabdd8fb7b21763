use std::time::Duration;

use serde::Deserialize;

use crate::error::{LLMError, extract_model_identifier, looks_like_token_limit_error};
use crate::provider::unrecognized_error_body;

use super::types::AnthropicErrorDetail;

const PROVIDER: &str = "anthropic";

/// Parses error responses returned by the Anthropic Messages API.
pub(crate) fn parse_anthropic_error(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> LLMError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<AnthropicErrorDetail>,
    }

    let Some(error) = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
    else {
        return unrecognized_error_body(PROVIDER, status, body, retry_after);
    };

    let kind = error.kind.unwrap_or_default();
    let message = error.message.unwrap_or_else(|| "unknown error".to_string());
    if looks_like_token_limit_error(Some(&kind), &message) {
        return LLMError::TokenLimitExceeded { message };
    }
    if status == 404 || kind == "not_found_error" {
        return LLMError::ModelNotFound {
            model: extract_model_identifier(&message),
            message,
        };
    }
    match status {
        401 | 403 => LLMError::Auth { message },
        429 => LLMError::RateLimit {
            message,
            retry_after,
        },
        400 => LLMError::Validation { message },
        _ => LLMError::provider(PROVIDER, format!("{message} ({kind})")),
    }
}

/// Maps an `error` event received after the stream started.
pub(crate) fn map_stream_error(error: AnthropicErrorDetail) -> LLMError {
    let kind = error.kind.unwrap_or_default();
    let message = error.message.unwrap_or_else(|| kind.clone());
    match kind.as_str() {
        "rate_limit_error" => LLMError::RateLimit {
            message,
            retry_after: None,
        },
        _ if looks_like_token_limit_error(Some(&kind), &message) => {
            LLMError::TokenLimitExceeded { message }
        }
        _ => LLMError::provider(PROVIDER, message),
    }
}
