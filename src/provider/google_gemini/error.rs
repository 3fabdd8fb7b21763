use std::time::Duration;

use serde::Deserialize;

use crate::error::{LLMError, extract_model_identifier, looks_like_token_limit_error};
use crate::provider::unrecognized_error_body;

const PROVIDER: &str = "gemini";

/// Parses error responses returned by Google Gemini.
pub(crate) fn parse_gemini_error(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> LLMError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<InnerError>,
    }

    #[derive(Deserialize)]
    struct InnerError {
        message: Option<String>,
        status: Option<String>,
    }

    let Some(error) = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
    else {
        return unrecognized_error_body(PROVIDER, status, body, retry_after);
    };

    let rpc_status = error.status.unwrap_or_default();
    let mut message = error.message.unwrap_or_else(|| "unknown error".to_string());
    if !rpc_status.is_empty() {
        message = format!("{message} ({rpc_status})");
    }

    if looks_like_token_limit_error(Some(&rpc_status), &message) {
        return LLMError::TokenLimitExceeded { message };
    }
    if status == 404 || rpc_status == "NOT_FOUND" {
        return LLMError::ModelNotFound {
            model: extract_model_identifier(&message),
            message,
        };
    }
    match (status, rpc_status.as_str()) {
        (401 | 403, _) | (_, "UNAUTHENTICATED" | "PERMISSION_DENIED") => {
            LLMError::Auth { message }
        }
        // Gemini reports a bad key as INVALID_ARGUMENT with a 400.
        (400, _) if message.contains("API key") => LLMError::Auth { message },
        (429, _) | (_, "RESOURCE_EXHAUSTED") => LLMError::RateLimit {
            message,
            retry_after,
        },
        (400, _) => LLMError::Validation { message },
        _ => LLMError::provider(PROVIDER, message),
    }
}
