use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{LLMError, extract_model_identifier, looks_like_token_limit_error};
use crate::http::retry_after;
use crate::provider::unrecognized_error_body;

const PROVIDER: &str = "openai";

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<InnerError>,
}

#[derive(Deserialize)]
struct InnerError {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<Value>,
}

pub(crate) fn parse_openai_error(
    status: u16,
    body: &str,
    headers: &HashMap<String, String>,
) -> LLMError {
    let inner = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error);
    let Some(inner) = inner else {
        return unrecognized_error_body(PROVIDER, status, body, retry_after(headers));
    };

    let code = inner.code.as_ref().and_then(code_as_string);
    let message = inner.message.unwrap_or_else(|| "unknown error".to_string());
    if looks_like_token_limit_error(code.as_deref(), &message) {
        return LLMError::TokenLimitExceeded { message };
    }
    match status {
        401 | 403 => LLMError::Auth { message },
        429 => LLMError::RateLimit {
            message,
            retry_after: retry_after(headers),
        },
        404 if code.as_deref() == Some("model_not_found") || message.contains("model") => {
            LLMError::ModelNotFound {
                model: extract_model_identifier(&message),
                message,
            }
        }
        400 | 422 => LLMError::Validation { message },
        _ => LLMError::provider(
            PROVIDER,
            match inner.kind {
                Some(kind) => format!("{message} ({kind})"),
                None => message,
            },
        ),
    }
}

/// Maps an `error` object received inside the event stream.
pub(crate) fn parse_openai_stream_error(error: &Value) -> LLMError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("stream reported an error")
        .to_string();
    let code = error.get("code").and_then(code_as_string);
    if looks_like_token_limit_error(code.as_deref(), &message) {
        return LLMError::TokenLimitExceeded { message };
    }
    LLMError::provider(PROVIDER, message)
}

fn code_as_string(code: &Value) -> Option<String> {
    match code {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
