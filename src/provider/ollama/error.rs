use serde::Deserialize;

use crate::error::{LLMError, extract_model_identifier, looks_like_token_limit_error};
use crate::provider::unrecognized_error_body;

const PROVIDER: &str = "ollama";

/// Ollama reports failures as `{"error": "..."}` with a plain message.
pub(crate) fn parse_ollama_error(status: u16, body: &str) -> LLMError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => map_error_message(Some(status), &parsed.error),
        Err(_) => unrecognized_error_body(PROVIDER, status, body, None),
    }
}

pub(crate) fn map_error_message(status: Option<u16>, message: &str) -> LLMError {
    let message = message.to_string();
    if status == Some(404) || (message.contains("model") && message.contains("not found")) {
        return LLMError::ModelNotFound {
            model: extract_model_identifier(&message),
            message,
        };
    }
    if looks_like_token_limit_error(None, &message) {
        return LLMError::TokenLimitExceeded { message };
    }
    match status {
        Some(400) => LLMError::Validation { message },
        _ => LLMError::provider(PROVIDER, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_detected() {
        match parse_ollama_error(404, r#"{"error":"model \"llama9\" not found, try pulling it first"}"#) {
            LLMError::ModelNotFound { model, .. } => assert_eq!(model.as_deref(), Some("llama9")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn plain_text_bodies_fall_back() {
        assert!(matches!(
            parse_ollama_error(500, "internal error"),
            LLMError::Provider { .. }
        ));
    }
}
