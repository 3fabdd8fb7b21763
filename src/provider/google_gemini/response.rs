use crate::error::LLMError;
use crate::types::{ChatResponse, FinishReason, ImageData, TokenUsage};

use super::types::{GeminiResponse, GeminiUsageMetadata};

/// Visible output extracted from one response or stream chunk.
pub(crate) struct GeminiOutput {
    pub(crate) text: String,
    pub(crate) images: Vec<ImageData>,
    pub(crate) finish_reason: Option<FinishReason>,
    pub(crate) usage: Option<TokenUsage>,
}

pub(crate) fn extract_output(
    response: GeminiResponse,
    provider: &'static str,
) -> Result<GeminiOutput, LLMError> {
    if let Some(reason) = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        return Err(LLMError::provider(
            provider,
            format!("prompt blocked by safety filters ({reason})"),
        ));
    }

    let mut output = GeminiOutput {
        text: String::new(),
        images: Vec::new(),
        finish_reason: None,
        usage: response.usage_metadata.map(convert_usage),
    };
    if let Some(candidate) = response.candidates.into_iter().next() {
        output.finish_reason = candidate.finish_reason.as_deref().map(convert_finish_reason);
        for part in candidate.content.into_iter().flat_map(|content| content.parts) {
            if part.thought == Some(true) {
                continue;
            }
            if let Some(text) = part.text {
                output.text.push_str(&text);
            }
            if let Some(inline) = part.inline_data {
                output
                    .images
                    .push(ImageData::inline(inline.data, inline.mime_type));
            }
        }
    }
    Ok(output)
}

pub(crate) fn map_response(
    response: GeminiResponse,
    provider: &'static str,
) -> Result<ChatResponse, LLMError> {
    let model = response.model_version.clone();
    let output = extract_output(response, provider)?;
    Ok(ChatResponse {
        text: output.text,
        images: output.images,
        usage: output.usage,
        finish_reason: output.finish_reason,
        model,
    })
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "IMAGE_SAFETY" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_ascii_lowercase()),
    }
}

fn convert_usage(usage: GeminiUsageMetadata) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
    }
}
