use crate::types::{ChatResponse, FinishReason, TokenUsage};

use super::types::{AnthropicMessageResponse, AnthropicUsage};

pub(crate) fn map_response(response: AnthropicMessageResponse) -> ChatResponse {
    let text = response
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<String>();
    ChatResponse {
        text,
        images: Vec::new(),
        usage: response.usage.map(convert_usage),
        finish_reason: response.stop_reason.as_deref().map(convert_stop_reason),
        model: response.model,
    }
}

pub(crate) fn convert_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn convert_usage(usage: AnthropicUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
    }
}
