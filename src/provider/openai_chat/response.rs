use crate::types::{ChatResponse, FinishReason, ImageData, TokenUsage};

use super::types::{OpenAiChatResponse, OpenAiMessageContent, OpenAiUsage};

pub(crate) fn map_response(response: OpenAiChatResponse) -> ChatResponse {
    let mut text = String::new();
    let mut images = Vec::new();
    let mut finish_reason = None;

    if let Some(choice) = response.choices.into_iter().next() {
        finish_reason = choice.finish_reason.as_deref().map(convert_finish_reason);
        if let Some(content) = choice.message.and_then(|message| message.content) {
            collect_content(content, &mut text, &mut images);
        }
    }

    ChatResponse {
        text,
        images,
        usage: response.usage.map(convert_usage),
        finish_reason,
        model: response.model,
    }
}

/// Appends text parts to `text` and image parts to `images`.
pub(crate) fn collect_content(
    content: OpenAiMessageContent,
    text: &mut String,
    images: &mut Vec<ImageData>,
) {
    match content {
        OpenAiMessageContent::Text(value) => text.push_str(&value),
        OpenAiMessageContent::Parts(parts) => {
            for part in parts {
                match part.kind.as_str() {
                    "text" | "output_text" => {
                        if let Some(value) = part.text {
                            text.push_str(&value);
                        }
                    }
                    "image_url" => {
                        if let Some(image) = part.image_url {
                            images.push(image_from_url(image.url));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

fn image_from_url(url: String) -> ImageData {
    match url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        Some((mime, data)) => ImageData::inline(data, mime),
        None => ImageData::hosted(url, "image/png"),
    }
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn convert_usage(usage: OpenAiUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    }
}
