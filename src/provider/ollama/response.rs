use crate::types::{ChatResponse, FinishReason, ImageData, TokenUsage};

use super::types::OllamaChatChunk;

pub(crate) fn map_response(chunk: OllamaChatChunk) -> ChatResponse {
    let usage = chunk_usage(&chunk);
    let finish_reason = Some(convert_done_reason(chunk.done_reason.as_deref()));
    let message = chunk.message.unwrap_or_default();
    ChatResponse {
        text: message.content,
        images: convert_images(message.images),
        usage,
        finish_reason,
        model: chunk.model,
    }
}

pub(crate) fn convert_images(images: Option<Vec<String>>) -> Vec<ImageData> {
    images
        .unwrap_or_default()
        .into_iter()
        .map(|data| ImageData::inline(data, "image/png"))
        .collect()
}

pub(crate) fn chunk_usage(chunk: &OllamaChatChunk) -> Option<TokenUsage> {
    if chunk.prompt_eval_count.is_none() && chunk.eval_count.is_none() {
        return None;
    }
    Some(TokenUsage {
        prompt_tokens: chunk.prompt_eval_count,
        completion_tokens: chunk.eval_count,
    })
}

pub(crate) fn convert_done_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        None | Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some(other) => FinishReason::Other(other.to_string()),
    }
}
