use std::collections::VecDeque;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::{ChatStream, parse_payload};
use crate::stream::{EventConverter, SseDecoder, SseEvent, convert_stream};
use crate::types::{FinishReason, ProviderEvent};

use super::response::extract_output;
use super::types::GeminiResponse;

pub(crate) fn create_stream(body: HttpBodyStream, provider: &'static str) -> ChatStream {
    convert_stream(
        SseDecoder::new(body, provider),
        GeminiConverter {
            provider,
            finish: None,
        },
    )
}

/// Gemini has no end-of-stream marker; the last chunk carries `finishReason`
/// and the body simply closes.
struct GeminiConverter {
    provider: &'static str,
    finish: Option<FinishReason>,
}

impl EventConverter for GeminiConverter {
    type Item = SseEvent;

    fn convert(&mut self, item: SseEvent, out: &mut VecDeque<ProviderEvent>) -> Result<(), LLMError> {
        let SseEvent::Data { data, .. } = item else {
            return Ok(());
        };
        let chunk: GeminiResponse = parse_payload(self.provider, &data)?;
        let output = extract_output(chunk, self.provider)?;
        if !output.text.is_empty() {
            out.push_back(ProviderEvent::TextDelta(output.text));
        }
        out.extend(output.images.into_iter().map(ProviderEvent::ImageDelta));
        if let Some(usage) = output.usage {
            out.push_back(ProviderEvent::Usage(usage));
        }
        if output.finish_reason.is_some() {
            self.finish = output.finish_reason;
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut VecDeque<ProviderEvent>) {
        if let Some(reason) = self.finish.take() {
            out.push_back(ProviderEvent::Finished(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{StreamExt, stream};

    use super::*;
    use crate::types::{ImageData, TokenUsage};

    fn body(text: &str) -> HttpBodyStream {
        Box::pin(stream::iter(vec![Ok(text.as_bytes().to_vec())]))
    }

    #[tokio::test]
    async fn emits_text_images_and_trailing_finish() {
        let sse = "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Here\"}]}}]}\r\n\r\n\
data: {\"candidates\":[{\"content\":{\"parts\":[{\"inlineData\":{\"mimeType\":\"image/png\",\"data\":\"iVBO\"}}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":6,\"candidatesTokenCount\":12}}\r\n\r\n";
        let events: Vec<_> = create_stream(body(sse), "gemini")
            .map(|event| event.expect("event"))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                ProviderEvent::TextDelta("Here".into()),
                ProviderEvent::ImageDelta(ImageData::inline("iVBO", "image/png")),
                ProviderEvent::Usage(TokenUsage::new(6, 12)),
                ProviderEvent::Finished(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn blocked_prompt_fails() {
        let sse = "data: {\"promptFeedback\":{\"blockReason\":\"SAFETY\"}}\n\n";
        let mut stream = create_stream(body(sse), "gemini");
        assert!(matches!(
            stream.next().await,
            Some(Err(LLMError::Provider { .. }))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_has_no_terminal() {
        let sse = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"cut\"}]}}]}\n\n";
        let events: Vec<_> = create_stream(body(sse), "gemini").collect().await;
        assert_eq!(events.len(), 1);
    }
}
