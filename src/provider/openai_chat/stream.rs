use std::collections::VecDeque;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::{ChatStream, parse_payload};
use crate::stream::{EventConverter, SseDecoder, SseEvent, convert_stream};
use crate::types::{FinishReason, ProviderEvent};

use super::error::parse_openai_stream_error;
use super::response::{collect_content, convert_finish_reason, convert_usage};
use super::types::OpenAiStreamChunk;

pub(crate) fn create_stream(body: HttpBodyStream, provider: &'static str) -> ChatStream {
    convert_stream(
        SseDecoder::new(body, provider),
        OpenAiConverter {
            provider,
            finish: None,
            done: false,
        },
    )
}

/// The finish reason is held back until `[DONE]` because the usage chunk
/// arrives after the choice that carries it.
struct OpenAiConverter {
    provider: &'static str,
    finish: Option<FinishReason>,
    done: bool,
}

impl EventConverter for OpenAiConverter {
    type Item = SseEvent;

    fn convert(&mut self, item: SseEvent, out: &mut VecDeque<ProviderEvent>) -> Result<(), LLMError> {
        if self.done {
            return Ok(());
        }
        let data = match item {
            SseEvent::Done => {
                self.done = true;
                out.push_back(ProviderEvent::Finished(
                    self.finish.take().unwrap_or(FinishReason::Stop),
                ));
                return Ok(());
            }
            SseEvent::Data { data, .. } => data,
        };

        let chunk: OpenAiStreamChunk = parse_payload(self.provider, &data)?;
        if let Some(error) = chunk.error {
            return Err(parse_openai_stream_error(&error));
        }
        for choice in chunk.choices {
            if let Some(content) = choice.delta.and_then(|delta| delta.content) {
                let mut text = String::new();
                let mut images = Vec::new();
                collect_content(content, &mut text, &mut images);
                if !text.is_empty() {
                    out.push_back(ProviderEvent::TextDelta(text));
                }
                out.extend(images.into_iter().map(ProviderEvent::ImageDelta));
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.finish = Some(convert_finish_reason(reason));
            }
        }
        if let Some(usage) = chunk.usage {
            out.push_back(ProviderEvent::Usage(convert_usage(usage)));
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut VecDeque<ProviderEvent>) {
        // Some compatible servers close the body without `[DONE]`.
        if let Some(reason) = self.finish.take() {
            out.push_back(ProviderEvent::Finished(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{StreamExt, stream};

    use super::*;
    use crate::types::TokenUsage;

    fn body(chunks: &[&str]) -> HttpBodyStream {
        let chunks: Vec<_> = chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn usage_after_finish_reason_is_kept() {
        let stream = create_stream(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2}}\n\n",
                "data: [DONE]\n\n",
            ]),
            "openai",
        );
        let events: Vec<_> = stream.map(|e| e.expect("event")).collect().await;
        assert_eq!(
            events,
            vec![
                ProviderEvent::TextDelta("Hel".into()),
                ProviderEvent::TextDelta("lo".into()),
                ProviderEvent::Usage(TokenUsage::new(7, 2)),
                ProviderEvent::Finished(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_chunk_is_a_protocol_error() {
        let mut stream = create_stream(body(&["data: {not json\n\n"]), "openai");
        match stream.next().await {
            Some(Err(LLMError::Protocol { raw, .. })) => {
                assert_eq!(raw.as_deref(), Some("{not json"));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_band_error_is_surfaced() {
        let mut stream = create_stream(
            body(&["data: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\n"]),
            "openai",
        );
        match stream.next().await {
            Some(Err(LLMError::Provider { message, .. })) => assert!(message.contains("overloaded")),
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
