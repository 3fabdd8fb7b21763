use std::collections::VecDeque;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::{ChatStream, parse_payload};
use crate::stream::{EventConverter, NdjsonDecoder, convert_stream};
use crate::types::ProviderEvent;

use super::error::map_error_message;
use super::response::{chunk_usage, convert_done_reason, convert_images};
use super::types::OllamaChatChunk;

pub(crate) fn create_stream(body: HttpBodyStream, provider: &'static str) -> ChatStream {
    convert_stream(NdjsonDecoder::new(body, provider), OllamaConverter { provider })
}

struct OllamaConverter {
    provider: &'static str,
}

impl EventConverter for OllamaConverter {
    type Item = String;

    fn convert(&mut self, line: String, out: &mut VecDeque<ProviderEvent>) -> Result<(), LLMError> {
        let chunk: OllamaChatChunk = parse_payload(self.provider, &line)?;
        if let Some(error) = &chunk.error {
            return Err(map_error_message(None, error));
        }
        let usage = chunk_usage(&chunk);
        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                out.push_back(ProviderEvent::TextDelta(message.content));
            }
            out.extend(
                convert_images(message.images)
                    .into_iter()
                    .map(ProviderEvent::ImageDelta),
            );
        }
        if chunk.done {
            if let Some(usage) = usage {
                out.push_back(ProviderEvent::Usage(usage));
            }
            out.push_back(ProviderEvent::Finished(convert_done_reason(
                chunk.done_reason.as_deref(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{StreamExt, stream};

    use super::*;
    use crate::types::{FinishReason, TokenUsage};

    fn body(text: &str) -> HttpBodyStream {
        Box::pin(stream::iter(vec![Ok(text.as_bytes().to_vec())]))
    }

    #[tokio::test]
    async fn final_line_carries_usage_and_reason() {
        let ndjson = concat!(
            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":26,\"eval_count\":2}\n",
        );
        let events: Vec<_> = create_stream(body(ndjson), "ollama")
            .map(|event| event.expect("event"))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                ProviderEvent::TextDelta("Hel".into()),
                ProviderEvent::TextDelta("lo".into()),
                ProviderEvent::Usage(TokenUsage::new(26, 2)),
                ProviderEvent::Finished(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn error_line_fails_the_stream() {
        let mut stream = create_stream(body("{\"error\":\"model 'nope' not found\"}\n"), "ollama");
        assert!(matches!(
            stream.next().await,
            Some(Err(LLMError::ModelNotFound { .. }))
        ));
    }
}
