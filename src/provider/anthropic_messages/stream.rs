use std::collections::VecDeque;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::{ChatStream, parse_payload};
use crate::stream::{EventConverter, SseDecoder, SseEvent, convert_stream};
use crate::types::{FinishReason, ProviderEvent};

use super::error::map_stream_error;
use super::response::{convert_stop_reason, convert_usage};
use super::types::{AnthropicBlockDelta, AnthropicStreamEvent, AnthropicUsage};

pub(crate) fn create_stream(body: HttpBodyStream, provider: &'static str) -> ChatStream {
    convert_stream(
        SseDecoder::new(body, provider),
        AnthropicConverter {
            provider,
            stop_reason: None,
        },
    )
}

struct AnthropicConverter {
    provider: &'static str,
    stop_reason: Option<FinishReason>,
}

impl EventConverter for AnthropicConverter {
    type Item = SseEvent;

    fn convert(&mut self, item: SseEvent, out: &mut VecDeque<ProviderEvent>) -> Result<(), LLMError> {
        let SseEvent::Data { data, .. } = item else {
            return Ok(());
        };
        let event: AnthropicStreamEvent = parse_payload(self.provider, &data)?;
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    out.push_back(ProviderEvent::Usage(convert_usage(usage)));
                }
            }
            AnthropicStreamEvent::ContentBlockDelta {
                delta: AnthropicBlockDelta::TextDelta { text },
            } => {
                if !text.is_empty() {
                    out.push_back(ProviderEvent::TextDelta(text));
                }
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = Some(convert_stop_reason(reason));
                }
                if let Some(usage) = usage {
                    // message_delta only carries the running output count.
                    out.push_back(ProviderEvent::Usage(convert_usage(AnthropicUsage {
                        input_tokens: None,
                        ..usage
                    })));
                }
            }
            AnthropicStreamEvent::MessageStop => {
                out.push_back(ProviderEvent::Finished(
                    self.stop_reason.take().unwrap_or(FinishReason::Stop),
                ));
            }
            AnthropicStreamEvent::Error { error } => return Err(map_stream_error(error)),
            AnthropicStreamEvent::ContentBlockDelta { .. }
            | AnthropicStreamEvent::ContentBlockStart {}
            | AnthropicStreamEvent::ContentBlockStop {}
            | AnthropicStreamEvent::Ping
            | AnthropicStreamEvent::Unknown => {}
        }
        Ok(())
    }
}
