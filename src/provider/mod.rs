use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{StreamExt, stream};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorCode, LLMError};
use crate::types::{CapabilityDescriptor, ChatResponse, ProviderEvent, ProviderRequest, TokenUsage};

pub mod anthropic_messages;
pub mod google_gemini;
pub mod ollama;
pub mod openai_chat;
#[cfg(test)]
pub(crate) mod test_support;

/// Native event stream of a provider; errors are still in-band here.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, LLMError>> + Send>>;

/// Normalized, error-free event stream produced by [`stream_events`].
pub type ProviderEventStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Uniform provider trait; every upstream service implements it to plug into the pipeline.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Submits the full request and waits for the complete response.
    async fn chat(&self, request: ProviderRequest) -> Result<ChatResponse, LLMError>;

    /// Opens a native stream of incremental events.
    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChatStream, LLMError>;

    /// Describes the supported capabilities.
    fn capabilities(&self) -> CapabilityDescriptor;

    /// Provider name, used in logs and metrics.
    fn name(&self) -> &'static str;
}

/// Thread-safe provider handle.
pub type DynProvider = Arc<dyn LLMProvider>;

/// Runs a provider behind the adapter boundary.
///
/// The returned stream never fails: provider errors become one
/// [`ProviderEvent::Failed`], usage reports are merged into a single
/// [`ProviderEvent::Usage`] placed right before the terminal event, and
/// nothing is yielded after the first terminal event. Providers without native
/// streaming are called through [`LLMProvider::chat`] and replayed as one
/// text delta. When `cancel` fires the stream ends at once and the upstream
/// body is dropped, closing the connection.
pub fn stream_events(
    provider: DynProvider,
    request: ProviderRequest,
    cancel: CancellationToken,
) -> ProviderEventStream {
    let state = BoundaryState {
        name: provider.name(),
        phase: Phase::Start { provider, request },
        usage: None,
        pending: VecDeque::new(),
        cancel,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        let event = state.next_event().await?;
        Some((event, state))
    }))
}

enum Phase {
    Start {
        provider: DynProvider,
        request: ProviderRequest,
    },
    Streaming(ChatStream),
    Done,
}

struct BoundaryState {
    name: &'static str,
    phase: Phase,
    usage: Option<TokenUsage>,
    pending: VecDeque<ProviderEvent>,
    cancel: CancellationToken,
}

impl BoundaryState {
    async fn next_event(&mut self) -> Option<ProviderEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Start { provider, request } => {
                    let opened = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        opened = open(provider, request) => opened,
                    };
                    match opened {
                        Ok(inner) => self.phase = Phase::Streaming(inner),
                        Err(err) => self.terminate_with_error(err),
                    }
                }
                Phase::Streaming(mut inner) => {
                    let next = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            debug!(provider = self.name, "provider stream cancelled");
                            return None;
                        }
                        next = inner.next() => next,
                    };
                    match next {
                        Some(Ok(ProviderEvent::Usage(usage))) => {
                            self.usage = Some(match self.usage {
                                Some(existing) => existing.merge(usage),
                                None => usage,
                            });
                            self.phase = Phase::Streaming(inner);
                        }
                        Some(Ok(event)) if event.is_terminal() => self.terminate(event),
                        Some(Ok(event)) => {
                            self.phase = Phase::Streaming(inner);
                            return Some(event);
                        }
                        Some(Err(err)) => self.terminate_with_error(err),
                        None => {
                            warn!(provider = self.name, "provider stream ended without a terminal event");
                            self.terminate(ProviderEvent::failed(
                                ErrorCode::ProviderProtocolError,
                                format!("provider {} closed the stream before finishing", self.name),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn terminate(&mut self, terminal: ProviderEvent) {
        if let Some(usage) = self.usage.take() {
            self.pending.push_back(ProviderEvent::Usage(usage));
        }
        self.pending.push_back(terminal);
        self.phase = Phase::Done;
    }

    fn terminate_with_error(&mut self, err: LLMError) {
        match &err {
            LLMError::Protocol { raw, .. } => {
                warn!(
                    provider = self.name,
                    error = %err,
                    raw = raw.as_deref().unwrap_or(""),
                    "provider sent an unexpected payload"
                );
            }
            _ => warn!(provider = self.name, error = %err, "provider request failed"),
        }
        self.terminate(ProviderEvent::failed(err.code(), err.public_message()));
    }
}

async fn open(provider: DynProvider, request: ProviderRequest) -> Result<ChatStream, LLMError> {
    if provider.capabilities().supports_stream {
        provider.stream_chat(request).await
    } else {
        let response = provider.chat(request).await?;
        let events = response.into_events().into_iter().map(Ok);
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Parses a provider JSON payload, keeping the raw text for protocol errors.
pub(crate) fn parse_payload<T: DeserializeOwned>(
    provider: &'static str,
    text: &str,
) -> Result<T, LLMError> {
    serde_json::from_str(text).map_err(|err| {
        LLMError::protocol(
            provider,
            format!("failed to parse response: {err}"),
            Some(text.to_string()),
        )
    })
}

const LOGGED_BODY_LIMIT: usize = 2048;

/// Error for a non-2xx response whose body is not the provider's error JSON.
///
/// The body only reaches the logs; the returned message carries the status alone.
pub(crate) fn unrecognized_error_body(
    provider: &'static str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> LLMError {
    let body = body.trim();
    let logged = match body.char_indices().nth(LOGGED_BODY_LIMIT) {
        Some((cut, _)) => &body[..cut],
        None => body,
    };
    warn!(provider, status, body = logged, "provider returned an unrecognized error body");

    let message = format!("upstream responded with status {status}");
    match status {
        401 | 403 => LLMError::Auth { message },
        429 => LLMError::RateLimit {
            message,
            retry_after,
        },
        _ => LLMError::provider(provider, message),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::types::{ChatTurn, FinishReason, SamplingParams};

    struct ScriptedProvider {
        events: Vec<Result<ProviderEvent, LLMError>>,
        streaming: bool,
        chat_called: AtomicBool,
    }

    impl ScriptedProvider {
        fn streaming(events: Vec<Result<ProviderEvent, LLMError>>) -> Self {
            Self {
                events,
                streaming: true,
                chat_called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn chat(&self, _request: ProviderRequest) -> Result<ChatResponse, LLMError> {
            self.chat_called.store(true, Ordering::SeqCst);
            Ok(ChatResponse {
                text: "batch answer".to_string(),
                usage: Some(TokenUsage::new(5, 2)),
                ..ChatResponse::default()
            })
        }

        async fn stream_chat(&self, _request: ProviderRequest) -> Result<ChatStream, LLMError> {
            let events: Vec<_> = self
                .events
                .iter()
                .map(|event| match event {
                    Ok(event) => Ok(event.clone()),
                    Err(err) => Err(LLMError::transport(err.to_string())),
                })
                .collect();
            Ok(Box::pin(stream::iter(events)))
        }

        fn capabilities(&self) -> CapabilityDescriptor {
            CapabilityDescriptor {
                supports_stream: self.streaming,
                ..CapabilityDescriptor::default()
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "test-model".to_string(),
            system: None,
            messages: vec![ChatTurn::user("hi")],
            sampling: SamplingParams::default(),
        }
    }

    async fn collect(provider: ScriptedProvider) -> Vec<ProviderEvent> {
        stream_events(Arc::new(provider), request(), CancellationToken::new())
            .collect()
            .await
    }

    #[tokio::test]
    async fn usage_is_merged_and_placed_before_terminal() {
        let events = collect(ScriptedProvider::streaming(vec![
            Ok(ProviderEvent::Usage(TokenUsage {
                prompt_tokens: Some(10),
                completion_tokens: None,
            })),
            Ok(ProviderEvent::TextDelta("a".into())),
            Ok(ProviderEvent::Usage(TokenUsage {
                prompt_tokens: None,
                completion_tokens: Some(3),
            })),
            Ok(ProviderEvent::Finished(FinishReason::Stop)),
            Ok(ProviderEvent::TextDelta("ignored".into())),
        ]))
        .await;

        assert_eq!(
            events,
            vec![
                ProviderEvent::TextDelta("a".into()),
                ProviderEvent::Usage(TokenUsage::new(10, 3)),
                ProviderEvent::Finished(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn errors_become_failed_events() {
        let events = collect(ScriptedProvider::streaming(vec![
            Ok(ProviderEvent::TextDelta("partial".into())),
            Err(LLMError::transport("connection reset")),
        ]))
        .await;

        assert_eq!(events.len(), 2);
        match &events[1] {
            ProviderEvent::Failed { code, message } => {
                assert_eq!(*code, ErrorCode::ProviderTransportError);
                assert!(message.contains("connection reset"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_terminal_is_reported_as_protocol_error() {
        let events = collect(ScriptedProvider::streaming(vec![Ok(
            ProviderEvent::TextDelta("cut".into()),
        )]))
        .await;
        assert!(matches!(
            events.last(),
            Some(ProviderEvent::Failed {
                code: ErrorCode::ProviderProtocolError,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn batch_only_provider_degrades_to_single_delta() {
        let provider = Arc::new(ScriptedProvider {
            events: Vec::new(),
            streaming: false,
            chat_called: AtomicBool::new(false),
        });
        let events: Vec<_> =
            stream_events(provider.clone(), request(), CancellationToken::new())
                .collect()
                .await;
        assert!(provider.chat_called.load(Ordering::SeqCst));
        assert_eq!(
            events,
            vec![
                ProviderEvent::TextDelta("batch answer".into()),
                ProviderEvent::Usage(TokenUsage::new(5, 2)),
                ProviderEvent::Finished(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_a_blocked_stream() {
        struct Blocking;

        #[async_trait]
        impl LLMProvider for Blocking {
            async fn chat(&self, _request: ProviderRequest) -> Result<ChatResponse, LLMError> {
                Err(LLMError::UnsupportedFeature { feature: "chat" })
            }

            async fn stream_chat(&self, _request: ProviderRequest) -> Result<ChatStream, LLMError> {
                let first = stream::iter(vec![Ok(ProviderEvent::TextDelta("A".into()))]);
                Ok(Box::pin(first.chain(stream::pending())))
            }

            fn capabilities(&self) -> CapabilityDescriptor {
                CapabilityDescriptor {
                    supports_stream: true,
                    ..CapabilityDescriptor::default()
                }
            }

            fn name(&self) -> &'static str {
                "blocking"
            }
        }

        let cancel = CancellationToken::new();
        let mut events = stream_events(Arc::new(Blocking), request(), cancel.clone());
        assert_eq!(events.next().await, Some(ProviderEvent::TextDelta("A".into())));
        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("cancellation must not hang");
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn non_json_error_pages_are_not_forwarded() {
        let transport = Arc::new(test_support::ScriptedTransport::new(
            502,
            "<html><body>502 Bad Gateway nginx internal-host-10.0.0.7</body></html>",
        ));
        let provider = Arc::new(openai_chat::OpenAiChatProvider::new(transport, "sk-test"));
        let events: Vec<_> = stream_events(provider, request(), CancellationToken::new())
            .collect()
            .await;

        match events.as_slice() {
            [ProviderEvent::Failed { code, message }] => {
                assert_eq!(*code, ErrorCode::ProviderTransportError);
                assert!(message.contains("502"), "{message}");
                assert!(!message.contains("internal-host"), "{message}");
                assert!(!message.contains("<html>"), "{message}");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }
}
