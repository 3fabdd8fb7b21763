//! Runs one chat turn end to end and owns its finalization.
//!
//! A request goes through [`Orchestrator::prepare`], which performs every
//! check that can fail synchronously, and then [`PreparedCompletion::execute`],
//! which streams the answer to a [`TransportWriter`]. Whatever way the stream
//! ends, the assistant turn and its usage metric are persisted exactly once.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::encoder::{InternalEvent, encode, error_payload, final_message_payload};
use crate::error::{ChatError, ErrorCode, StoreError};
use crate::prompt::{build_provider_request, history_from_stored};
use crate::provider::{DynProvider, stream_events};
use crate::registry::ProviderRegistry;
use crate::smoother::ChunkSmoother;
use crate::store::{DynConversationStore, DynPricing, DynPromptLibrary, DynUsageStore};
use crate::transport::{BufferedWriter, TransportWriter};
use crate::types::{
    AssembledMessage, CompletionRequest, Conversation, FinishReason, MetricOutcome,
    ProviderEvent, ProviderRequest, StoredMessage, UsageMetric,
};

const TITLE_MAX_CHARS: usize = 50;

/// Stores and lookups the pipeline depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub conversations: DynConversationStore,
    pub usage: DynUsageStore,
    pub prompts: DynPromptLibrary,
    pub pricing: DynPricing,
}

/// Lifecycle of one request, logged at debug on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Created,
    ProviderResolved,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed(StoredMessage),
    /// The provider failed; `message` keeps the partial content with the error flag set.
    Failed {
        code: ErrorCode,
        message: StoredMessage,
    },
    /// The client went away; `message` ends with the cancellation marker.
    Cancelled(StoredMessage),
    /// The user has no credentials for the provider; nothing was persisted.
    NotConfigured,
}

impl CompletionOutcome {
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            CompletionOutcome::Failed { code, .. } => Some(*code),
            CompletionOutcome::NotConfigured => Some(ErrorCode::ProviderNotConfigured),
            CompletionOutcome::Completed(_) | CompletionOutcome::Cancelled(_) => None,
        }
    }

    pub fn message(&self) -> Option<&StoredMessage> {
        match self {
            CompletionOutcome::Completed(message)
            | CompletionOutcome::Failed { message, .. }
            | CompletionOutcome::Cancelled(message) => Some(message),
            CompletionOutcome::NotConfigured => None,
        }
    }
}

/// Result of a non-streaming request.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionReply {
    /// `final_message` payload.
    Message(Value),
    /// `error` payload.
    Error { code: ErrorCode, body: Value },
    Cancelled,
}

/// Entry point of the pipeline; cheap to clone and share across requests.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    stores: Collaborators,
    config: Arc<ChatConfig>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ProviderRegistry>, stores: Collaborators, config: ChatConfig) -> Self {
        Self {
            registry,
            stores,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Validates the request and resolves everything the stream needs.
    ///
    /// Nothing is written to the stores here. A provider the user has not
    /// configured is not an error at this stage: the returned completion
    /// reports it as an `error` event when executed.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] for oversized attachments or unknown
    /// personas and prompts, [`ChatError::ConversationNotFound`] when the
    /// conversation is missing or owned by another user,
    /// [`ChatError::UnknownProvider`] and [`ChatError::Store`] as returned by
    /// the collaborators.
    pub async fn prepare(&self, request: CompletionRequest) -> Result<PreparedCompletion, ChatError> {
        let request_id = Uuid::new_v4();
        debug!(%request_id, state = ?CompletionState::Created, "state transition");

        let max_bytes = self.config.max_attachment_bytes;
        if let Some(oversized) = request
            .attachments()
            .iter()
            .find(|attachment| attachment.data.len() > max_bytes)
        {
            return Err(ChatError::validation(format!(
                "attachment {} exceeds the {max_bytes} byte limit",
                oversized.name
            )));
        }

        let conversation = match request.conversation_id() {
            Some(id) => {
                let conversation = self.stores.conversations.get_conversation(id).await?;
                match conversation {
                    Some(conversation) if conversation.user_id == request.user_id() => {
                        Some(conversation)
                    }
                    _ => return Err(ChatError::ConversationNotFound { id }),
                }
            }
            None => None,
        };

        let target = match self
            .registry
            .resolve(request.provider(), request.user_id())
            .await
        {
            Ok(provider) => {
                let history = match (request.history(), &conversation) {
                    (Some(turns), _) => turns.to_vec(),
                    (None, Some(conversation)) => {
                        history_from_stored(&self.stores.conversations.history(conversation.id).await?)
                    }
                    (None, None) => Vec::new(),
                };
                let provider_request =
                    build_provider_request(&request, history, self.stores.prompts.as_ref()).await?;
                debug!(
                    %request_id,
                    provider = request.provider(),
                    state = ?CompletionState::ProviderResolved,
                    "state transition"
                );
                Target::Resolved {
                    provider,
                    request: provider_request,
                }
            }
            Err(ChatError::ProviderNotConfigured { provider }) => Target::NotConfigured { provider },
            Err(err) => return Err(err),
        };

        let smoother = request.is_stream().then(|| {
            ChunkSmoother::from_pacing(request.pacing().unwrap_or_else(|| self.config.pacing()))
        });

        Ok(PreparedCompletion {
            stores: self.stores.clone(),
            request_id,
            request,
            conversation,
            target,
            smoother,
        })
    }

    /// Prepares and streams in one call.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::prepare`]; once streaming starts every failure
    /// is reported through the writer.
    pub async fn stream<W>(
        &self,
        request: CompletionRequest,
        writer: &mut W,
        cancel: CancellationToken,
    ) -> Result<CompletionOutcome, ChatError>
    where
        W: TransportWriter + ?Sized,
    {
        Ok(self.prepare(request).await?.execute(writer, cancel).await)
    }

    /// Runs the pipeline without smoothing and returns the terminal payload.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::prepare`].
    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionReply, ChatError> {
        let prepared = self.prepare(request).await?.without_smoothing();
        let mut writer = BufferedWriter::new();
        let outcome = prepared.execute(&mut writer, cancel).await;

        let body = writer
            .terminal()
            .map(|event| event.data().clone())
            .unwrap_or(Value::Null);
        Ok(match outcome {
            CompletionOutcome::Completed(message) => {
                CompletionReply::Message(final_message_payload(&message))
            }
            CompletionOutcome::Cancelled(_) => CompletionReply::Cancelled,
            CompletionOutcome::Failed { code, .. } => CompletionReply::Error { code, body },
            CompletionOutcome::NotConfigured => CompletionReply::Error {
                code: ErrorCode::ProviderNotConfigured,
                body,
            },
        })
    }
}

enum Target {
    Resolved {
        provider: DynProvider,
        request: ProviderRequest,
    },
    NotConfigured {
        provider: String,
    },
}

enum Terminal {
    Finished(FinishReason),
    Failed { code: ErrorCode, message: String },
    Cancelled,
}

/// A validated request, ready to stream.
pub struct PreparedCompletion {
    stores: Collaborators,
    request_id: Uuid,
    request: CompletionRequest,
    conversation: Option<Conversation>,
    target: Target,
    smoother: Option<ChunkSmoother>,
}

impl PreparedCompletion {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Streams provider output as it arrives instead of re-pacing it.
    pub fn without_smoothing(mut self) -> Self {
        self.smoother = None;
        self
    }

    /// Streams the answer into `writer` and finalizes the turn.
    ///
    /// Returns once the terminal event was written, or right after
    /// finalization when `cancel` fired or the writer reported the client gone.
    pub async fn execute<W>(self, writer: &mut W, cancel: CancellationToken) -> CompletionOutcome
    where
        W: TransportWriter + ?Sized,
    {
        let span = info_span!(
            "completion",
            request_id = %self.request_id,
            user_id = %self.request.user_id(),
            provider = %self.request.provider(),
            model = %self.request.model(),
        );
        self.run(writer, cancel).instrument(span).await
    }

    async fn run<W>(self, writer: &mut W, cancel: CancellationToken) -> CompletionOutcome
    where
        W: TransportWriter + ?Sized,
    {
        let PreparedCompletion {
            stores,
            request,
            conversation,
            target,
            smoother,
            ..
        } = self;

        let (provider, provider_request) = match target {
            Target::Resolved { provider, request } => (provider, request),
            Target::NotConfigured { provider } => {
                info!("provider is not configured for this user");
                let message = format!(
                    "provider {provider} is not configured; add an API key for it in your settings"
                );
                emit(
                    writer,
                    &cancel,
                    InternalEvent::Failed {
                        code: ErrorCode::ProviderNotConfigured,
                        message,
                    },
                )
                .await;
                return CompletionOutcome::NotConfigured;
            }
        };

        let conversations = stores.conversations.as_ref();
        let conversation_id = match conversation {
            Some(existing) => existing.id,
            None => {
                let created = Conversation {
                    id: Uuid::new_v4(),
                    user_id: request.user_id().to_string(),
                    title: conversation_title(&request),
                    created_at: Utc::now(),
                };
                let id = created.id;
                persist_with_retry("conversation", move || {
                    conversations.create_conversation(created.clone())
                })
                .await;
                emit(writer, &cancel, InternalEvent::ConversationCreated(id)).await;
                id
            }
        };

        let user_turn = StoredMessage::user_turn(
            conversation_id,
            request.message().to_string(),
            request.attachments(),
        );
        persist_with_retry("user turn", move || conversations.append_turn(user_turn.clone())).await;

        info!(%conversation_id, "streaming completion");
        debug!(state = ?CompletionState::Streaming, "state transition");
        let started = Instant::now();
        let events = stream_events(provider, provider_request, cancel.clone());
        let mut events = match smoother {
            Some(smoother) => smoother.smooth_events(events, cancel.clone()),
            None => events,
        };

        let mut assembled =
            AssembledMessage::new(conversation_id, request.provider(), request.model());
        let terminal = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Terminal::Cancelled,
                next = events.next() => next,
            };
            match next {
                Some(ProviderEvent::TextDelta(text)) => {
                    assembled.push_text(&text);
                    emit(writer, &cancel, InternalEvent::Text(text)).await;
                }
                Some(ProviderEvent::ImageDelta(image)) => {
                    assembled.push_image(image.clone());
                    emit(writer, &cancel, InternalEvent::Image(image)).await;
                }
                Some(ProviderEvent::Usage(usage)) => assembled.record_usage(usage),
                Some(ProviderEvent::Finished(reason)) => break Terminal::Finished(reason),
                Some(ProviderEvent::Failed { code, message }) => {
                    break Terminal::Failed { code, message };
                }
                None if cancel.is_cancelled() => break Terminal::Cancelled,
                None => {
                    break Terminal::Failed {
                        code: ErrorCode::ProviderProtocolError,
                        message: "provider stream ended unexpectedly".to_string(),
                    };
                }
            }
        };
        drop(events);

        let usage = assembled.usage();
        let prompt_tokens = usage.map_or(0, |usage| usage.prompt());
        let completion_tokens = usage.map_or(0, |usage| usage.completion());
        let cost = stores
            .pricing
            .cost(request.provider(), request.model(), prompt_tokens, completion_tokens);

        let (outcome, state, metric_outcome, closing) = match terminal {
            Terminal::Finished(reason) => {
                let message = assembled.into_completed(reason);
                let closing = InternalEvent::Completed(message.clone());
                (
                    CompletionOutcome::Completed(message),
                    CompletionState::Completed,
                    MetricOutcome::Completed,
                    Some(closing),
                )
            }
            Terminal::Failed { code, message } => {
                warn!(%code, error = %message, "completion failed");
                let stored = assembled.into_failed();
                (
                    CompletionOutcome::Failed {
                        code,
                        message: stored,
                    },
                    CompletionState::Failed,
                    MetricOutcome::Failed,
                    Some(InternalEvent::Failed { code, message }),
                )
            }
            Terminal::Cancelled => (
                CompletionOutcome::Cancelled(assembled.into_cancelled()),
                CompletionState::Cancelled,
                MetricOutcome::Cancelled,
                None,
            ),
        };
        debug!(state = ?state, "state transition");

        let Some(stored) = outcome.message().cloned() else {
            return outcome;
        };
        let message_id = stored.id;
        persist_with_retry("assistant turn", move || conversations.append_turn(stored.clone())).await;

        let duration = started.elapsed();
        let metric = UsageMetric {
            id: Uuid::new_v4(),
            user_id: request.user_id().to_string(),
            conversation_id,
            message_id,
            provider: request.provider().to_string(),
            model: request.model().to_string(),
            prompt_tokens,
            completion_tokens,
            cost,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            outcome: metric_outcome,
            created_at: Utc::now(),
        };
        let usage_store = stores.usage.as_ref();
        persist_with_retry("usage metric", move || usage_store.record(metric.clone())).await;

        info!(
            outcome = ?metric_outcome,
            prompt_tokens,
            completion_tokens,
            cost,
            duration_ms = duration.as_millis() as u64,
            "completion finished"
        );

        if let Some(closing) = closing {
            if let Some(usage) = usage {
                emit(
                    writer,
                    &cancel,
                    InternalEvent::Usage {
                        provider: request.provider().to_string(),
                        model: request.model().to_string(),
                        usage,
                        cost,
                    },
                )
                .await;
            }
            emit(writer, &cancel, closing).await;
        }
        outcome
    }
}

/// Writes one event; a closed sink cancels the request instead of failing it.
async fn emit<W>(writer: &mut W, cancel: &CancellationToken, event: InternalEvent)
where
    W: TransportWriter + ?Sized,
{
    if cancel.is_cancelled() {
        return;
    }
    if writer.write(encode(event)).await.is_err() {
        debug!("client went away, cancelling request");
        cancel.cancel();
    }
}

/// Idempotent writes get exactly one retry; after that the failure is only logged.
async fn persist_with_retry<F, Fut>(record: &'static str, mut write: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let Err(err) = write().await else {
        return;
    };
    warn!(record, error = %err, "persisting failed, retrying once");
    if let Err(err) = write().await {
        error!(
            record,
            error = %err,
            code = "PersistenceFailure",
            "persisting failed twice, giving up"
        );
    }
}

fn conversation_title(request: &CompletionRequest) -> String {
    let first_line = request.message().lines().map(str::trim).find(|line| !line.is_empty());
    match first_line {
        Some(line) if line.chars().count() > TITLE_MAX_CHARS => {
            let truncated: String = line.chars().take(TITLE_MAX_CHARS).collect();
            format!("{}…", truncated.trim_end())
        }
        Some(line) => line.to_string(),
        None => request
            .attachments()
            .first()
            .map(|attachment| attachment.name.clone())
            .unwrap_or_else(|| "New chat".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attachment;

    #[test]
    fn titles_come_from_the_first_non_empty_line() {
        let request = CompletionRequest::builder("u", "openai", "gpt", "\n  Plan a trip to Kyoto\nin May")
            .build()
            .expect("request");
        assert_eq!(conversation_title(&request), "Plan a trip to Kyoto");

        let long = "x".repeat(80);
        let request = CompletionRequest::builder("u", "openai", "gpt", long)
            .build()
            .expect("request");
        assert_eq!(conversation_title(&request).chars().count(), TITLE_MAX_CHARS + 1);

        let request = CompletionRequest::builder("u", "openai", "gpt", "")
            .attachment(Attachment::new("photo.jpg", "image/jpeg", vec![1]))
            .build()
            .expect("request");
        assert_eq!(conversation_title(&request), "photo.jpg");
    }

    #[tokio::test]
    async fn persistence_is_retried_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = AtomicUsize::new(0);
        persist_with_retry("test", || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(StoreError::unavailable("first write fails"))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let attempts = AtomicUsize::new(0);
        persist_with_retry("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::unavailable("down")) }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
