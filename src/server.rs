//! HTTP surface: `POST /api/chat/completions`.
//!
//! Streaming requests answer with `text/event-stream`; the SSE body is fed by
//! a [`ChannelWriter`], so a client disconnect closes the channel and cancels
//! the request. Non-streaming requests answer with the `final_message` or
//! `error` payload as JSON.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::encoder::error_payload;
use crate::error::{ChatError, ErrorCode};
use crate::orchestrator::{CompletionReply, Orchestrator};
use crate::transport::ChannelWriter;
use crate::types::{Attachment, CompletionRequest, Pacing, PromptRef, SamplingParams};

/// Header carrying the authenticated user's id, set by the gateway in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";

const SSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/api/chat/completions", post(chat_completions))
        .with_state(AppState { orchestrator })
}

/// Serves [`router`] until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, orchestrator: Orchestrator) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "chat completion server listening");
    }
    axum::serve(listener, router(orchestrator)).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatCompletionBody {
    conversation_id: Option<Uuid>,
    #[serde(default)]
    message: String,
    provider: String,
    model: String,
    stream: Option<bool>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_tokens: Option<u32>,
    system_prompt: Option<String>,
    persona_id: Option<String>,
    prompt_id: Option<String>,
    #[serde(default)]
    prompt_variables: HashMap<String, String>,
    #[serde(default)]
    attachments: Vec<AttachmentBody>,
    chunk_size: Option<usize>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentBody {
    filename: String,
    content_type: String,
    /// Base64 file content.
    data: String,
}

impl ChatCompletionBody {
    fn into_request(self, user_id: &str, default_pacing: Pacing) -> Result<CompletionRequest, ChatError> {
        let mut builder = CompletionRequest::builder(user_id, self.provider, self.model, self.message)
            .stream(self.stream.unwrap_or(true))
            .sampling(SamplingParams {
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
                max_tokens: self.max_tokens,
            });

        if let Some(id) = self.conversation_id {
            builder = builder.conversation_id(id);
        }
        if let Some(prompt) = self.system_prompt {
            builder = builder.system_prompt(prompt);
        }
        if let Some(persona_id) = self.persona_id {
            builder = builder.persona_id(persona_id);
        }
        if let Some(id) = self.prompt_id {
            builder = builder.prompt(PromptRef {
                id,
                variables: self.prompt_variables,
            });
        }
        if self.chunk_size.is_some() || self.interval_ms.is_some() {
            builder = builder.pacing(Pacing::new(
                self.chunk_size.unwrap_or(default_pacing.chunk_size),
                self.interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_pacing.interval),
            ));
        }
        for attachment in self.attachments {
            let data = BASE64.decode(attachment.data.as_bytes()).map_err(|err| {
                ChatError::validation(format!(
                    "attachment {} is not valid base64: {err}",
                    attachment.filename
                ))
            })?;
            builder = builder.attachment(Attachment::new(
                attachment.filename,
                attachment.content_type,
                data,
            ));
        }
        builder.build()
    }
}

/// POST /api/chat/completions
async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Response {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let orchestrator = state.orchestrator;

    let request = match body.into_request(&user_id, orchestrator.config().pacing()) {
        Ok(request) => request,
        Err(err) => return chat_error_response(err),
    };

    if request.is_stream() {
        stream_completion(orchestrator, request).await
    } else {
        complete(orchestrator, request).await
    }
}

async fn stream_completion(orchestrator: Orchestrator, request: CompletionRequest) -> Response {
    let prepared = match orchestrator.prepare(request).await {
        Ok(prepared) => prepared,
        Err(err) => return chat_error_response(err),
    };

    let cancel = CancellationToken::new();
    let (mut writer, rx) = ChannelWriter::channel(SSE_CHANNEL_CAPACITY, cancel.clone());
    tokio::spawn(async move {
        prepared.execute(&mut writer, cancel).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.data().to_string()),
        )
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn complete(orchestrator: Orchestrator, request: CompletionRequest) -> Response {
    let cancel = CancellationToken::new();
    // dropping this handler (client gone) cancels the spawned run, which still finalizes
    let _guard = cancel.clone().drop_guard();
    let task = tokio::spawn(async move { orchestrator.complete(request, cancel).await });

    match task.await {
        Ok(Ok(CompletionReply::Message(body))) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Ok(CompletionReply::Error { code, body })) => {
            let status = match code {
                ErrorCode::ProviderNotConfigured => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(body)).into_response()
        }
        Ok(Ok(CompletionReply::Cancelled)) => (
            StatusCode::BAD_GATEWAY,
            Json(error_payload(ErrorCode::GenerationFailed, "request cancelled")),
        )
            .into_response(),
        Ok(Err(err)) => chat_error_response(err),
        Err(err) => {
            error!(error = %err, "completion task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_payload(ErrorCode::GenerationFailed, "internal error")),
            )
                .into_response()
        }
    }
}

fn chat_error_response(err: ChatError) -> Response {
    let (status, code, title) = match &err {
        ChatError::Validation { .. } => (StatusCode::BAD_REQUEST, "InvalidRequest", "Invalid request"),
        ChatError::UnknownProvider { .. } => {
            (StatusCode::BAD_REQUEST, "UnknownProvider", "Unknown provider")
        }
        ChatError::ProviderNotConfigured { .. } => (
            StatusCode::BAD_REQUEST,
            ErrorCode::ProviderNotConfigured.as_str(),
            ErrorCode::ProviderNotConfigured.title(),
        ),
        ChatError::ConversationNotFound { .. } => (
            StatusCode::NOT_FOUND,
            "ConversationNotFound",
            "Conversation not found",
        ),
        ChatError::Store(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "StorageUnavailable",
            "Storage unavailable",
        ),
    };
    if status.is_server_error() {
        warn!(error = %err, "rejecting completion request");
    }
    let body = json!({
        "errorCode": code,
        "title": title,
        "description": err.to_string(),
    });
    (status, Json(body)).into_response()
}
