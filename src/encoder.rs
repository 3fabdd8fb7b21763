use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::types::{ImageData, StoredMessage, TokenUsage};

pub const CONVERSATION_ID: &str = "conversation_id";
pub const CONTENT: &str = "content";
pub const IMAGE: &str = "image";
pub const METRICS: &str = "metrics";
pub const FINAL_MESSAGE: &str = "final_message";
pub const ERROR: &str = "error";

/// Pipeline-side events, before they are given a wire name.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    ConversationCreated(Uuid),
    Text(String),
    Image(ImageData),
    Usage {
        provider: String,
        model: String,
        usage: TokenUsage,
        cost: f64,
    },
    Completed(StoredMessage),
    Failed {
        code: ErrorCode,
        message: String,
    },
}

/// Named server-push event with a JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    name: &'static str,
    data: Value,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    /// `final_message` and `error` close the stream.
    pub fn is_terminal(&self) -> bool {
        self.name == FINAL_MESSAGE || self.name == ERROR
    }

    /// Renders one Server-Sent Events frame.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba_chat::encoder::{InternalEvent, encode};
    ///
    /// let frame = encode(InternalEvent::Text("Hi\nthere".into())).to_sse_frame();
    /// assert_eq!(frame, "event: content\ndata: \"Hi\\nthere\"\n\n");
    /// ```
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name, self.data)
    }
}

/// Maps an internal event to its wire name and payload.
pub fn encode(event: InternalEvent) -> OutboundEvent {
    match event {
        InternalEvent::ConversationCreated(id) => OutboundEvent {
            name: CONVERSATION_ID,
            data: Value::String(id.to_string()),
        },
        InternalEvent::Text(text) => OutboundEvent {
            name: CONTENT,
            data: Value::String(text),
        },
        InternalEvent::Image(image) => OutboundEvent {
            name: IMAGE,
            data: json!(image),
        },
        InternalEvent::Usage {
            provider,
            model,
            usage,
            cost,
        } => OutboundEvent {
            name: METRICS,
            data: json!({
                "provider": provider,
                "model": model,
                "promptTokens": usage.prompt(),
                "completionTokens": usage.completion(),
                "cost": cost,
            }),
        },
        InternalEvent::Completed(message) => OutboundEvent {
            name: FINAL_MESSAGE,
            data: final_message_payload(&message),
        },
        InternalEvent::Failed { code, message } => OutboundEvent {
            name: ERROR,
            data: error_payload(code, &message),
        },
    }
}

/// Body of the `final_message` event, also returned by non-streaming requests.
pub fn final_message_payload(message: &StoredMessage) -> Value {
    json!({
        "id": message.id,
        "conversationId": message.conversation_id,
        "role": message.role,
        "content": message.content,
        "model": message.model,
        "provider": message.provider,
        "finishReason": message.finish_reason,
        "images": message.images,
        "tokenCount": message.token_count(),
        "promptTokens": message.prompt_tokens,
        "completionTokens": message.completion_tokens,
        "createdAt": message.created_at,
    })
}

pub fn error_payload(code: ErrorCode, description: &str) -> Value {
    json!({
        "errorCode": code,
        "title": code.title(),
        "description": description,
    })
}
