use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Attachment, FinishReason, ImageData, Role, TokenUsage};

/// Appended to the content of an assistant turn the client abandoned.
pub const CANCELLATION_MARKER: &str = "\n\n[generation cancelled]";

/// Conversation header owned by the conversation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Attachment metadata kept with a stored user turn; the bytes live in file storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub name: String,
    pub mime_type: String,
    pub size: usize,
}

impl From<&Attachment> for AttachmentRef {
    fn from(attachment: &Attachment) -> Self {
        Self {
            name: attachment.name.clone(),
            mime_type: attachment.mime_type.clone(),
            size: attachment.data.len(),
        }
    }
}

/// Persisted message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub images: Vec<ImageData>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub is_error: bool,
    pub is_liked: bool,
    pub is_hidden: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// The user's turn, persisted before the provider is contacted.
    pub fn user_turn(conversation_id: Uuid, content: String, attachments: &[Attachment]) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: Role::user(),
            content,
            images: Vec::new(),
            attachments: attachments.iter().map(AttachmentRef::from).collect(),
            provider: None,
            model: None,
            finish_reason: None,
            prompt_tokens: None,
            completion_tokens: None,
            is_error: false,
            is_liked: false,
            is_hidden: false,
            created_at: now,
            finished_at: Some(now),
        }
    }

    pub fn token_count(&self) -> u64 {
        self.prompt_tokens.unwrap_or(0) + self.completion_tokens.unwrap_or(0)
    }
}

/// Assistant turn under construction.
///
/// Owned by a single request. Each `into_*` method consumes the accumulator, so
/// a request can only ever produce one persisted assistant turn.
#[derive(Debug)]
pub struct AssembledMessage {
    id: Uuid,
    conversation_id: Uuid,
    provider: String,
    model: String,
    content: String,
    images: Vec<ImageData>,
    usage: Option<TokenUsage>,
    liked: bool,
    hidden: bool,
    created_at: DateTime<Utc>,
}

impl AssembledMessage {
    pub fn new(conversation_id: Uuid, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            provider: provider.into(),
            model: model.into(),
            content: String::new(),
            images: Vec::new(),
            usage: None,
            liked: false,
            hidden: false,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    pub fn push_text(&mut self, text: &str) {
        self.content.push_str(text);
    }

    pub fn push_image(&mut self, image: ImageData) {
        self.images.push(image);
    }

    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.usage = Some(match self.usage {
            Some(existing) => existing.merge(usage),
            None => usage,
        });
    }

    pub fn into_completed(self, reason: FinishReason) -> StoredMessage {
        self.finish(Some(reason), false, None)
    }

    /// Keeps whatever partial content was produced and flags the row as errored.
    pub fn into_failed(self) -> StoredMessage {
        self.finish(Some(FinishReason::Error), true, None)
    }

    pub fn into_cancelled(self) -> StoredMessage {
        self.finish(Some(FinishReason::Cancelled), false, Some(CANCELLATION_MARKER))
    }

    fn finish(
        self,
        finish_reason: Option<FinishReason>,
        is_error: bool,
        suffix: Option<&str>,
    ) -> StoredMessage {
        let mut content = self.content;
        if let Some(suffix) = suffix {
            content.push_str(suffix);
        }
        StoredMessage {
            id: self.id,
            conversation_id: self.conversation_id,
            role: Role::assistant(),
            content,
            images: self.images,
            attachments: Vec::new(),
            provider: Some(self.provider),
            model: Some(self.model),
            finish_reason,
            prompt_tokens: self.usage.and_then(|u| u.prompt_tokens),
            completion_tokens: self.usage.and_then(|u| u.completion_tokens),
            is_error,
            is_liked: self.liked,
            is_hidden: self.hidden,
            created_at: self.created_at,
            finished_at: Some(Utc::now()),
        }
    }
}

/// How the metered request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Usage record written once per request that reached a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetric {
    pub id: Uuid,
    pub user_id: String,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub duration_ms: u64,
    pub outcome: MetricOutcome,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_turn_keeps_partial_text_and_marker() {
        let mut message = AssembledMessage::new(Uuid::new_v4(), "openai", "gpt");
        message.push_text("Hel");
        message.push_text("lo");
        let stored = message.into_cancelled();
        assert_eq!(stored.content, format!("Hello{CANCELLATION_MARKER}"));
        assert_eq!(stored.finish_reason, Some(FinishReason::Cancelled));
        assert!(!stored.is_error);
    }

    #[test]
    fn failed_turn_is_flagged_with_usage() {
        let mut message = AssembledMessage::new(Uuid::new_v4(), "anthropic", "claude");
        message.push_text("partial");
        message.record_usage(TokenUsage {
            prompt_tokens: Some(9),
            completion_tokens: None,
        });
        message.record_usage(TokenUsage {
            prompt_tokens: None,
            completion_tokens: Some(4),
        });
        let stored = message.into_failed();
        assert!(stored.is_error);
        assert_eq!(stored.content, "partial");
        assert_eq!(stored.token_count(), 13);
        assert_eq!(stored.role, Role::assistant());
    }

    #[test]
    fn user_turn_keeps_attachment_metadata_only() {
        let attachment = Attachment::new("notes.txt", "text/plain", b"abc".to_vec());
        let stored = StoredMessage::user_turn(Uuid::new_v4(), "see file".into(), &[attachment]);
        assert_eq!(stored.attachments.len(), 1);
        assert_eq!(stored.attachments[0].size, 3);
        assert_eq!(stored.role, Role::user());
    }
}
