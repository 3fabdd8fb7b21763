//! Collaborators the pipeline reads from and persists to.
//!
//! Real deployments back these with a database; [`memory`] holds the
//! in-process versions used by tests and single-node embeddings.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{Credential, ProviderKind};
use crate::error::StoreError;
use crate::types::{Conversation, StoredMessage, UsageMetric};

pub mod memory;
mod pricing;

pub use pricing::{ModelRates, RateTablePricing};

/// Conversation headers and their ordered turns.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Turns in creation order.
    async fn history(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>, StoreError>;

    /// Inserts or replaces the turn with the same id.
    async fn append_turn(&self, message: StoredMessage) -> Result<(), StoreError>;
}

/// Sink for per-request usage records.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Idempotent on `metric.id`.
    async fn record(&self, metric: UsageMetric) -> Result<(), StoreError>;
}

/// Per-user provider credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<Credential>, StoreError>;
}

/// Authored personas and prompt templates.
#[async_trait]
pub trait PromptLibrary: Send + Sync {
    async fn persona_prompt(&self, persona_id: &str) -> Result<Option<String>, StoreError>;

    /// Template text with `{{variable}}` placeholders.
    async fn prompt_template(&self, prompt_id: &str) -> Result<Option<String>, StoreError>;
}

/// Price lookup in USD.
pub trait Pricing: Send + Sync {
    fn cost(&self, provider: &str, model: &str, prompt_tokens: u64, completion_tokens: u64)
    -> f64;
}

pub type DynConversationStore = Arc<dyn ConversationStore>;
pub type DynUsageStore = Arc<dyn UsageStore>;
pub type DynCredentialStore = Arc<dyn CredentialStore>;
pub type DynPromptLibrary = Arc<dyn PromptLibrary>;
pub type DynPricing = Arc<dyn Pricing>;
