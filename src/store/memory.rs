//! In-process stores backed by `tokio::sync::RwLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ConversationStore, CredentialStore, PromptLibrary, UsageStore};
use crate::config::{Credential, ProviderKind};
use crate::error::StoreError;
use crate::types::{Conversation, StoredMessage, UsageMetric};

/// Fails the next `n` writes; lets tests exercise the retry path.
#[derive(Debug, Default)]
struct FaultInjector {
    remaining: AtomicUsize,
}

impl FaultInjector {
    fn arm(&self, writes: usize) {
        self.remaining.store(writes, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<(), StoreError> {
        let tripped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::unavailable(format!("injected failure writing {what}")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    messages: RwLock<HashMap<Uuid, Vec<StoredMessage>>>,
    faults: FaultInjector,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `writes` calls to [`ConversationStore::append_turn`] fail.
    pub fn fail_next_writes(&self, writes: usize) {
        self.faults.arm(writes);
    }

    /// Every stored turn of every conversation.
    pub async fn all_messages(&self) -> Vec<StoredMessage> {
        self.messages
            .read()
            .await
            .values()
            .flat_map(|turns| turns.iter().cloned())
            .collect()
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation);
        Ok(())
    }

    async fn history(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_turn(&self, message: StoredMessage) -> Result<(), StoreError> {
        self.faults.check("message")?;
        let mut messages = self.messages.write().await;
        let turns = messages.entry(message.conversation_id).or_default();
        match turns.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => *existing = message,
            None => turns.push(message),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    metrics: RwLock<Vec<UsageMetric>>,
    faults: FaultInjector,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_writes(&self, writes: usize) {
        self.faults.arm(writes);
    }

    pub async fn metrics(&self) -> Vec<UsageMetric> {
        self.metrics.read().await.clone()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn record(&self, metric: UsageMetric) -> Result<(), StoreError> {
        self.faults.check("usage metric")?;
        let mut metrics = self.metrics.write().await;
        match metrics.iter_mut().find(|existing| existing.id == metric.id) {
            Some(existing) => *existing = metric,
            None => metrics.push(metric),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<(String, ProviderKind), Credential>>,
    lookups: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, user_id: impl Into<String>, provider: ProviderKind, credential: Credential) {
        self.credentials
            .write()
            .await
            .insert((user_id.into(), provider), credential);
    }

    pub async fn remove(&self, user_id: &str, provider: ProviderKind) {
        self.credentials
            .write()
            .await
            .remove(&(user_id.to_string(), provider));
    }

    /// Number of [`CredentialStore::get`] calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<Credential>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .credentials
            .read()
            .await
            .get(&(user_id.to_string(), provider))
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPromptLibrary {
    personas: RwLock<HashMap<String, String>>,
    templates: RwLock<HashMap<String, String>>,
}

impl MemoryPromptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_persona(&self, id: impl Into<String>, system_prompt: impl Into<String>) {
        self.personas
            .write()
            .await
            .insert(id.into(), system_prompt.into());
    }

    pub async fn add_template(&self, id: impl Into<String>, template: impl Into<String>) {
        self.templates
            .write()
            .await
            .insert(id.into(), template.into());
    }
}

#[async_trait]
impl PromptLibrary for MemoryPromptLibrary {
    async fn persona_prompt(&self, persona_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.personas.read().await.get(persona_id).cloned())
    }

    async fn prompt_template(&self, prompt_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.templates.read().await.get(prompt_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_turn_upserts_by_id() {
        let store = MemoryConversationStore::new();
        let conversation_id = Uuid::new_v4();
        let mut turn = StoredMessage::user_turn(conversation_id, "first".into(), &[]);
        store.append_turn(turn.clone()).await.expect("insert");
        turn.content = "edited".into();
        store.append_turn(turn).await.expect("upsert");

        let history = store.history(conversation_id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "edited");
    }

    #[tokio::test]
    async fn injected_faults_fail_exactly_n_writes() {
        let store = MemoryConversationStore::new();
        store.fail_next_writes(1);
        let turn = StoredMessage::user_turn(Uuid::new_v4(), "x".into(), &[]);
        assert!(store.append_turn(turn.clone()).await.is_err());
        assert!(store.append_turn(turn).await.is_ok());
    }

    #[tokio::test]
    async fn credentials_are_scoped_per_user_and_provider() {
        let store = MemoryCredentialStore::new();
        store
            .set(
                "alice",
                ProviderKind::OpenAi,
                Credential::ApiKey {
                    key: "sk-a".into(),
                    base_url: None,
                },
            )
            .await;
        assert!(store.get("alice", ProviderKind::OpenAi).await.expect("get").is_some());
        assert!(store.get("alice", ProviderKind::Gemini).await.expect("get").is_none());
        assert!(store.get("bob", ProviderKind::OpenAi).await.expect("get").is_none());
        assert_eq!(store.lookups(), 3);
    }
}
