#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use kotoba_chat::config::ChatConfig;
use kotoba_chat::http::reqwest::default_dyn_transport;
use kotoba_chat::provider::{ChatStream, LLMProvider};
use kotoba_chat::store::memory::{
    MemoryConversationStore, MemoryCredentialStore, MemoryPromptLibrary, MemoryUsageStore,
};
use kotoba_chat::store::{ModelRates, RateTablePricing};
use kotoba_chat::{
    CapabilityDescriptor, ChatResponse, Collaborators, LLMError, Orchestrator, ProviderEvent,
    ProviderRegistry, ProviderRequest,
};

pub const MOCK: &str = "mock";
pub const MOCK_MODEL: &str = "mock-1";

/// One step of a scripted provider stream.
#[derive(Debug, Clone)]
pub enum Step {
    Event(ProviderEvent),
    Error(String),
    Sleep(Duration),
    /// Never yields again.
    Hang,
}

/// Provider that replays the same script for every request.
pub struct ScriptedProvider {
    steps: Vec<Step>,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn seen_requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn chat(&self, _request: ProviderRequest) -> Result<ChatResponse, LLMError> {
        Err(LLMError::UnsupportedFeature { feature: "chat" })
    }

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChatStream, LLMError> {
        self.requests.lock().expect("requests lock").push(request);
        let steps = self.steps.clone();
        let events = stream::iter(steps).filter_map(|step| async move {
            match step {
                Step::Event(event) => Some(Ok(event)),
                Step::Error(message) => Some(Err(LLMError::transport(message))),
                Step::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    None
                }
                Step::Hang => {
                    futures_util::future::pending::<()>().await;
                    None
                }
            }
        });
        Ok(Box::pin(events))
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_stream: true,
            ..CapabilityDescriptor::default()
        }
    }

    fn name(&self) -> &'static str {
        MOCK
    }
}

pub fn text(delta: &str) -> Step {
    Step::Event(ProviderEvent::TextDelta(delta.to_string()))
}

/// Everything a test needs to drive and inspect the pipeline.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub conversations: Arc<MemoryConversationStore>,
    pub usage: Arc<MemoryUsageStore>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub prompts: Arc<MemoryPromptLibrary>,
}

impl Harness {
    pub fn new(provider: Arc<ScriptedProvider>) -> Self {
        Self::with_config(provider, ChatConfig::default())
    }

    pub fn with_config(provider: Arc<ScriptedProvider>, config: ChatConfig) -> Self {
        let conversations = Arc::new(MemoryConversationStore::new());
        let usage = Arc::new(MemoryUsageStore::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let prompts = Arc::new(MemoryPromptLibrary::new());
        let pricing = RateTablePricing::new().with_model(MOCK, MOCK_MODEL, ModelRates::new(1.0, 2.0));

        let registry = ProviderRegistry::builder(
            credentials.clone(),
            default_dyn_transport().expect("transport"),
        )
        .config(config.clone())
        .register_provider(MOCK, provider)
        .build();

        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            Collaborators {
                conversations: conversations.clone(),
                usage: usage.clone(),
                prompts: prompts.clone(),
                pricing: Arc::new(pricing),
            },
            config,
        );

        Self {
            orchestrator,
            conversations,
            usage,
            credentials,
            prompts,
        }
    }
}
