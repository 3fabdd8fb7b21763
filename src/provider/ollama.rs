//! Ollama `/api/chat` adapter for locally hosted models.

mod error;
mod provider;
mod request;
mod response;
mod stream;
mod types;

pub use provider::OllamaProvider;
pub(crate) use provider::DEFAULT_BASE_URL;
