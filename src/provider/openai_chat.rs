//! OpenAI Chat Completions adapter.
//!
//! Also serves any OpenAI-compatible host (vLLM, LM Studio, gateways) through
//! [`OpenAiChatProvider::with_base_url`].

mod error;
mod provider;
mod request;
mod response;
mod stream;
mod types;

pub use provider::OpenAiChatProvider;
pub(crate) use provider::DEFAULT_BASE_URL;
