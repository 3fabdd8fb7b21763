//! 流式对话补全管线
//!
//! Accepts a chat turn, runs it against one of several LLM providers,
//! re-paces the output and streams it as Server-Sent Events, then persists
//! the assistant turn and its usage exactly once.

pub mod config;
pub mod encoder;
pub mod error;
pub mod http;
pub mod logging;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod registry;
#[cfg(feature = "server")]
pub mod server;
pub mod smoother;
pub mod store;
mod stream;
pub mod transport;
pub mod types;

pub use config::{ChatConfig, Credential, ProviderKind};
pub use error::{ChatError, ErrorCode, LLMError};
pub use orchestrator::{Collaborators, CompletionOutcome, CompletionReply, Orchestrator};
pub use provider::{ChatStream, DynProvider, LLMProvider};
pub use registry::ProviderRegistry;
pub use smoother::ChunkSmoother;
pub use types::*;
