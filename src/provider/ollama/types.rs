use serde::Deserialize;

/// One NDJSON line, or the whole body when `stream` is false.
#[derive(Debug, Deserialize, Clone, Default)]
pub(crate) struct OllamaChatChunk {
    #[serde(default)]
    pub(crate) model: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<OllamaMessage>,
    #[serde(default)]
    pub(crate) done: bool,
    #[serde(default)]
    pub(crate) done_reason: Option<String>,
    #[serde(default)]
    pub(crate) prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub(crate) eval_count: Option<u64>,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub(crate) struct OllamaMessage {
    #[serde(default)]
    pub(crate) content: String,
    /// Base64 images returned by multimodal generators.
    #[serde(default)]
    pub(crate) images: Option<Vec<String>>,
}
