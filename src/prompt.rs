//! Turns a [`CompletionRequest`] plus stored context into a [`ProviderRequest`].

use std::collections::HashMap;

use tracing::debug;

use crate::error::ChatError;
use crate::store::PromptLibrary;
use crate::types::{ChatTurn, CompletionRequest, ProviderRequest, Role, StoredMessage};

/// Variable that receives the user's message when a template is applied.
pub const INPUT_VARIABLE: &str = "input";

/// Assembles the normalized request sent to the provider.
///
/// `history` holds the prior turns, either supplied by the caller or loaded
/// from the conversation store.
///
/// # Errors
///
/// [`ChatError::Validation`] when the persona or prompt template does not exist.
pub async fn build_provider_request(
    request: &CompletionRequest,
    history: Vec<ChatTurn>,
    library: &dyn PromptLibrary,
) -> Result<ProviderRequest, ChatError> {
    let system = resolve_system_prompt(request, library).await?;

    let mut message = request.message().to_string();
    if let Some(prompt) = request.prompt() {
        let template = library
            .prompt_template(&prompt.id)
            .await?
            .ok_or_else(|| ChatError::validation(format!("prompt {} not found", prompt.id)))?;
        message = apply_template(&template, &prompt.variables, &message);
    }

    let mut messages = history;
    messages.push(user_turn(message, request));

    Ok(ProviderRequest {
        model: request.model().to_string(),
        system,
        messages,
        sampling: *request.sampling(),
    })
}

/// Override first, then the persona's prompt.
async fn resolve_system_prompt(
    request: &CompletionRequest,
    library: &dyn PromptLibrary,
) -> Result<Option<String>, ChatError> {
    if let Some(system) = request.system_prompt().filter(|s| !s.trim().is_empty()) {
        return Ok(Some(system.to_string()));
    }
    match request.persona_id() {
        Some(persona_id) => library
            .persona_prompt(persona_id)
            .await?
            .map(Some)
            .ok_or_else(|| ChatError::validation(format!("persona {persona_id} not found"))),
        None => Ok(None),
    }
}

fn apply_template(template: &str, variables: &HashMap<String, String>, message: &str) -> String {
    let mut bindings = variables.clone();
    bindings
        .entry(INPUT_VARIABLE.to_string())
        .or_insert_with(|| message.to_string());
    let rendered = render_template(template, &bindings);

    if has_placeholder(template, INPUT_VARIABLE) || message.trim().is_empty() {
        rendered
    } else {
        format!("{rendered}\n\n{message}")
    }
}

/// Replaces `{{ name }}` placeholders; unknown names are left untouched.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use kotoba_chat::prompt::render_template;
///
/// let vars = HashMap::from([("lang".to_string(), "Rust".to_string())]);
/// assert_eq!(render_template("Explain {{ lang }} {{x}}", &vars), "Explain Rust {{x}}");
/// ```
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after_open[..end].trim();
        match variables.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    out
}

fn has_placeholder(template: &str, name: &str) -> bool {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            return false;
        };
        if after_open[..end].trim() == name {
            return true;
        }
        rest = &after_open[end + 2..];
    }
    false
}

/// Text attachments are inlined as fenced blocks; images travel as media.
fn user_turn(mut content: String, request: &CompletionRequest) -> ChatTurn {
    let mut media = Vec::new();
    for attachment in request.attachments() {
        if attachment.is_image() {
            media.push(attachment.clone());
        } else if attachment.is_text() {
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(&format!(
                "{}\n```\n{}\n```",
                attachment.name,
                attachment.text().trim_end()
            ));
        } else {
            debug!(
                name = %attachment.name,
                mime_type = %attachment.mime_type,
                "skipping attachment with unsupported type"
            );
        }
    }
    ChatTurn {
        role: Role::user(),
        content,
        attachments: media,
    }
}

/// Prior turns as the provider should see them.
///
/// Errored and hidden turns are left out. Stored turns keep only attachment
/// metadata, so they are replayed as text.
pub fn history_from_stored(messages: &[StoredMessage]) -> Vec<ChatTurn> {
    messages
        .iter()
        .filter(|message| !message.is_error && !message.is_hidden)
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| ChatTurn {
            role: message.role.clone(),
            content: message.content.clone(),
            attachments: Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::store::memory::MemoryPromptLibrary;
    use crate::types::{AssembledMessage, Attachment, FinishReason, PromptRef};

    #[test]
    fn render_keeps_unknown_and_unclosed_placeholders() {
        let vars = HashMap::from([("name".to_string(), "Ada".to_string())]);
        assert_eq!(render_template("Hi {{name}}!", &vars), "Hi Ada!");
        assert_eq!(render_template("{{other}} {{ name", &vars), "{{other}} {{ name");
    }

    #[tokio::test]
    async fn override_beats_persona() {
        let library = MemoryPromptLibrary::new();
        library.add_persona("pirate", "Talk like a pirate.").await;

        let request = CompletionRequest::builder("u", "openai", "gpt", "hi")
            .persona_id("pirate")
            .system_prompt("Be terse.")
            .build()
            .expect("request");
        let built = build_provider_request(&request, Vec::new(), &library)
            .await
            .expect("built");
        assert_eq!(built.system.as_deref(), Some("Be terse."));

        let request = CompletionRequest::builder("u", "openai", "gpt", "hi")
            .persona_id("pirate")
            .build()
            .expect("request");
        let built = build_provider_request(&request, Vec::new(), &library)
            .await
            .expect("built");
        assert_eq!(built.system.as_deref(), Some("Talk like a pirate."));
    }

    #[tokio::test]
    async fn missing_persona_is_a_validation_error() {
        let request = CompletionRequest::builder("u", "openai", "gpt", "hi")
            .persona_id("ghost")
            .build()
            .expect("request");
        let err = build_provider_request(&request, Vec::new(), &MemoryPromptLibrary::new())
            .await
            .expect_err("unknown persona");
        assert!(matches!(err, ChatError::Validation { .. }));
    }

    #[tokio::test]
    async fn template_binds_variables_and_input() {
        let library = MemoryPromptLibrary::new();
        library
            .add_template("translate", "Translate to {{lang}}: {{input}}")
            .await;
        library.add_template("review", "Review this {{lang}} code.").await;

        let vars = HashMap::from([("lang".to_string(), "French".to_string())]);
        let request = CompletionRequest::builder("u", "openai", "gpt", "good morning")
            .prompt(PromptRef {
                id: "translate".into(),
                variables: vars.clone(),
            })
            .build()
            .expect("request");
        let built = build_provider_request(&request, Vec::new(), &library)
            .await
            .expect("built");
        assert_eq!(built.messages[0].content, "Translate to French: good morning");

        let request = CompletionRequest::builder("u", "openai", "gpt", "fn main() {}")
            .prompt(PromptRef {
                id: "review".into(),
                variables: vars,
            })
            .build()
            .expect("request");
        let built = build_provider_request(&request, Vec::new(), &library)
            .await
            .expect("built");
        assert_eq!(built.messages[0].content, "Review this French code.\n\nfn main() {}");
    }

    #[tokio::test]
    async fn attachments_split_into_inline_text_and_media() {
        let request = CompletionRequest::builder("u", "gemini", "flash", "summarize")
            .attachment(Attachment::new("notes.md", "text/markdown", b"# Title\n".to_vec()))
            .attachment(Attachment::new("cat.png", "image/png", vec![0x89, 0x50]))
            .attachment(Attachment::new("blob.bin", "application/octet-stream", vec![0]))
            .build()
            .expect("request");
        let built = build_provider_request(
            &request,
            vec![ChatTurn::user("earlier"), ChatTurn::assistant("reply")],
            &MemoryPromptLibrary::new(),
        )
        .await
        .expect("built");

        assert_eq!(built.messages.len(), 3);
        let turn = &built.messages[2];
        assert_eq!(turn.content, "summarize\n\nnotes.md\n```\n# Title\n```");
        assert_eq!(turn.attachments.len(), 1);
        assert_eq!(turn.attachments[0].name, "cat.png");
    }

    #[test]
    fn stored_history_skips_errored_turns() {
        let conversation_id = Uuid::new_v4();
        let user = StoredMessage::user_turn(conversation_id, "question".into(), &[]);
        let mut failed = AssembledMessage::new(conversation_id, "openai", "gpt");
        failed.push_text("half an ans");
        let mut done = AssembledMessage::new(conversation_id, "openai", "gpt");
        done.push_text("answer");

        let turns = history_from_stored(&[
            user,
            failed.into_failed(),
            done.into_completed(FinishReason::Stop),
        ]);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, Role::assistant());
        assert_eq!(turns[1].content, "answer");
    }
}
