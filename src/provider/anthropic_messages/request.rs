use serde_json::{Map, Value, json};

use crate::types::{ChatTurn, ProviderRequest};

/// Anthropic requires an explicit output budget.
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) fn build_anthropic_body(request: &ProviderRequest, stream: bool) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(request.model.clone()));
    if let Some(system) = &request.system {
        body.insert("system".to_string(), Value::String(system.clone()));
    }
    body.insert(
        "messages".to_string(),
        Value::Array(request.messages.iter().map(convert_turn).collect()),
    );
    body.insert(
        "max_tokens".to_string(),
        Value::from(request.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if let Some(temperature) = request.sampling.temperature {
        // Anthropic caps temperature at 1.0.
        body.insert("temperature".to_string(), Value::from(temperature.min(1.0)));
    }
    if let Some(top_p) = request.sampling.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(top_k) = request.sampling.top_k {
        body.insert("top_k".to_string(), Value::from(top_k));
    }
    body.insert("stream".to_string(), Value::Bool(stream));
    Value::Object(body)
}

fn convert_turn(turn: &ChatTurn) -> Value {
    let mut blocks = Vec::new();
    for image in turn.attachments.iter().filter(|a| a.is_image()) {
        blocks.push(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.base64(),
            },
        }));
    }
    if !turn.content.is_empty() || blocks.is_empty() {
        blocks.push(json!({ "type": "text", "text": turn.content }));
    }
    json!({ "role": turn.role.as_str(), "content": blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attachment, SamplingParams};

    #[test]
    fn builds_blocks_with_system_and_default_budget() {
        let mut turn = ChatTurn::user("describe");
        turn.attachments
            .push(Attachment::new("a.jpg", "image/jpeg", vec![0xff, 0xd8]));
        let request = ProviderRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: Some("You are terse.".to_string()),
            messages: vec![turn],
            sampling: SamplingParams {
                temperature: Some(1.6),
                top_k: Some(40),
                ..Default::default()
            },
        };

        let body = build_anthropic_body(&request, true);
        assert_eq!(body["system"], json!("You are terse."));
        assert_eq!(body["max_tokens"], json!(4096));
        assert_eq!(body["temperature"], json!(1.0));
        assert_eq!(body["top_k"], json!(40));
        let blocks = &body["messages"][0]["content"];
        assert_eq!(blocks[0]["source"]["media_type"], json!("image/jpeg"));
        assert_eq!(blocks[1], json!({"type": "text", "text": "describe"}));
    }
}
