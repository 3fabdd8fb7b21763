use serde_json::{Map, Value, json};

use crate::types::{ChatTurn, ProviderRequest};

pub(crate) fn build_gemini_body(request: &ProviderRequest) -> Value {
    let mut body = Map::new();
    body.insert(
        "contents".to_string(),
        Value::Array(request.messages.iter().map(convert_turn).collect()),
    );
    if let Some(system) = &request.system {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system }] }),
        );
    }

    let mut generation = Map::new();
    if let Some(temperature) = request.sampling.temperature {
        generation.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.sampling.top_p {
        generation.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(top_k) = request.sampling.top_k {
        generation.insert("topK".to_string(), Value::from(top_k));
    }
    if let Some(max_tokens) = request.sampling.max_tokens {
        generation.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }
    Value::Object(body)
}

fn convert_turn(turn: &ChatTurn) -> Value {
    // Gemini names the assistant role "model".
    let role = if turn.role.as_str() == "assistant" {
        "model"
    } else {
        "user"
    };
    let mut parts = Vec::new();
    if !turn.content.is_empty() {
        parts.push(json!({ "text": turn.content }));
    }
    for image in turn.attachments.iter().filter(|a| a.is_image()) {
        parts.push(json!({
            "inlineData": { "mimeType": image.mime_type, "data": image.base64() },
        }));
    }
    if parts.is_empty() {
        parts.push(json!({ "text": "" }));
    }
    json!({ "role": role, "parts": parts })
}
