use serde_json::{Map, Value, json};

use crate::types::{ChatTurn, ProviderRequest};

pub(crate) fn build_openai_body(request: &ProviderRequest, stream: bool) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(request.model.clone()));
    body.insert("messages".to_string(), Value::Array(convert_messages(request)));
    if let Some(temperature) = request.sampling.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.sampling.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = request.sampling.max_tokens {
        body.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    body.insert("stream".to_string(), Value::Bool(stream));
    if stream {
        body.insert(
            "stream_options".to_string(),
            json!({ "include_usage": true }),
        );
    }
    Value::Object(body)
}

fn convert_messages(request: &ProviderRequest) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.extend(request.messages.iter().map(convert_turn));
    messages
}

fn convert_turn(turn: &ChatTurn) -> Value {
    let images: Vec<_> = turn.attachments.iter().filter(|a| a.is_image()).collect();
    if images.is_empty() {
        return json!({ "role": turn.role.as_str(), "content": turn.content });
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    if !turn.content.is_empty() {
        parts.push(json!({ "type": "text", "text": turn.content }));
    }
    for image in images {
        parts.push(json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", image.mime_type, image.base64()),
            },
        }));
    }
    json!({ "role": turn.role.as_str(), "content": parts })
}
