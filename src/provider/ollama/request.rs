use serde_json::{Map, Value, json};

use crate::types::{ChatTurn, ProviderRequest};

pub(crate) fn build_ollama_body(request: &ProviderRequest, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.extend(request.messages.iter().map(convert_turn));

    let mut options = Map::new();
    if let Some(temperature) = request.sampling.temperature {
        options.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.sampling.top_p {
        options.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(top_k) = request.sampling.top_k {
        options.insert("top_k".to_string(), Value::from(top_k));
    }
    if let Some(max_tokens) = request.sampling.max_tokens {
        options.insert("num_predict".to_string(), Value::from(max_tokens));
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(request.model.clone()));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("stream".to_string(), Value::Bool(stream));
    if !options.is_empty() {
        body.insert("options".to_string(), Value::Object(options));
    }
    Value::Object(body)
}

fn convert_turn(turn: &ChatTurn) -> Value {
    let images: Vec<String> = turn
        .attachments
        .iter()
        .filter(|a| a.is_image())
        .map(|a| a.base64())
        .collect();
    let mut message = json!({ "role": turn.role.as_str(), "content": turn.content });
    if !images.is_empty() {
        message["images"] = json!(images);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attachment, SamplingParams};

    #[test]
    fn images_are_raw_base64_and_options_are_nested() {
        let mut turn = ChatTurn::user("what is it");
        turn.attachments
            .push(Attachment::new("a.png", "image/png", b"png".to_vec()));
        let request = ProviderRequest {
            model: "llava".to_string(),
            system: None,
            messages: vec![turn],
            sampling: SamplingParams {
                max_tokens: Some(100),
                ..Default::default()
            },
        };
        let body = build_ollama_body(&request, false);
        assert_eq!(body["messages"][0]["images"], json!(["cG5n"]));
        assert_eq!(body["options"], json!({ "num_predict": 100 }));
        assert_eq!(body["stream"], json!(false));
    }
}
