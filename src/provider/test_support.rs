//! Scripted transport shared by the adapter unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::error::LLMError;
use crate::http::{HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};

/// Replies with a fixed status and body and remembers every request it saw.
pub(crate) struct ScriptedTransport {
    status: u16,
    body: String,
    headers: HashMap<String, String>,
    pub(crate) requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub(crate) fn last_request(&self) -> HttpRequest {
        self.requests
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .expect("a request was sent")
    }

    pub(crate) fn last_body(&self) -> serde_json::Value {
        let request = self.last_request();
        serde_json::from_slice(request.body.as_deref().expect("body")).expect("json body")
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        self.requests.lock().expect("lock").push(request);
        Ok(HttpResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone().into_bytes(),
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        self.requests.lock().expect("lock").push(request);
        // Split into small chunks so decoders see frames cut mid-line.
        let chunks: Vec<Result<Vec<u8>, LLMError>> = self
            .body
            .as_bytes()
            .chunks(7)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(HttpStreamResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: Box::pin(stream::iter(chunks)),
        })
    }
}
