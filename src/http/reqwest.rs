use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};

use crate::error::LLMError;

use super::{DynHttpTransport, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};

const USER_AGENT: &str = concat!("kotoba-chat/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`HttpTransport`] over a shared `reqwest::Client`.
///
/// The per-request timeout set by adapters covers the whole exchange, including
/// the streamed body; connecting is bounded separately by the client.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 使用调用方配置好的 Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 默认 Client 带 User-Agent 与连接超时
    pub fn default_client() -> Result<Self, LLMError> {
        Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map(Self::new)
            .map_err(|err| LLMError::transport(format!("failed to create http client: {err}")))
    }

    fn prepare(&self, request: HttpRequest) -> Result<RequestBuilder, LLMError> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(header_map(request.headers)?);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        Ok(builder)
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<(u16, HashMap<String, String>, Response), LLMError> {
        let response = self.prepare(request)?.send().await.map_err(upstream_error)?;
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok((response.status().as_u16(), headers, response))
    }
}

fn header_map(headers: HashMap<String, String>) -> Result<HeaderMap, LLMError> {
    headers
        .into_iter()
        .map(|(name, value)| -> Result<(HeaderName, HeaderValue), LLMError> {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| LLMError::transport(format!("invalid header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|err| LLMError::transport(format!("invalid value for header {name}: {err}")))?;
            Ok((name, value))
        })
        .collect()
}

fn upstream_error(err: reqwest::Error) -> LLMError {
    // upstream URLs stay out of client-facing messages
    let err = err.without_url();
    if err.is_timeout() {
        LLMError::transport(format!("upstream timed out: {err}"))
    } else if err.is_connect() {
        LLMError::transport(format!("could not connect to upstream: {err}"))
    } else {
        LLMError::transport(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        let (status, headers, response) = self.dispatch(request).await?;
        let body = response.bytes().await.map_err(upstream_error)?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let (status, headers, response) = self.dispatch(request).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(upstream_error));
        Ok(HttpStreamResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

/// Shared transport used when the embedding application brings none.
pub fn default_dyn_transport() -> Result<DynHttpTransport, LLMError> {
    Ok(Arc::new(ReqwestTransport::default_client()?))
}
