use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::ChatStream;
use crate::types::ProviderEvent;

/// Standardized SSE event yielded by [`SseDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Raw `data:` payload, with the `event:` name when the provider sent one.
    Data { event: Option<String>, data: String },
    /// Terminal marker reported via `[DONE]`.
    Done,
}

/// Normalizes provider SSE feeds into [`SseEvent`] values.
///
/// OpenAI, Anthropic and Gemini all stream through this decoder; each adapter
/// only parses the JSON inside the `data:` lines.
pub struct SseDecoder {
    body: HttpBodyStream,
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<Vec<u8>>,
    pending: VecDeque<Result<SseEvent, LLMError>>,
    provider: &'static str,
    stream_closed: bool,
    done_received: bool,
}

impl SseDecoder {
    /// Wraps a raw HTTP body stream and prepares it for SSE decoding.
    pub fn new(body: HttpBodyStream, provider: &'static str) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            event_name: None,
            data_lines: Vec::new(),
            pending: VecDeque::new(),
            provider,
            stream_closed: false,
            done_received: false,
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        if let Some(rest) = line.strip_prefix(b"data:") {
            self.data_lines.push(strip_leading_space(rest).to_vec());
        } else if let Some(rest) = line.strip_prefix(b"event:") {
            let name = String::from_utf8_lossy(strip_leading_space(rest)).into_owned();
            self.event_name = Some(name);
        }
    }

    fn flush_event(&mut self) -> Result<(), LLMError> {
        let event = self.event_name.take();
        if self.data_lines.is_empty() {
            return Ok(());
        }

        let mut joined = Vec::new();
        for (idx, mut segment) in self.data_lines.drain(..).enumerate() {
            if idx > 0 {
                joined.push(b'\n');
            }
            joined.append(&mut segment);
        }

        if joined.is_empty() {
            return Ok(());
        }

        let data = String::from_utf8(joined).map_err(|err| {
            LLMError::protocol(
                self.provider,
                format!("invalid UTF-8 in stream chunk: {err}"),
                None,
            )
        })?;

        if data.trim() == "[DONE]" {
            if !self.done_received {
                self.done_received = true;
                self.pending.push_back(Ok(SseEvent::Done));
            }
        } else {
            self.pending.push_back(Ok(SseEvent::Data { event, data }));
        }

        Ok(())
    }
}

impl Stream for SseDecoder {
    type Item = Result<SseEvent, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(event));
        }

        if this.done_received {
            return Poll::Ready(None);
        }

        loop {
            if this.stream_closed {
                if !this.buffer.is_empty() {
                    let line = this.buffer.drain(..).collect::<Vec<u8>>();
                    this.handle_line(line);
                }
                if let Err(err) = this.flush_event() {
                    return Poll::Ready(Some(Err(err)));
                }
                return Poll::Ready(this.pending.pop_front());
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    while let Some(line) = drain_line(&mut this.buffer) {
                        if line.is_empty() {
                            if let Err(err) = this.flush_event() {
                                return Poll::Ready(Some(Err(err)));
                            }
                        } else {
                            this.handle_line(line);
                        }
                    }
                    if let Some(event) = this.pending.pop_front() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => {
                    this.stream_closed = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Splits a newline-delimited JSON body (Ollama) into one string per line.
pub struct NdjsonDecoder {
    body: HttpBodyStream,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, LLMError>>,
    provider: &'static str,
    stream_closed: bool,
}

impl NdjsonDecoder {
    pub fn new(body: HttpBodyStream, provider: &'static str) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            provider,
            stream_closed: false,
        }
    }

    fn push_line(&mut self, line: Vec<u8>) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let decoded = String::from_utf8(line).map_err(|err| {
            LLMError::protocol(
                self.provider,
                format!("invalid UTF-8 in stream line: {err}"),
                None,
            )
        });
        self.pending.push_back(decoded);
    }
}

impl Stream for NdjsonDecoder {
    type Item = Result<String, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(line) = this.pending.pop_front() {
                return Poll::Ready(Some(line));
            }
            if this.stream_closed {
                if this.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                let rest = this.buffer.drain(..).collect::<Vec<u8>>();
                this.push_line(rest);
                continue;
            }
            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    while let Some(line) = drain_line(&mut this.buffer) {
                        this.push_line(line);
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => this.stream_closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Stateful translation from decoded wire items into [`ProviderEvent`]s.
///
/// Adapters keep whatever they need across items here, e.g. a finish reason
/// that must wait for trailing usage.
pub(crate) trait EventConverter: Send + Unpin + 'static {
    type Item;

    fn convert(
        &mut self,
        item: Self::Item,
        out: &mut VecDeque<ProviderEvent>,
    ) -> Result<(), LLMError>;

    /// Called once when the body ends.
    fn finish(&mut self, _out: &mut VecDeque<ProviderEvent>) {}
}

/// Drives an [`EventConverter`] over a decoded body.
pub(crate) fn convert_stream<S, C>(inner: S, converter: C) -> ChatStream
where
    S: Stream<Item = Result<C::Item, LLMError>> + Send + Unpin + 'static,
    C: EventConverter,
{
    Box::pin(ConvertedStream {
        inner,
        converter,
        pending: VecDeque::new(),
        error: None,
        ended: false,
    })
}

struct ConvertedStream<S, C> {
    inner: S,
    converter: C,
    pending: VecDeque<ProviderEvent>,
    error: Option<LLMError>,
    ended: bool,
}

impl<S, C> Stream for ConvertedStream<S, C>
where
    S: Stream<Item = Result<C::Item, LLMError>> + Unpin,
    C: EventConverter,
{
    type Item = Result<ProviderEvent, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if let Some(err) = this.error.take() {
                return Poll::Ready(Some(Err(err)));
            }
            if this.ended {
                return Poll::Ready(None);
            }
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(item))) => {
                    if let Err(err) = this.converter.convert(item, &mut this.pending) {
                        this.error = Some(err);
                        this.ended = true;
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.error = Some(err);
                    this.ended = true;
                }
                Poll::Ready(None) => {
                    this.converter.finish(&mut this.pending);
                    this.ended = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Drains a non-2xx streaming body so the adapter can parse the error payload.
pub(crate) async fn collect_stream_text(
    mut body: HttpBodyStream,
    provider: &'static str,
) -> Result<String, LLMError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    String::from_utf8(bytes).map_err(|err| {
        LLMError::protocol(
            provider,
            format!("failed to decode stream error body: {err}"),
            None,
        )
    })
}

fn strip_leading_space(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b" ").unwrap_or(bytes)
}

fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    buffer.iter().position(|b| *b == b'\n').map(|pos| {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line
    })
}
