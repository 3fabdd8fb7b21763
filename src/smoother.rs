//! Re-paces bursty text deltas into small, evenly spaced chunks.
//!
//! Providers deliver tokens in irregular bursts. The smoother buffers text in a
//! producer task and lets a fixed-period timer release at most `chunk_size`
//! characters per tick, so clients see a steady typing cadence.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;
use futures_util::{StreamExt, stream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::provider::ProviderEventStream;
use crate::types::{Pacing, ProviderEvent};

pub const DEFAULT_CHUNK_SIZE: usize = 3;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(20);

/// Smoothed plain-text stream.
pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Chunk size and tick period for one smoothing run.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use kotoba_chat::smoother::ChunkSmoother;
///
/// let smoother = ChunkSmoother::new(0, Duration::ZERO);
/// assert_eq!(smoother.chunk_size(), 3);
/// assert_eq!(smoother.interval(), Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSmoother {
    chunk_size: usize,
    interval: Duration,
}

impl Default for ChunkSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_INTERVAL)
    }
}

impl ChunkSmoother {
    /// Zero values fall back to the defaults.
    pub fn new(chunk_size: usize, interval: Duration) -> Self {
        Self {
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            interval: if interval.is_zero() {
                DEFAULT_INTERVAL
            } else {
                interval
            },
        }
    }

    pub fn from_pacing(pacing: Pacing) -> Self {
        Self::new(pacing.chunk_size, pacing.interval)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Smooths a plain sequence of text deltas.
    ///
    /// The concatenation of the output always equals the concatenation of the
    /// input unless `cancel` fires, in which case the stream ends at once and
    /// whatever is still buffered is discarded.
    pub fn smooth_text<S>(&self, source: S, cancel: CancellationToken) -> TextStream
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let segments = self.run(source.map(Segment::Text), cancel);
        Box::pin(segments.filter_map(|segment| async move {
            match segment {
                Segment::Text(text) => Some(text),
                Segment::Event(_) => None,
            }
        }))
    }

    /// Smooths the text deltas of a provider stream.
    ///
    /// Non-text events keep their position: each one is forwarded as soon as
    /// the text queued before it has drained, without waiting for a tick, and a
    /// chunk never straddles one.
    pub fn smooth_events<S>(&self, source: S, cancel: CancellationToken) -> ProviderEventStream
    where
        S: Stream<Item = ProviderEvent> + Send + 'static,
    {
        let segments = self.run(
            source.map(|event| match event {
                ProviderEvent::TextDelta(text) => Segment::Text(text),
                other => Segment::Event(other),
            }),
            cancel,
        );
        Box::pin(segments.map(|segment| match segment {
            Segment::Text(text) => ProviderEvent::TextDelta(text),
            Segment::Event(event) => event,
        }))
    }

    fn run<S>(&self, source: S, cancel: CancellationToken) -> impl Stream<Item = Segment> + Send + use<S>
    where
        S: Stream<Item = Segment> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let producer_cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            let mut source = Box::pin(source);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = producer_cancel.cancelled() => break,
                    next = source.next() => next,
                };
                match next {
                    Some(segment) => {
                        if tx.send(segment).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let state = Drain {
            rx,
            queue: VecDeque::new(),
            source_done: false,
            chunk_size: self.chunk_size,
            ticker,
            cancel,
            _producer: AbortOnDrop(producer),
        };
        stream::unfold(state, |mut state| async move {
            let segment = state.next_segment().await?;
            Some((segment, state))
        })
    }
}

enum Segment {
    Text(String),
    Event(ProviderEvent),
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Drain {
    rx: UnboundedReceiver<Segment>,
    queue: VecDeque<Segment>,
    source_done: bool,
    chunk_size: usize,
    ticker: Interval,
    cancel: CancellationToken,
    _producer: AbortOnDrop,
}

impl Drain {
    async fn next_segment(&mut self) -> Option<Segment> {
        loop {
            if self.cancel.is_cancelled() {
                self.queue.clear();
                return None;
            }
            while let Ok(segment) = self.rx.try_recv() {
                self.enqueue(segment);
            }

            match self.queue.front() {
                Some(Segment::Event(_)) => return self.queue.pop_front(),
                Some(Segment::Text(_)) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => continue,
                        _ = self.ticker.tick() => {}
                    }
                    // pick up text that arrived during the tick so it joins this chunk
                    while let Ok(segment) = self.rx.try_recv() {
                        self.enqueue(segment);
                    }
                    return self.take_chunk();
                }
                None if self.source_done => return None,
                None => {
                    let received = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => continue,
                        received = self.rx.recv() => received,
                    };
                    match received {
                        Some(segment) => self.enqueue(segment),
                        None => self.source_done = true,
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, segment: Segment) {
        match segment {
            Segment::Text(text) if text.is_empty() => {}
            Segment::Text(text) => match self.queue.back_mut() {
                Some(Segment::Text(buffer)) => buffer.push_str(&text),
                _ => self.queue.push_back(Segment::Text(text)),
            },
            event => self.queue.push_back(event),
        }
    }

    fn take_chunk(&mut self) -> Option<Segment> {
        let (chunk, drained) = match self.queue.front_mut() {
            Some(Segment::Text(buffer)) => {
                let end = buffer
                    .char_indices()
                    .nth(self.chunk_size)
                    .map_or(buffer.len(), |(index, _)| index);
                let chunk: String = buffer.drain(..end).collect();
                (chunk, buffer.is_empty())
            }
            _ => return self.queue.pop_front(),
        };
        if drained {
            self.queue.pop_front();
        }
        Some(Segment::Text(chunk))
    }
}
