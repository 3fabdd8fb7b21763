//! Where encoded events go, and how a vanished client is noticed.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::encoder::OutboundEvent;

/// The client side of the stream is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client connection closed")]
pub struct SinkClosed;

/// Pushes encoded events to one client, in order.
#[async_trait]
pub trait TransportWriter: Send {
    /// # Errors
    ///
    /// [`SinkClosed`] once the client has disconnected; nothing further will be delivered.
    async fn write(&mut self, event: OutboundEvent) -> Result<(), SinkClosed>;
}

/// Writer backed by a bounded channel whose receiver feeds an HTTP response body.
///
/// Dropping the receiver (the client went away) cancels the request token,
/// even while the pipeline is blocked waiting on the provider.
pub struct ChannelWriter {
    tx: mpsc::Sender<OutboundEvent>,
    cancel: CancellationToken,
    _watch: DropGuard,
}

impl ChannelWriter {
    /// Creates the writer and the receiving end of its channel.
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let finished = CancellationToken::new();

        let watch_tx = tx.clone();
        let watch_cancel = cancel.clone();
        let watch_finished = finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch_tx.closed() => {
                    debug!("client disconnected, cancelling request");
                    watch_cancel.cancel();
                }
                _ = watch_finished.cancelled() => {}
                _ = watch_cancel.cancelled() => {}
            }
        });

        let writer = Self {
            tx,
            cancel,
            _watch: finished.drop_guard(),
        };
        (writer, rx)
    }
}

#[async_trait]
impl TransportWriter for ChannelWriter {
    async fn write(&mut self, event: OutboundEvent) -> Result<(), SinkClosed> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SinkClosed),
            sent = self.tx.send(event) => sent.map_err(|_| {
                self.cancel.cancel();
                SinkClosed
            }),
        }
    }
}

/// Collects events in memory; used for non-streaming requests and tests.
#[derive(Debug, Default)]
pub struct BufferedWriter {
    events: Vec<OutboundEvent>,
}

impl BufferedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[OutboundEvent] {
        &self.events
    }

    /// The `final_message` or `error` event, if one was written.
    pub fn terminal(&self) -> Option<&OutboundEvent> {
        self.events.iter().rev().find(|event| event.is_terminal())
    }

    pub fn into_events(self) -> Vec<OutboundEvent> {
        self.events
    }
}

#[async_trait]
impl TransportWriter for BufferedWriter {
    async fn write(&mut self, event: OutboundEvent) -> Result<(), SinkClosed> {
        self.events.push(event);
        Ok(())
    }
}
