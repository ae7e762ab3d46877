use std::collections::VecDeque;

use futures::future::Either;
use stingbot_protocol::ServerEvent;
use tokio_util::sync::CancellationToken;

/// Byte accumulator that retains only the most recent `retention_bytes`.
#[derive(Debug)]
pub struct CappedOutput {
    bytes: VecDeque<u8>,
    retention_bytes: usize,
    dropped_bytes: u64,
}

impl CappedOutput {
    pub fn new(retention_bytes: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            retention_bytes,
            dropped_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk.iter().copied());
        let overflow = self.bytes.len().saturating_sub(self.retention_bytes);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped_bytes = self.dropped_bytes.saturating_add(overflow as u64);
        }
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn to_string_lossy(&self) -> String {
        let (head, tail) = self.bytes.as_slices();
        let mut contiguous = Vec::with_capacity(head.len() + tail.len());
        contiguous.extend_from_slice(head);
        contiguous.extend_from_slice(tail);
        String::from_utf8_lossy(&contiguous).into_owned()
    }
}

/// Per-connection outbound event queue.
///
/// Once closed (connection gone or session discarded) every send is dropped,
/// including sends already waiting for queue capacity.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: async_channel::Sender<ServerEvent>,
    closed: CancellationToken,
}

impl EventSink {
    pub fn new(tx: async_channel::Sender<ServerEvent>) -> Self {
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Returns `false` when the event was not delivered to the queue.
    pub async fn send(&self, event: ServerEvent) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        let send = std::pin::pin!(self.tx.send(event));
        let closed = std::pin::pin!(self.closed.cancelled());
        match futures::future::select(closed, send).await {
            Either::Left(_) => false,
            Either::Right((result, _)) => result.is_ok(),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}
