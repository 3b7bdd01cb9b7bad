//! Channel-backed observer sink
//!
//! The transport side of an observer: a bounded queue the real-time stream
//! drains. Hand-off never blocks; a full buffer drops the delivery.

use crate::domain::ports::{DeliveryOutcome, EventSink};
use crate::events::event::Event;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default per-observer buffer
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

/// Observer sink feeding a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<Event>>,
}

impl ChannelSink {
    /// Create a sink and the receiver the transport reads from
    pub fn channel(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: Arc<Event>) -> DeliveryOutcome {
        match self.tx.try_send(event) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(_)) => DeliveryOutcome::Full,
            Err(TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }
}
