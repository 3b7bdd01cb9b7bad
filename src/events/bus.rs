//! Event Bus
//!
//! Explicit bus instance with a start/stop lifecycle. Publishing enqueues
//! into a bounded submission queue and returns immediately; a fixed pool of
//! workers drains the queue and fans each event out through the
//! subscription registry. Delivery is at-most-once with no persistence.

use crate::error::{Error, Result};
use crate::events::event::{Event, EventPayload};
use crate::events::metrics::{BusMetrics, BusMetricsSnapshot};
use crate::events::sink::{ChannelSink, DEFAULT_OBSERVER_BUFFER};
use crate::events::subscriptions::{OwnerId, SubscriptionRegistry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Event bus sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Bounded submission queue; a full queue rejects publishes
    pub queue_capacity: usize,
    /// Dispatch workers draining the queue
    pub workers: usize,
    /// Per-observer delivery buffer for channel sinks
    pub observer_buffer: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 4,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

struct BusRuntime {
    sender: mpsc::Sender<Arc<Event>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Arc<Event>>>>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// Topic-routed event bus
pub struct EventBus {
    config: EventBusConfig,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<BusMetrics>,
    runtime: RwLock<Option<BusRuntime>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig, registry: Arc<SubscriptionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            metrics: Arc::new(BusMetrics::default()),
            runtime: RwLock::new(None),
        })
    }

    /// Spawn the dispatch workers. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("event bus needs a Tokio runtime: {}", e)))?;

        let mut runtime = self.runtime.write();
        if runtime.is_some() {
            return Err(Error::Conflict("event bus is already running".to_string()));
        }

        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let shutdown = CancellationToken::new();
        let worker_count = self.config.workers.max(1);

        let workers = (0..worker_count)
            .map(|id| {
                handle.spawn(run_worker(
                    id,
                    receiver.clone(),
                    self.registry.clone(),
                    self.metrics.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        *runtime = Some(BusRuntime {
            sender,
            receiver,
            shutdown,
            workers,
        });

        info!(
            workers = worker_count,
            queue_capacity = self.config.queue_capacity,
            "Event bus started"
        );
        Ok(())
    }

    /// Stop the workers and wait for them. Queued events are discarded.
    pub async fn stop(&self) {
        let Some(runtime) = self.runtime.write().take() else {
            return;
        };

        runtime.shutdown.cancel();
        drop(runtime.sender);

        for worker in runtime.workers {
            if let Err(e) = worker.await {
                warn!("Event bus worker ended abnormally: {}", e);
            }
        }

        let mut discarded = 0usize;
        let mut rx = runtime.receiver.lock().await;
        rx.close();
        while rx.try_recv().is_ok() {
            discarded += 1;
        }

        info!(discarded, "Event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.runtime.read().is_some()
    }

    /// Submit an event for delivery without waiting for it.
    ///
    /// Fails with `Unavailable` when the bus is not running or the submission
    /// queue is full.
    pub fn publish(&self, event: Event) -> Result<()> {
        let runtime = self.runtime.read();
        let Some(runtime) = runtime.as_ref() else {
            self.metrics.record_rejected();
            return Err(Error::Unavailable("event bus is not running".to_string()));
        };

        let topic = event.topic.clone();
        match runtime.sender.try_send(Arc::new(event)) {
            Ok(()) => {
                self.metrics.record_published();
                trace!(topic = %topic, "Event queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_rejected();
                Err(Error::Unavailable(format!(
                    "event bus queue is full, dropped {}",
                    topic
                )))
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_rejected();
                Err(Error::Unavailable("event bus is shutting down".to_string()))
            }
        }
    }

    /// Publish to a bare topic string; the action is read from its last segment
    pub fn publish_topic(&self, topic: &str, payload: EventPayload) -> Result<()> {
        self.publish(Event::from_topic(topic, payload))
    }

    /// Connect an observer backed by a bounded channel and return the
    /// receiving end for the transport to drain
    pub fn connect(&self, owner_id: impl Into<OwnerId>) -> Result<mpsc::Receiver<Arc<Event>>> {
        let (sink, rx) = ChannelSink::channel(self.config.observer_buffer);
        self.registry.connect(owner_id, sink)?;
        Ok(rx)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Events waiting in the submission queue
    pub fn queue_depth(&self) -> usize {
        self.runtime
            .read()
            .as_ref()
            .map(|rt| rt.sender.max_capacity() - rt.sender.capacity())
            .unwrap_or(0)
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown.cancel();
        }
    }
}

async fn run_worker(
    id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Arc<Event>>>>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<BusMetrics>,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "Event bus worker started");

    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                event = rx.recv() => event,
            }
        };

        let Some(event) = next else {
            break;
        };

        let report = registry.dispatch(&event);
        metrics.record_dispatch(&report);
        trace!(
            worker = id,
            topic = %event.topic,
            matched = report.matched,
            delivered = report.delivered,
            "Event dispatched"
        );
    }

    debug!(worker = id, "Event bus worker stopped");
}
