//! Fan-out of telemetry to every connected subscriber.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::signal::{StatusBus, StatusEvent};
use crate::telemetry::TelemetryReading;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber connection closed")]
    Closed,
    #[error("send timed out")]
    TimedOut,
    #[error("transport error: {0}")]
    Transport(String),
}

/// One outbound transport connection.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn send(&self, payload: &str) -> Result<(), DeliveryError>;
}


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Owns the subscriber set. Nothing else adds or removes members.
pub struct Hub {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Endpoint>>>,
    next_id: AtomicU64,
    bus: StatusBus,
}

impl Hub {
    pub fn new(bus: StatusBus) -> Self {
        Hub {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            bus,
        }
    }

    pub async fn accept(&self, endpoint: Arc<dyn Endpoint>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, endpoint);
            subscribers.len()
        };

        info!(subscriber = %id, count, "subscriber joined");
        self.bus.emit(StatusEvent::SubscriberJoined { count });
        id
    }

    /// Returns whether `id` was a member. Only the call that actually removes
    /// it reports `SubscriberLeft`.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let count = {
            let mut subscribers = self.subscribers.write().await;
            if subscribers.remove(&id).is_none() {
                return false;
            }
            subscribers.len()
        };

        info!(subscriber = %id, count, "subscriber left");
        self.bus.emit(StatusEvent::SubscriberLeft { count });
        true
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Sends the reading to every subscriber at once. A failed send evicts
    /// that subscriber only; this never returns an error.
    pub async fn broadcast(&self, reading: &TelemetryReading) -> BroadcastReport {
        let members: Vec<(SubscriberId, Arc<dyn Endpoint>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, endpoint)| (*id, Arc::clone(endpoint)))
            .collect();

        if members.is_empty() {
            self.bus.emit(StatusEvent::NoSubscribers);
            return BroadcastReport::default();
        }

        let payload = reading.wire_payload();
        let sends = members.iter().map(|(id, endpoint)| {
            let payload = payload.as_str();
            async move { (*id, endpoint.send(payload).await) }
        });
        let outcomes = join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(subscriber = %id, error = %err, "delivery failed, evicting subscriber");
                    self.bus.emit(StatusEvent::DeliverySkipped { subscriber: id });
                    if self.remove(id).await {
                        report.evicted += 1;
                    }
                }
            }
        }

        debug!(%reading, delivered = report.delivered, evicted = report.evicted, "broadcast");
        report
    }
}
