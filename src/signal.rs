use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::debug;

use crate::hub::SubscriberId;

const STATUS_BUS_CAPACITY: usize = 256;


/// Everything the core reports to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Scanning,
    DeviceFound { name: String, address: String },
    Connected { name: String },
    NotFound,
    HeartRate { bpm: u8 },
    BatteryLevel { percent: u8 },
    SubscriberJoined { count: usize },
    SubscriberLeft { count: usize },
    NoSubscribers,
    DeliverySkipped { subscriber: SubscriberId },
    SubscriberMessage { subscriber: SubscriberId, text: String },
    Listening { addr: SocketAddr },
    DecodeError { detail: String },
    Disconnected,
    Failed { reason: String },
}

/// Requests coming from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlIntent {
    Start,
    Stop,
}


/// Fan-out of status events to any number of observers (UI, logger, tests).
/// Emitting never blocks and never fails, even with nobody listening.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_BUS_CAPACITY);
        StatusBus { tx }
    }

    pub fn emit(&self, event: StatusEvent) {
        debug!(?event, "status");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_listeners_is_fine() {
        let bus = StatusBus::new();
        bus.emit(StatusEvent::Scanning);
    }

    #[tokio::test]
    async fn every_subscriber_sees_events_in_order() {
        let bus = StatusBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(StatusEvent::Scanning);
        bus.emit(StatusEvent::HeartRate { bpm: 60 });

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap(), StatusEvent::Scanning);
            assert_eq!(rx.recv().await.unwrap(), StatusEvent::HeartRate { bpm: 60 });
        }
    }
}
