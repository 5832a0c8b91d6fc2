//! In-memory stand-in for a BLE stack.
//!
//! `FakeGateway::simulated()` backs the `--simulate` mode: one strap that
//! beats at a random 50-70 BPM. Tests build scripted gateways instead and
//! drive frames, failures and link loss by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::gateway::{select_first_match, Connection, Gateway, GatewayError, NotificationHandler, PeripheralHandle};
use crate::telemetry::{BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID};

const SIMULATED_BEAT: Duration = Duration::from_millis(800);


#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub name: Option<String>,
    pub address: String,
}

impl FakeDevice {
    pub fn new(name: &str, address: &str) -> Self {
        FakeDevice {
            name: Some(name.to_string()),
            address: address.to_string(),
        }
    }

    pub fn unnamed(address: &str) -> Self {
        FakeDevice {
            name: None,
            address: address.to_string(),
        }
    }
}

/// One GATT operation as seen by the fake peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOp {
    Subscribe(Uuid),
    Read(Uuid),
    Unsubscribe(Uuid),
    Disconnect,
}


pub struct FakeGateway {
    devices: Vec<FakeDevice>,
    connect_error: bool,
    subscribe_error: bool,
    simulate: bool,
    battery_frame: Vec<u8>,
    read_delay: Option<Duration>,
    connect_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    last_connection: Mutex<Option<Arc<FakeConnection>>>,
}

impl FakeGateway {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        FakeGateway {
            devices,
            connect_error: false,
            subscribe_error: false,
            simulate: false,
            battery_frame: vec![100],
            read_delay: None,
            connect_delay: None,
            subscribe_delay: None,
            last_connection: Mutex::new(None),
        }
    }

    pub fn simulated() -> Self {
        FakeGateway {
            simulate: true,
            ..FakeGateway::new(vec![FakeDevice::new("Polar H10 SIMULATED", "00:00:00:00:00:00")])
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.connect_error = true;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.subscribe_error = true;
        self
    }

    pub fn with_battery_frame(mut self, frame: Vec<u8>) -> Self {
        self.battery_frame = frame;
        self
    }

    /// Every battery read takes this long to answer.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.last_connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    type Device = usize;
    type Connection = FakeConnection;

    async fn discover(&self, filter: &str, timeout: Duration) -> Result<PeripheralHandle<usize>, GatewayError> {
        if self.devices.is_empty() {
            tokio::time::sleep(timeout).await;
            return Err(GatewayError::NoDevices);
        }

        let names = self.devices.iter().map(|device| device.name.as_deref());
        let Some(index) = select_first_match(names, filter) else {
            return Err(GatewayError::NoMatch {
                seen: self.devices.len(),
                filter: filter.to_string(),
            });
        };

        let device = &self.devices[index];
        Ok(PeripheralHandle {
            name: device.name.clone(),
            address: device.address.clone(),
            device: index,
        })
    }

    async fn connect(&self, handle: PeripheralHandle<usize>) -> Result<Arc<FakeConnection>, GatewayError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.connect_error {
            return Err(GatewayError::ConnectFailed(format!(
                "{} rejected the connection",
                handle.address
            )));
        }

        let connection = Arc::new(FakeConnection {
            handlers: Mutex::new(HashMap::new()),
            battery_frame: Mutex::new(self.battery_frame.clone()),
            subscribe_error: self.subscribe_error,
            simulate: self.simulate,
            read_delay: self.read_delay,
            subscribe_delay: self.subscribe_delay,
            read_count: AtomicUsize::new(0),
            reads_in_flight: Arc::new(AtomicUsize::new(0)),
            journal: Mutex::new(vec![]),
            link_lost: watch::channel(false).0,
            closed: AtomicBool::new(false),
            simulator: CancellationToken::new(),
        });

        *self
            .last_connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&connection));
        Ok(connection)
    }
}


pub struct FakeConnection {
    handlers: Mutex<HashMap<Uuid, NotificationHandler>>,
    battery_frame: Mutex<Vec<u8>>,
    subscribe_error: bool,
    simulate: bool,
    read_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    read_count: AtomicUsize,
    reads_in_flight: Arc<AtomicUsize>,
    journal: Mutex<Vec<GattOp>>,
    link_lost: watch::Sender<bool>,
    closed: AtomicBool,
    simulator: CancellationToken,
}

/// Decrements the in-flight counter even when the read future is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeConnection {
    fn record(&self, op: GattOp) {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(op);
    }

    /// Delivers a heart-rate notification frame. Returns false when nobody
    /// is subscribed.
    pub fn push(&self, frame: &[u8]) -> bool {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&HEART_RATE_MEASUREMENT_UUID)
            .cloned();

        match handler {
            Some(on_data) => {
                on_data(frame.to_vec());
                true
            }
            None => false,
        }
    }

    pub fn set_battery_frame(&self, frame: Vec<u8>) {
        *self
            .battery_frame
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = frame;
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self) {
        self.link_lost.send_replace(true);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn reads_in_flight(&self) -> usize {
        self.reads_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<GattOp> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn spawn_simulator(&self, on_data: NotificationHandler) {
        let cancel = self.simulator.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SIMULATED_BEAT) => {}
                }
                let random = rand::thread_rng().gen_range(50..70);
                on_data(vec![0x00, random]);
            }
        });
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn subscribe_notifications(
        &self,
        characteristic: Uuid,
        on_data: NotificationHandler,
    ) -> Result<(), GatewayError> {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        if self.subscribe_error {
            return Err(GatewayError::SubscribeFailed(format!(
                "{characteristic} refused the subscription"
            )));
        }
        if characteristic != HEART_RATE_MEASUREMENT_UUID {
            return Err(GatewayError::CharacteristicMissing(characteristic));
        }

        self.record(GattOp::Subscribe(characteristic));
        if self.simulate {
            self.spawn_simulator(Arc::clone(&on_data));
        }
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(characteristic, on_data);
        Ok(())
    }

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ReadFailed("link is closed".to_string()));
        }
        if characteristic != BATTERY_LEVEL_UUID {
            return Err(GatewayError::CharacteristicMissing(characteristic));
        }

        self.record(GattOp::Read(characteristic));
        self.read_count.fetch_add(1, Ordering::SeqCst);
        self.reads_in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(Arc::clone(&self.reads_in_flight));

        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }

        let mut frame = self
            .battery_frame
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = frame.clone();
        // The simulated strap loses a percent now and then
        if self.simulate && rand::thread_rng().gen_bool(0.1) {
            if let Some(level) = frame.first_mut() {
                *level = level.saturating_sub(1);
            }
        }

        Ok(current)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let unsubscribed: Vec<Uuid> = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(uuid, _)| uuid)
            .collect();
        for uuid in unsubscribed {
            self.record(GattOp::Unsubscribe(uuid));
        }

        self.simulator.cancel();
        self.record(GattOp::Disconnect);
        debug!("fake peripheral disconnected");
    }

    async fn dropped(&self) {
        let mut lost = self.link_lost.subscribe();
        let _ = lost.wait_for(|lost| *lost).await;
    }
}
