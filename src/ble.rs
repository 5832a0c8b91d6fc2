use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uuid::Uuid;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};

use crate::gateway::{name_matches, Connection, Gateway, GatewayError, NotificationHandler, PeripheralHandle};


type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

struct BleStack {
    // Keeps the platform session alive for as long as the adapter is in use
    _manager: Manager,
    adapter: Adapter,
}


/// Gateway backed by the first Bluetooth adapter btleplug reports.
/// The adapter is looked up on first use, so a machine without Bluetooth
/// only fails the session that needs it.
pub struct BtleGateway {
    stack: OnceCell<BleStack>,
}

impl BtleGateway {
    pub fn new() -> Self {
        BtleGateway {
            stack: OnceCell::new(),
        }
    }

    async fn adapter(&self) -> Result<&Adapter, GatewayError> {
        let stack = self
            .stack
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter_list = manager.adapters().await?;

                for adapter in adapter_list.iter() {
                    let info = adapter
                        .adapter_info()
                        .await
                        .unwrap_or_else(|_| "No name adapter".to_string());
                    debug!(adapter = %info, "bluetooth adapter");
                }

                // TODO: let the config pick an adapter when there are several
                let adapter = adapter_list
                    .into_iter()
                    .next()
                    .ok_or(GatewayError::AdapterUnavailable)?;

                Ok::<_, GatewayError>(BleStack {
                    _manager: manager,
                    adapter,
                })
            })
            .await?;

        Ok(&stack.adapter)
    }
}

impl Default for BtleGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for BtleGateway {
    type Device = PlatformPeripheral;
    type Connection = BtleConnection;

    async fn discover(
        &self,
        filter: &str,
        timeout: Duration,
    ) -> Result<PeripheralHandle<PlatformPeripheral>, GatewayError> {
        let adapter = self.adapter().await?;
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        let scan = ScanGuard::new(adapter.clone());

        let mut seen = HashSet::new();
        let found = tokio::time::timeout(
            timeout,
            first_match(adapter, &mut events, filter, &mut seen),
        )
        .await;

        scan.stop().await;

        match found {
            Ok(result) => result,
            Err(_elapsed) if seen.is_empty() => Err(GatewayError::NoDevices),
            Err(_elapsed) => Err(GatewayError::NoMatch {
                seen: seen.len(),
                filter: filter.to_string(),
            }),
        }
    }

    async fn connect(
        &self,
        handle: PeripheralHandle<PlatformPeripheral>,
    ) -> Result<Arc<BtleConnection>, GatewayError> {
        let adapter = self.adapter().await?.clone();
        let peripheral = handle.device.clone();
        let connect_failed = |err: btleplug::Error| GatewayError::ConnectFailed(err.to_string());

        if !peripheral.is_connected().await? {
            peripheral.connect().await.map_err(connect_failed)?;
        }

        info!(name = %handle.display_name(), address = %handle.address, "discovering services");
        if let Err(err) = peripheral.discover_services().await {
            close_half_open(&peripheral).await;
            return Err(connect_failed(err));
        }

        match BtleConnection::open(adapter, peripheral.clone()).await {
            Ok(connection) => Ok(Arc::new(connection)),
            Err(err) => {
                close_half_open(&peripheral).await;
                Err(err)
            }
        }
    }
}

/// Devices the adapter already knew about are checked first, in no
/// particular order. After that, live scan events are taken in the order
/// they arrive.
async fn first_match(
    adapter: &Adapter,
    events: &mut CentralEvents,
    filter: &str,
    seen: &mut HashSet<PeripheralId>,
) -> Result<PeripheralHandle<PlatformPeripheral>, GatewayError> {
    for peripheral in adapter.peripherals().await? {
        if let Some(handle) = check_peripheral(peripheral, filter, seen).await? {
            return Ok(handle);
        }
    }

    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };
        let peripheral = adapter.peripheral(&id).await?;
        if let Some(handle) = check_peripheral(peripheral, filter, seen).await? {
            return Ok(handle);
        }
    }

    // The event stream only ends if the adapter goes away
    if seen.is_empty() {
        Err(GatewayError::NoDevices)
    } else {
        Err(GatewayError::NoMatch {
            seen: seen.len(),
            filter: filter.to_string(),
        })
    }
}

async fn close_half_open(peripheral: &PlatformPeripheral) {
    if let Err(err) = peripheral.disconnect().await {
        warn!(error = %err, "failed to close half-open link");
    }
}

/// Stops an active scan. If discovery is abandoned before `stop` runs, the
/// scan is stopped from a spawned task instead.
struct ScanGuard {
    adapter: Option<Adapter>,
}

impl ScanGuard {
    fn new(adapter: Adapter) -> Self {
        ScanGuard {
            adapter: Some(adapter),
        }
    }

    async fn stop(mut self) {
        if let Some(adapter) = self.adapter.take() {
            stop_scan(adapter).await;
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let Some(adapter) = self.adapter.take() else { return; };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            debug!("discovery abandoned, stopping scan");
            runtime.spawn(stop_scan(adapter));
        }
    }
}

async fn stop_scan(adapter: Adapter) {
    if let Err(err) = adapter.stop_scan().await {
        warn!(error = %err, "failed to stop scan");
    }
}

async fn check_peripheral(
    peripheral: PlatformPeripheral,
    filter: &str,
    seen: &mut HashSet<PeripheralId>,
) -> Result<Option<PeripheralHandle<PlatformPeripheral>>, GatewayError> {
    let Some(properties) = peripheral.properties().await? else { return Ok(None); };

    if seen.insert(peripheral.id()) {
        debug!(name = ?properties.local_name, address = %properties.address, "detected");
    }

    if !name_matches(properties.local_name.as_deref(), filter) {
        return Ok(None);
    }

    Ok(Some(PeripheralHandle {
        name: properties.local_name,
        address: properties.address.to_string(),
        device: peripheral,
    }))
}


/// An open GATT link. Notification frames are drained by one spawned task
/// per subscribed characteristic.
pub struct BtleConnection {
    peripheral: PlatformPeripheral,
    subscriptions: Mutex<Vec<Characteristic>>,
    delivery_tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    link_lost: Arc<watch::Sender<bool>>,
    closed: AtomicBool,
}

impl BtleConnection {
    async fn open(adapter: Adapter, peripheral: PlatformPeripheral) -> Result<Self, GatewayError> {
        let cancel = CancellationToken::new();
        let (link_lost, _) = watch::channel(false);
        let link_lost = Arc::new(link_lost);

        let mut events = adapter.events().await?;
        let watched_id = peripheral.id();
        let watcher_cancel = cancel.child_token();
        let watcher_link = Arc::clone(&link_lost);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher_cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == watched_id => {
                            warn!("peripheral disconnected");
                            watcher_link.send_replace(true);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });

        Ok(BtleConnection {
            peripheral,
            subscriptions: Mutex::new(vec![]),
            delivery_tasks: Mutex::new(vec![]),
            cancel,
            link_lost,
            closed: AtomicBool::new(false),
        })
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, GatewayError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or(GatewayError::CharacteristicMissing(uuid))
    }
}

#[async_trait]
impl Connection for BtleConnection {
    async fn subscribe_notifications(
        &self,
        characteristic_id: Uuid,
        on_data: NotificationHandler,
    ) -> Result<(), GatewayError> {
        let characteristic = self.characteristic(characteristic_id)?;
        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(GatewayError::SubscribeFailed(format!(
                "{characteristic_id} does not support notifications"
            )));
        }

        // Take the stream before subscribing so the first frames aren't missed
        let mut notifications = self.peripheral.notifications().await?;
        debug!(uuid = %characteristic_id, "subscribing to characteristic");
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|err| GatewayError::SubscribeFailed(err.to_string()))?;

        let cancel = self.cancel.child_token();
        let link_lost = Arc::clone(&self.link_lost);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    notification = notifications.next() => match notification {
                        Some(data) if data.uuid == characteristic_id => on_data(data.value),
                        Some(_) => {}
                        None => {
                            // The stream only ends when the link went away, unless we are stopping
                            if !cancel.is_cancelled() {
                                link_lost.send_replace(true);
                            }
                            break;
                        }
                    },
                }
            }
        });

        self.subscriptions.lock().await.push(characteristic);
        self.delivery_tasks.lock().await.push(task);
        Ok(())
    }

    async fn read_characteristic(&self, characteristic_id: Uuid) -> Result<Vec<u8>, GatewayError> {
        let characteristic = self.characteristic(characteristic_id)?;
        self.peripheral
            .read(&characteristic)
            .await
            .map_err(|err| GatewayError::ReadFailed(err.to_string()))
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for characteristic in self.subscriptions.lock().await.drain(..) {
            if let Err(err) = self.peripheral.unsubscribe(&characteristic).await {
                warn!(uuid = %characteristic.uuid, error = %err, "unsubscribe failed");
            }
        }

        self.cancel.cancel();
        for task in self.delivery_tasks.lock().await.drain(..) {
            let _ = task.await;
        }

        if let Err(err) = self.peripheral.disconnect().await {
            warn!(error = %err, "disconnect failed");
        }
        info!(address = %self.peripheral.address(), "disconnected from peripheral");
    }

    async fn dropped(&self) {
        let mut lost = self.link_lost.subscribe();
        let _ = lost.wait_for(|lost| *lost).await;
    }
}

impl Drop for BtleConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
