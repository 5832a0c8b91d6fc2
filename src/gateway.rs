//! The seam between the session and a BLE stack.
//!
//! [`Gateway`] finds and connects a single named peripheral, [`Connection`]
//! talks GATT to it. `ble::BtleGateway` drives real hardware through btleplug,
//! `fake::FakeGateway` is the in-memory stand-in used by `--simulate` and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;


/// Called for every notification frame. Runs on the BLE stack's delivery
/// task, so it has to return promptly.
pub type NotificationHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;


#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("scan timed out without seeing any device")]
    NoDevices,
    #[error("saw {seen} device(s) but none named like {filter:?}")]
    NoMatch { seen: usize, filter: String },
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("characteristic {0} not found on peripheral")]
    CharacteristicMissing(Uuid),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

impl GatewayError {
    /// Both ways a scan can come back empty-handed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NoDevices | GatewayError::NoMatch { .. })
    }
}


/// A discovered device. `device` is the stack-specific handle used to connect.
#[derive(Debug, Clone)]
pub struct PeripheralHandle<D> {
    pub name: Option<String>,
    pub address: String,
    pub device: D,
}

impl<D> PeripheralHandle<D> {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(peripheral name unknown)")
    }
}


#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    type Device: Send + Sync + 'static;
    type Connection: Connection;

    /// Returns the first device, in discovery order, whose advertised name
    /// contains `filter` (case-sensitive).
    async fn discover(
        &self,
        filter: &str,
        timeout: Duration,
    ) -> Result<PeripheralHandle<Self::Device>, GatewayError>;

    /// Consumes the handle: after a failure the device has to be rediscovered.
    async fn connect(
        &self,
        handle: PeripheralHandle<Self::Device>,
    ) -> Result<Arc<Self::Connection>, GatewayError>;
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn subscribe_notifications(
        &self,
        characteristic: Uuid,
        on_data: NotificationHandler,
    ) -> Result<(), GatewayError>;

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, GatewayError>;

    /// Unsubscribes every notification, then closes the link. Calling it on a
    /// closed connection does nothing.
    async fn disconnect(&self);

    /// Resolves once the link is lost without a local `disconnect`.
    async fn dropped(&self);
}


pub fn name_matches(name: Option<&str>, filter: &str) -> bool {
    name.is_some_and(|name| name.contains(filter))
}

/// First match by discovery order, not by signal strength or exact name.
pub fn select_first_match<'a, I>(candidates: I, filter: &str) -> Option<usize>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .position(|name| name_matches(name, filter))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_peripheral_still_has_a_display_name() {
        let handle = PeripheralHandle { name: None, address: "AA:BB".to_string(), device: () };
        assert_eq!(handle.display_name(), "(peripheral name unknown)");

        let handle = PeripheralHandle { name: Some("Polar H10".to_string()), ..handle };
        assert_eq!(handle.display_name(), "Polar H10");
    }

    #[test]
    fn picks_first_containing_filter() {
        let names = [Some("Polar H10"), Some("Other")];
        assert_eq!(select_first_match(names, "Polar"), Some(0));

        let names = [Some("Other"), None, Some("Polar H10 A1"), Some("Polar H10 B2")];
        assert_eq!(select_first_match(names, "Polar"), Some(2));
    }

    #[test]
    fn matching_is_case_sensitive_substring() {
        assert!(name_matches(Some("My Polar strap"), "Polar"));
        assert!(!name_matches(Some("polar h10"), "Polar"));
        assert!(!name_matches(None, "Polar"));
    }

    #[test]
    fn both_scan_misses_count_as_not_found() {
        assert!(GatewayError::NoDevices.is_not_found());
        assert!(GatewayError::NoMatch { seen: 2, filter: "Polar".into() }.is_not_found());
        assert!(!GatewayError::ConnectFailed("rejected".into()).is_not_found());
    }
}
