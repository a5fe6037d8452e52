//! GATT transport contracts.
//!
//! A platform binding implements [`GattAdapter`] and [`GattLink`]; the driver
//! implements [`GattCallbacks`]. Requests such as [`GattLink::connect`] return
//! immediately and their outcome arrives later through the callbacks, possibly
//! on another thread. Bindings must never call back from inside a request.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::CCCD_UUID;

/// A characteristic as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, service_uuid: Uuid) -> Self {
        Self {
            uuid,
            service_uuid,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(uuid);
        self
    }

    /// True when the characteristic carries the notification-enable descriptor.
    pub fn can_notify(&self) -> bool {
        self.descriptors.contains(&CCCD_UUID)
    }
}

/// A discovered service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Link-level state reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Link dropped or could not be established
    Disconnected { reason: String },
}

/// Events the transport delivers to the driver.
pub trait GattCallbacks: Send + Sync {
    fn on_link_state_changed(&self, state: LinkState);

    /// Result of a [`GattLink::discover_services`] request.
    fn on_services_discovered(&self, result: std::result::Result<Vec<GattService>, String>);
}

/// Entry point of a platform binding.
#[async_trait]
pub trait GattAdapter: Send + Sync {
    /// Resolve `address` and hand back an unconnected link.
    ///
    /// Fails right away when the adapter is missing or disabled, or when the
    /// device is unknown. `callbacks` receives every event of this link.
    async fn open(
        &self,
        address: &str,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> Result<Arc<dyn GattLink>>;
}

/// One GATT client session with one peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Start establishing the link; reported via `on_link_state_changed`.
    fn connect(&self) -> Result<()>;

    /// Start service discovery; reported via `on_services_discovered`.
    fn discover_services(&self) -> Result<()>;

    /// Subscribe to a notify characteristic (writes the CCCD).
    fn enable_notifications(&self, characteristic: &GattCharacteristic) -> Result<()>;

    /// Write `data` to `characteristic`, resolving once the stack accepted it.
    async fn write(&self, characteristic: &GattCharacteristic, data: &[u8]) -> Result<()>;

    /// Tear the link down. Safe to call any number of times.
    fn close(&self);
}
