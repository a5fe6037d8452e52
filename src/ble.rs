//! btleplug binding: scanning, and the [`GattAdapter`]/[`GattLink`] pair the
//! driver runs on.
//!
//! Link requests are spawned on the tokio runtime that opened the link and
//! report back through [`GattCallbacks`] from those tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::printer::CatPrinter;
use crate::protocol::{hex, DATA_CHAR_UUID, PRINTER_SERVICE_UUID};
use crate::transport::{
    GattAdapter, GattCallbacks, GattCharacteristic, GattLink, GattService, LinkState,
};

/// Scan time used by `open` when the address is not cached yet
const LOOKUP_SCAN: Duration = Duration::from_secs(3);

/// Advertised name prefix of MXW01-family printers
const PRINTER_NAME_PREFIX: &str = "MXW";

/// A printer seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Platform peripheral id
    pub id: String,
    /// Bluetooth address, usable with [`CatPrinter::connect`]
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

fn is_printer(name: Option<&str>, services: &[uuid::Uuid]) -> bool {
    services.contains(&PRINTER_SERVICE_UUID)
        || name.is_some_and(|n| n.starts_with(PRINTER_NAME_PREFIX))
}

/// First Bluetooth adapter of the system.
pub struct BtleAdapter {
    adapter: Adapter,
}

impl BtleAdapter {
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TransportUnavailable("no Bluetooth adapter found".into()))?;
        Ok(Self { adapter })
    }

    pub fn from_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Scan for `duration` and list the printers seen.
    #[instrument(skip(self))]
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DeviceInfo>> {
        self.run_scan(duration).await?;
        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            if !is_printer(props.local_name.as_deref(), &props.services) {
                continue;
            }
            found.push(DeviceInfo {
                id: format!("{:?}", peripheral.id()),
                address: peripheral.address().to_string(),
                name: props.local_name,
                rssi: props.rssi,
            });
        }
        info!(count = found.len(), "scan finished");
        Ok(found)
    }

    async fn run_scan(&self, duration: Duration) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        tokio::time::sleep(duration).await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(error = %e, "stop_scan failed");
        }
        Ok(())
    }

    async fn lookup(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            let id = format!("{:?}", peripheral.id());
            if peripheral.address().to_string().eq_ignore_ascii_case(address) || id == address {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn find(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.lookup(address).await? {
            return Ok(peripheral);
        }
        debug!(address, "not cached, scanning");
        self.run_scan(LOOKUP_SCAN).await?;
        self.lookup(address)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))
    }
}

#[async_trait]
impl GattAdapter for BtleAdapter {
    async fn open(
        &self,
        address: &str,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> Result<Arc<dyn GattLink>> {
        let peripheral = self.find(address).await?;
        Ok(Arc::new(BtleLink {
            adapter: self.adapter.clone(),
            peripheral,
            callbacks,
            runtime: Handle::current(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// GATT client session over btleplug.
struct BtleLink {
    adapter: Adapter,
    peripheral: Peripheral,
    callbacks: Arc<dyn GattCallbacks>,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BtleLink {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Same lock close() drains under
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        tasks.push(self.runtime.spawn(task));
    }

    fn characteristic(&self, target: &GattCharacteristic) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.uuid && c.service_uuid == target.service_uuid)
            .ok_or(Error::NotConnected)
    }
}

fn to_gatt_service(service: btleplug::api::Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .into_iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}

#[async_trait]
impl GattLink for BtleLink {
    fn connect(&self) -> Result<()> {
        let adapter = self.adapter.clone();
        let peripheral = self.peripheral.clone();
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            // Subscribe before connecting so an early drop is not missed
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    callbacks.on_link_state_changed(LinkState::Disconnected {
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            if let Err(e) = peripheral.connect().await {
                callbacks.on_link_state_changed(LinkState::Disconnected {
                    reason: e.to_string(),
                });
                return;
            }
            callbacks.on_link_state_changed(LinkState::Connected);

            let id = peripheral.id();
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        callbacks.on_link_state_changed(LinkState::Disconnected {
                            reason: "peripheral disconnected".into(),
                        });
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    fn discover_services(&self) -> Result<()> {
        let peripheral = self.peripheral.clone();
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(to_gatt_service)
                    .collect()),
                Err(e) => Err(e.to_string()),
            };
            callbacks.on_services_discovered(result);
        });
        Ok(())
    }

    fn enable_notifications(&self, characteristic: &GattCharacteristic) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        self.spawn(async move {
            if let Err(e) = peripheral.subscribe(&target).await {
                warn!(error = %e, "subscribe failed");
                return;
            }
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "notification stream unavailable");
                    return;
                }
            };
            // Status payloads are logged, not interpreted
            while let Some(n) = stream.next().await {
                debug!(uuid = %n.uuid, value = %hex(&n.value), "printer notification");
            }
        });
        Ok(())
    }

    async fn write(&self, characteristic: &GattCharacteristic, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let target = self.characteristic(characteristic)?;
        let write_type = if target.uuid == DATA_CHAR_UUID {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| Error::Write(e.to_string()))
    }

    fn close(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!(error = %e, "disconnect on close failed");
            }
        });
    }
}

/// Scan with the default adapter.
pub async fn scan(duration: Duration) -> Result<Vec<DeviceInfo>> {
    BtleAdapter::new().await?.scan(duration).await
}

/// Build a driver on the default adapter and connect it to `address`.
pub async fn connect(address: &str, config: DriverConfig) -> Result<CatPrinter<BtleAdapter>> {
    let printer = CatPrinter::new(BtleAdapter::new().await?, config)?;
    printer.connect(address).await?;
    Ok(printer)
}
