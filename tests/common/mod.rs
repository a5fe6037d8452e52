//! In-memory GATT binding for driver tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use catprint_ble::protocol::{
    CCCD_UUID, DATA_CHAR_UUID, NOTIFY_CHAR_UUID, PRINTER_SERVICE_UUID, WRITE_CHAR_UUID,
};
use catprint_ble::transport::{
    GattAdapter, GattCallbacks, GattCharacteristic, GattLink, GattService, LinkState,
};
use catprint_ble::{DriverConfig, Error, Result};
use tokio::time::Instant;
use uuid::Uuid;

/// Printer that never answers the link request
pub const DEAD: &str = "DE:AD:00:00:00:00";
/// Address the adapter cannot resolve
pub const UNKNOWN: &str = "00:00:00:00:00:00";
/// Printer whose service lacks the data characteristic
pub const NO_DATA_CHAR: &str = "0D:D0:00:00:00:00";
pub const PRINTER: &str = "AA:BB:CC:DD:EE:FF";

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub uuid: Uuid,
    pub data: Vec<u8>,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockState {
    pub writes: Mutex<Vec<RecordedWrite>>,
    pub opens: AtomicUsize,
    pub connects: AtomicUsize,
    pub subscriptions: AtomicUsize,
    pub closes: AtomicUsize,
    /// Zero-based index of the write that fails
    pub fail_write_at: Mutex<Option<usize>>,
    /// Deliver link events from a plain OS thread
    pub threaded: AtomicBool,
    callbacks: Mutex<Option<Arc<dyn GattCallbacks>>>,
}

impl MockState {
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_link(&self, reason: &str) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        if let Some(cb) = callbacks {
            cb.on_link_state_changed(LinkState::Disconnected {
                reason: reason.to_string(),
            });
        }
    }
}

#[derive(Clone, Default)]
pub struct MockAdapter {
    pub state: Arc<MockState>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GattAdapter for MockAdapter {
    async fn open(
        &self,
        address: &str,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> Result<Arc<dyn GattLink>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if address == UNKNOWN {
            return Err(Error::DeviceNotFound(address.to_string()));
        }
        *self.state.callbacks.lock().unwrap() = Some(callbacks.clone());
        Ok(Arc::new(MockLink {
            address: address.to_string(),
            callbacks,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockLink {
    address: String,
    callbacks: Arc<dyn GattCallbacks>,
    state: Arc<MockState>,
    closed: AtomicBool,
}

pub fn printer_services(with_data: bool) -> Vec<GattService> {
    let mut characteristics = vec![
        GattCharacteristic::new(WRITE_CHAR_UUID, PRINTER_SERVICE_UUID),
        GattCharacteristic::new(NOTIFY_CHAR_UUID, PRINTER_SERVICE_UUID)
            .with_descriptor(CCCD_UUID),
    ];
    if with_data {
        characteristics.push(GattCharacteristic::new(DATA_CHAR_UUID, PRINTER_SERVICE_UUID));
    }
    vec![
        GattService {
            uuid: Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb),
            characteristics: Vec::new(),
        },
        GattService {
            uuid: PRINTER_SERVICE_UUID,
            characteristics,
        },
    ]
}

#[async_trait]
impl GattLink for MockLink {
    fn connect(&self) -> Result<()> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.address == DEAD {
            return Ok(());
        }
        let callbacks = self.callbacks.clone();
        if self.state.threaded.load(Ordering::SeqCst) {
            std::thread::spawn(move || callbacks.on_link_state_changed(LinkState::Connected));
        } else {
            tokio::spawn(async move { callbacks.on_link_state_changed(LinkState::Connected) });
        }
        Ok(())
    }

    fn discover_services(&self) -> Result<()> {
        let callbacks = self.callbacks.clone();
        let services = printer_services(self.address != NO_DATA_CHAR);
        if self.state.threaded.load(Ordering::SeqCst) {
            std::thread::spawn(move || callbacks.on_services_discovered(Ok(services)));
        } else {
            tokio::spawn(async move { callbacks.on_services_discovered(Ok(services)) });
        }
        Ok(())
    }

    fn enable_notifications(&self, characteristic: &GattCharacteristic) -> Result<()> {
        assert_eq!(characteristic.uuid, NOTIFY_CHAR_UUID);
        self.state.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, characteristic: &GattCharacteristic, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let mut writes = self.state.writes.lock().unwrap();
        if *self.state.fail_write_at.lock().unwrap() == Some(writes.len()) {
            return Err(Error::Write("gatt write status 133".into()));
        }
        writes.push(RecordedWrite {
            uuid: characteristic.uuid,
            data: data.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Default timings with a short connect timeout.
pub fn test_config() -> DriverConfig {
    DriverConfig {
        connect_timeout_ms: 1_000,
        ..DriverConfig::default()
    }
}
