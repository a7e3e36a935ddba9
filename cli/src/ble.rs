// Desktop BLE link via btleplug
//
// Scans for catalog devices, connects, and exposes a connected peripheral as
// the core's `Transport`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use exdevice_core::{ChunkSink, DeviceKind, Transport, TransportError};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// A catalog device seen during a scan
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub address: String,
    pub name: String,
    pub kind: DeviceKind,
    pub rssi: Option<i16>,
}

/// First available Bluetooth adapter
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.context("Failed to start Bluetooth manager")?;
    manager
        .adapters()
        .await
        .context("Failed to list Bluetooth adapters")?
        .into_iter()
        .next()
        .context("No Bluetooth adapter found")
}

/// Listen for advertisements and return every known device seen
pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<FoundDevice>> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .context("Failed to start scan")?;
    sleep(duration).await;
    stop_scan(adapter).await;

    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        let Some(name) = properties.local_name else {
            continue;
        };
        if let Some(kind) = DeviceKind::from_ble_name(&name) {
            found.push(FoundDevice {
                address: properties.address.to_string(),
                name,
                kind,
                rssi: properties.rssi,
            });
        }
    }
    found.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(found)
}

/// Scan until a peripheral with `address` shows up, then connect to it
pub async fn connect(adapter: &Adapter, address: &str, within: Duration) -> Result<(BleLink, FoundDevice)> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .context("Failed to start scan")?;
    let deadline = Instant::now() + within;

    let (peripheral, found) = loop {
        if let Some(hit) = find_peripheral(adapter, address).await? {
            break hit;
        }
        if Instant::now() >= deadline {
            stop_scan(adapter).await;
            anyhow::bail!("Device {} not found within {:?}", address, within);
        }
        sleep(Duration::from_millis(250)).await;
    };
    stop_scan(adapter).await;

    if !peripheral.is_connected().await? {
        peripheral.connect().await.context("Failed to connect")?;
    }
    peripheral
        .discover_services()
        .await
        .context("Service discovery failed")?;
    info!(address, kind = %found.kind, "Connected");

    Ok((BleLink::new(peripheral), found))
}

async fn stop_scan(adapter: &Adapter) {
    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop scan cleanly: {}", e);
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Option<(Peripheral, FoundDevice)>> {
    for peripheral in adapter.peripherals().await? {
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        if !properties.address.to_string().eq_ignore_ascii_case(address) {
            continue;
        }
        let name = properties.local_name.unwrap_or_default();
        let kind = DeviceKind::from_ble_name(&name)
            .with_context(|| format!("{} advertises unsupported name {:?}", address, name))?;
        let found = FoundDevice {
            address: properties.address.to_string(),
            name,
            kind,
            rssi: properties.rssi,
        };
        return Ok(Some((peripheral, found)));
    }
    Ok(None)
}

/// A connected peripheral
pub struct BleLink {
    peripheral: Peripheral,
    forwarders: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl BleLink {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    pub async fn disconnect(&self) {
        for (_, forwarder) in self.forwarders.lock().drain() {
            forwarder.abort();
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }
}

#[async_trait]
impl Transport for BleLink {
    async fn write(&self, service: Uuid, characteristic: Uuid, data: Bytes) -> Result<(), TransportError> {
        let target = self.characteristic(service, characteristic)?;
        trace!(bytes = %hex::encode(&data), "BLE write");
        self.peripheral
            .write(&target, &data, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe_notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
        sink: ChunkSink,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(service, characteristic)?;
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if !sink.deliver(notification.value) {
                    debug!("Session gone, stopping notification forwarder");
                    break;
                }
            }
        });
        if let Some(previous) = self.forwarders.lock().insert(characteristic, forwarder) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe_notify(&self, service: Uuid, characteristic: Uuid) -> Result<(), TransportError> {
        if let Some(forwarder) = self.forwarders.lock().remove(&characteristic) {
            forwarder.abort();
        }
        let target = self.characteristic(service, characteristic)?;
        self.peripheral
            .unsubscribe(&target)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
