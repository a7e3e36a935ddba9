// Device registry — address → session map with explicit lifecycle
//
// Owned by whoever drives the radio. Connection and disconnection callbacks
// from the platform open and close sessions here; callers look sessions up by
// address. Nothing is process-global.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::adapter::AdapterState;
use crate::catalog::DeviceKind;
use crate::codec::{Command, ProtocolCodec};
use crate::config::EngineConfig;
use crate::session::{DeviceSession, SessionError};
use crate::transfer::TaskHandle;
use crate::transport::Transport;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No session for device {0}")]
    UnknownDevice(String),

    #[error("Unsupported device name: {0}")]
    UnsupportedDevice(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Connect, disconnect and adapter callbacks are applied one at a time, in
/// the order they arrive. A disconnect that lands while the session is still
/// opening waits for the open to finish and then closes it.
pub struct DeviceRegistry {
    config: EngineConfig,
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl DeviceRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a session for a freshly connected device.
    ///
    /// An existing session for the same address is closed first.
    pub async fn on_connected(
        &self,
        address: &str,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ProtocolCodec>,
    ) -> Result<Arc<DeviceSession>, RegistryError> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(stale) = self.remove(address) {
            warn!(address, "Replacing existing session");
            stale.close().await;
        }

        let session = Arc::new(DeviceSession::open(address, codec, transport, &self.config).await?);
        self.sessions
            .write()
            .insert(address.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Like [`on_connected`](Self::on_connected), picking the codec from the
    /// device's advertised name
    pub async fn on_connected_named(
        &self,
        address: &str,
        ble_name: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<DeviceSession>, RegistryError> {
        let kind = DeviceKind::from_ble_name(ble_name)
            .ok_or_else(|| RegistryError::UnsupportedDevice(ble_name.to_string()))?;
        info!(address, %kind, "Known device connected");
        self.on_connected(address, transport, kind.codec()).await
    }

    /// Close and forget the session for `address`.
    ///
    /// Returns how many tasks were cancelled.
    pub async fn on_disconnected(&self, address: &str) -> Result<usize, RegistryError> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self
            .remove(address)
            .ok_or_else(|| RegistryError::UnknownDevice(address.to_string()))?;
        Ok(session.close().await)
    }

    pub fn session(&self, address: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().get(address).cloned()
    }

    pub fn submit(&self, address: &str, command: Command) -> Result<TaskHandle, RegistryError> {
        Ok(self.require(address)?.submit(command))
    }

    pub async fn send_raw(&self, address: &str, data: impl Into<Bytes>) -> Result<(), RegistryError> {
        let session = self.require(address)?;
        session.send_raw(data).await?;
        Ok(())
    }

    /// Addresses with an open session, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.sessions.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session. Returns the total number of cancelled tasks.
    pub async fn disconnect_all(&self) -> usize {
        let _lifecycle = self.lifecycle.lock().await;
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        let mut cancelled = 0;
        for session in sessions {
            cancelled += session.close().await;
        }
        cancelled
    }

    /// React to an adapter state change; sessions cannot outlive the radio
    pub async fn handle_adapter_state(&self, state: AdapterState) -> usize {
        if !state.is_unusable() || self.is_empty() {
            return 0;
        }
        info!(%state, sessions = self.len(), "Adapter unavailable, closing sessions");
        self.disconnect_all().await
    }

    fn remove(&self, address: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.write().remove(address)
    }

    fn require(&self, address: &str) -> Result<Arc<DeviceSession>, RegistryError> {
        self.session(address)
            .ok_or_else(|| RegistryError::UnknownDevice(address.to_string()))
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
