// Bluetooth adapter state, published to whoever cares
//
// The platform layer publishes; registries and front-ends subscribe. The bus
// is an ordinary value handed to both sides.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    On,
    Off,
    TurningOn,
    TurningOff,
}

impl AdapterState {
    /// Connections cannot survive this state
    pub fn is_unusable(&self) -> bool {
        matches!(self, AdapterState::Off | AdapterState::TurningOff)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::On => write!(f, "on"),
            AdapterState::Off => write!(f, "off"),
            AdapterState::TurningOn => write!(f, "turning on"),
            AdapterState::TurningOff => write!(f, "turning off"),
        }
    }
}

/// Publish/subscribe hub for adapter state changes. Clones share one channel.
#[derive(Clone)]
pub struct AdapterStateBus {
    sender: broadcast::Sender<AdapterState>,
    current: Arc<RwLock<Option<AdapterState>>>,
}

impl AdapterStateBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// Record and broadcast a state. Returns how many subscribers saw it.
    pub fn publish(&self, state: AdapterState) -> usize {
        let previous = self.current.write().replace(state);
        if previous != Some(state) {
            info!(%state, "Bluetooth adapter state changed");
        }
        self.sender.send(state).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterState> {
        self.sender.subscribe()
    }

    /// Last published state, if any
    pub fn current(&self) -> Option<AdapterState> {
        *self.current.read()
    }
}

impl Default for AdapterStateBus {
    fn default() -> Self {
        Self::new(16)
    }
}

impl fmt::Debug for AdapterStateBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterStateBus")
            .field("current", &self.current())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
