/// GATT addressing for device tunnels
///
/// Every supported device exposes one vendor service with a write
/// characteristic ("send tunnel") and a notify characteristic ("recv tunnel").
/// Notifications are enabled through the standard client characteristic
/// configuration descriptor.

use std::fmt;
use uuid::Uuid;

/// Vendor service UUID (0xFFF0)
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_FFF0_0000_1000_8000_00805F9B34FB);

/// Send tunnel characteristic UUID (0xFFF6)
pub const DEFAULT_SEND_UUID: Uuid = Uuid::from_u128(0x0000_FFF6_0000_1000_8000_00805F9B34FB);

/// Recv tunnel characteristic UUID (0xFFF7)
pub const DEFAULT_RECV_UUID: Uuid = Uuid::from_u128(0x0000_FFF7_0000_1000_8000_00805F9B34FB);

/// Client characteristic configuration descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805F9B34FB);

/// Characteristic roles used by a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattCharacteristic {
    /// Host writes commands here
    Send,
    /// Device notifies responses and telemetry here
    Recv,
}

impl GattCharacteristic {
    /// Get the 16-bit short form of the default characteristic UUID
    pub fn short_uuid(&self) -> u16 {
        match self {
            GattCharacteristic::Send => 0xFFF6,
            GattCharacteristic::Recv => 0xFFF7,
        }
    }
}

/// The identifiers a codec uses to reach its device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTunnels {
    pub service: Uuid,
    pub send: Uuid,
    pub recv: Uuid,
    pub descriptor: Uuid,
}

impl GattTunnels {
    pub const fn new(service: Uuid, send: Uuid, recv: Uuid) -> Self {
        Self {
            service,
            send,
            recv,
            descriptor: CCCD_UUID,
        }
    }

    /// Look up the UUID for a characteristic role
    pub fn characteristic(&self, role: GattCharacteristic) -> Uuid {
        match role {
            GattCharacteristic::Send => self.send,
            GattCharacteristic::Recv => self.recv,
        }
    }
}

impl Default for GattTunnels {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_UUID, DEFAULT_SEND_UUID, DEFAULT_RECV_UUID)
    }
}

impl fmt::Display for GattTunnels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {} (send {}, recv {})", self.service, self.send, self.recv)
    }
}

/// Expand a 16-bit assigned number onto the Bluetooth base UUID
pub const fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805F9B34FB)
}
