/// Known device table
///
/// Maps the advertised BLE name to a device kind and the codec that speaks
/// its protocol.

use std::fmt;
use std::sync::Arc;

use crate::codec::{BloodPressureCodec, GlucoseMeterCodec, ProtocolCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    WeiCeGlucoseMeter,
    AojBloodPressure,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 2] = [DeviceKind::WeiCeGlucoseMeter, DeviceKind::AojBloodPressure];

    /// Look up a device by its advertised name
    pub fn from_ble_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|kind| kind.ble_name() == name)
    }

    pub fn ble_name(&self) -> &'static str {
        match self {
            DeviceKind::WeiCeGlucoseMeter => "SKG_VGM55",
            DeviceKind::AojBloodPressure => "SKG_AOJ-30B",
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            DeviceKind::WeiCeGlucoseMeter => "BK3805",
            DeviceKind::AojBloodPressure => "BK8703",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DeviceKind::WeiCeGlucoseMeter => "Wei Ce glucose meter",
            DeviceKind::AojBloodPressure => "AOJ blood pressure monitor",
        }
    }

    /// A fresh codec for this device's protocol
    pub fn codec(&self) -> Arc<dyn ProtocolCodec> {
        match self {
            DeviceKind::WeiCeGlucoseMeter => Arc::new(GlucoseMeterCodec::new()),
            DeviceKind::AojBloodPressure => Arc::new(BloodPressureCodec::new()),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.model())
    }
}

/// True if `name` belongs to a supported device
pub fn is_known_device(name: &str) -> bool {
    DeviceKind::from_ble_name(name).is_some()
}
