//! Observed headset state and ANC level translation.
//!
//! Logical levels (what callers see): 0 = off, 1 = low, 2 = high.
//! Wire levels (what the headset speaks): 0 = off, 1 = high, 3 = low.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Default marker for the low-battery notification threshold
pub const LOW_BATTERY_MARKER_DEFAULT: u8 = 100;

/// Noise cancellation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AncLevel {
    Off,
    Low,
    High,
}

impl AncLevel {
    pub fn from_logical(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Self::Off),
            1 => Ok(Self::Low),
            2 => Ok(Self::High),
            other => Err(ProtocolError::InvalidAncLevel(other)),
        }
    }

    pub fn logical(&self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Low => 1,
            Self::High => 2,
        }
    }

    pub fn to_wire(&self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Low => 3,
            Self::High => 1,
        }
    }

    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Off),
            3 => Ok(Self::Low),
            1 => Ok(Self::High),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "undefined ANC wire level {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AncLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Low => write!(f, "low"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for AncLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Ok(Self::Off),
            "low" | "1" => Ok(Self::Low),
            "high" | "2" => Ok(Self::High),
            other => Err(format!("unknown ANC level '{}'", other)),
        }
    }
}

/// Values the headset has reported during the current lifetime of a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub soft_connected: bool,
    pub anc_level: Option<AncLevel>,
    pub battery_level: Option<u8>,
    pub low_battery_notified: u8,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            soft_connected: false,
            anc_level: None,
            battery_level: None,
            low_battery_notified: LOW_BATTERY_MARKER_DEFAULT,
        }
    }
}

impl DeviceState {
    /// Apply an ANC status payload: `[wire_level, reserved]`.
    ///
    /// Any failure leaves the level unknown.
    pub fn apply_anc_report(&mut self, payload: &[u8]) -> Result<AncLevel> {
        if payload.len() != 2 {
            self.anc_level = None;
            return Err(ProtocolError::ProtocolViolation(format!(
                "ANC payload must be 2 bytes, got {}",
                payload.len()
            )));
        }

        match AncLevel::from_wire(payload[0]) {
            Ok(level) => {
                self.anc_level = Some(level);
                Ok(level)
            }
            Err(e) => {
                self.anc_level = None;
                Err(e)
            }
        }
    }

    /// Apply a battery payload: `[percentage]`.
    ///
    /// A rejected report keeps the previously observed value.
    pub fn apply_battery_report(&mut self, payload: &[u8]) -> Result<u8> {
        let [level] = payload else {
            return Err(ProtocolError::ProtocolViolation(format!(
                "battery payload must be 1 byte, got {}",
                payload.len()
            )));
        };

        if *level > 100 {
            return Err(ProtocolError::ProtocolViolation(format!(
                "battery level {} out of range",
                level
            )));
        }

        self.battery_level = Some(*level);
        Ok(*level)
    }

    /// Session teardown: ANC and battery values survive
    pub fn reset_session(&mut self) {
        self.soft_connected = false;
        self.low_battery_notified = LOW_BATTERY_MARKER_DEFAULT;
    }
}
