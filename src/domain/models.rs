use crate::domain::device_state::AncLevel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Radio-level link status reported by the OS Bluetooth stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Identity a client is bound to for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
    /// Bluetooth address (48 bits in the low end of the u64)
    pub address: u64,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address,
        }
    }
}

/// Read-only copy of a device's state handed to collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub address: u64,
    pub status: ConnectionStatus,
    pub connected: bool,
    pub soft_connected: bool,
    pub anc_level: Option<AncLevel>,
    pub battery_level: Option<u8>,
}

/// Battery notification for threshold handling in the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryUpdate {
    pub device_id: String,
    pub percentage: u8,
}

/// Severity of a user-facing alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Warning,
    Error,
}

/// Format a Bluetooth address as `AA:BB:CC:DD:EE:FF`
pub fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse `AA:BB:CC:DD:EE:FF` (or a bare hex number) into an address
pub fn parse_address(text: &str) -> anyhow::Result<u64> {
    let hex: String = text.trim().trim_start_matches("0x").replace([':', '-'], "");

    if hex.is_empty() || hex.len() > 12 {
        anyhow::bail!("Invalid Bluetooth address: {}", text);
    }

    Ok(u64::from_str_radix(&hex, 16)?)
}
