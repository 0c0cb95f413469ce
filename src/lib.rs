//! Control a noise-cancelling headset over its RFCOMM serial channel.
//!
//! - [`domain`] - device state, ANC level translation, settings
//! - [`infrastructure`] - protocol client, transport, logging

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::device_state::AncLevel;
pub use domain::models::{BatteryUpdate, ConnectionStatus, DeviceIdentity, DeviceSnapshot, LinkStatus};
pub use error::{ProtocolError, Result};
pub use infrastructure::bluetooth::protocol::{Command, Message};
pub use infrastructure::bluetooth::{ClientConfig, DeviceRegistry, ProtocolClient};
