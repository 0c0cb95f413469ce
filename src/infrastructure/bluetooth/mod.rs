//! Bluetooth Module
//!
//! RFCOMM protocol client for the headset.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceRegistry                       │
//! │        (one ProtocolClient per discovered device)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ProtocolClient                       │
//! │   connect / disconnect / set ANC / events / snapshot     │
//! └───────┬──────────────┬──────────────┬───────────────────┘
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌─────────────┐ ┌────────────┐ ┌────────────┐
//! │ CommandGate │ │  ReadLoop  │ │ Connection │
//! │ - debounce  │ │ - polling  │ │ - RFCOMM   │
//! │ - coalesce  │ │ - resync   │ │   streams  │
//! └──────┬──────┘ └─────┬──────┘ └────────────┘
//!        ▼              │
//! ┌─────────────┐       │        ┌────────────┐
//! │ FrameWriter │       └──────► │  Protocol  │
//! └─────────────┘                │ - framing  │
//!                                └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Opcodes, message prefixes, frame encoding and classification
//! - [`connection`] - Endpoints and connectors producing duplex streams
//! - [`writer`] - Dedicated task serialising frames onto the stream
//! - [`gate`] - Command debouncing and coalescing
//! - [`reader`] - Periodic inbound frame reader
//! - [`client`] - Per-device protocol client
//! - [`registry`] - Owner of all clients

pub mod client;
pub mod connection;
pub mod gate;
pub mod protocol;
pub mod reader;
pub mod registry;
pub mod writer;

pub use client::{ClientConfig, ProtocolClient};
pub use registry::DeviceRegistry;
