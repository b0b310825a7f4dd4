//! Device-side SDK for the C3 fleet backend.
//!
//! A [`Client`] registers a device, streams telemetry, raises alerts, and
//! receives commands over either a direct network link or a long-range radio
//! link, behind one API.

pub mod client;
pub mod config;
pub mod error;
pub mod spool;
pub mod time;
pub mod transport;
pub mod types;

pub use client::{Client, SendOptions, TelemetryStream};
pub use config::{ClientSettings, DeviceConfiguration, TransportSettings};
pub use error::{Error, ErrorKind, RadioError, Result};
pub use transport::{AnyTransport, Transport};
pub use types::{
    Alert, AlertLevel, ClientEvent, CommandMessage, ConnectionState, DeliveryReport,
    DeliveryStatus, Location, Readings, RegistrationAck, TransportKind,
};
