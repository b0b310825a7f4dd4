//! Transport abstraction for the device client.
//!
//! Every link offers the same capability set (connect, send, receive,
//! disconnect) over serialized packets. The client holds exactly one
//! transport and never branches on which kind it is except for reporting.

use std::future::Future;
use std::time::Duration;

use crate::config::{ClientSettings, TransportSettings};
use crate::error::Result;
use crate::types::TransportKind;

pub mod direct;
pub mod framing;
pub mod radio;

pub use direct::DirectTransport;
pub use radio::{LinkOpener, RadioTransport, SerialDevice};

pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn is_connected(&self) -> bool;

    /// Largest serialized packet the link can carry, if it has a limit.
    fn max_message_size(&self) -> Option<usize> {
        None
    }

    /// Opens the link. Calling it while connected is a no-op.
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Transmits one packet. Fails with `NotConnected` if the link is down.
    fn send(&mut self, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Returns the next inbound packet if one is already pending, without waiting.
    fn receive(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Waits up to `timeout` for the next inbound packet.
    fn receive_timeout(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Closes the link. Idempotent.
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// The transports a client can be configured with.
pub enum AnyTransport {
    Direct(DirectTransport),
    Radio(RadioTransport<SerialDevice>),
}

impl AnyTransport {
    pub fn from_settings(settings: &ClientSettings, device_id: &str) -> Result<Self> {
        Ok(match &settings.transport {
            TransportSettings::Direct { .. } => {
                AnyTransport::Direct(DirectTransport::new(&settings.transport, device_id)?)
            }
            TransportSettings::Radio { .. } => {
                AnyTransport::Radio(RadioTransport::new(&settings.transport, SerialDevice)?)
            }
        })
    }
}

impl Transport for AnyTransport {
    fn kind(&self) -> TransportKind {
        match self {
            AnyTransport::Direct(t) => t.kind(),
            AnyTransport::Radio(t) => t.kind(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            AnyTransport::Direct(t) => t.is_connected(),
            AnyTransport::Radio(t) => t.is_connected(),
        }
    }

    fn max_message_size(&self) -> Option<usize> {
        match self {
            AnyTransport::Direct(t) => t.max_message_size(),
            AnyTransport::Radio(t) => t.max_message_size(),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        match self {
            AnyTransport::Direct(t) => t.connect().await,
            AnyTransport::Radio(t) => t.connect().await,
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        match self {
            AnyTransport::Direct(t) => t.send(payload).await,
            AnyTransport::Radio(t) => t.send(payload).await,
        }
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            AnyTransport::Direct(t) => t.receive().await,
            AnyTransport::Radio(t) => t.receive().await,
        }
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self {
            AnyTransport::Direct(t) => t.receive_timeout(timeout).await,
            AnyTransport::Radio(t) => t.receive_timeout(timeout).await,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self {
            AnyTransport::Direct(t) => t.disconnect().await,
            AnyTransport::Radio(t) => t.disconnect().await,
        }
    }
}
