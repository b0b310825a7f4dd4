//! Long-range radio transport.
//!
//! The radio modem (LoRa-class, serial attached) is a transparent byte pipe
//! with small frames and high latency. Packets are fragmented into frames of
//! at most `frame_size` bytes; the frames of one packet are written back to
//! back, so only one packet is ever in flight on the link.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

use crate::config::TransportSettings;
use crate::error::{Error, RadioError, Result};
use crate::transport::framing::{self, FrameDecoder, Reassembler, MAX_FRAGMENTS};
use crate::transport::Transport;
use crate::types::TransportKind;

/// Opens the byte stream behind a radio port.
pub trait LinkOpener: Send {
    type Link: AsyncRead + AsyncWrite + Unpin + Send;

    fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
    ) -> impl Future<Output = io::Result<Self::Link>> + Send;
}

/// A serial device node such as `/dev/ttyUSB0`, opened 8N1 at the configured baud rate.
///
/// Reads and writes are non-blocking on the port itself, so a pending read
/// never holds up a write.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialDevice;

impl LinkOpener for SerialDevice {
    type Link = SerialStream;

    async fn open(&mut self, port: &str, baud_rate: u32) -> io::Result<Self::Link> {
        debug!(port, baud_rate, "Opening serial device.");
        tokio_serial::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)
    }
}

pub struct RadioTransport<O: LinkOpener> {
    opener: O,
    link: Option<O::Link>,
    port: String,
    baud_rate: u32,
    frame_size: usize,
    node_id: u8,
    next_seq: u16,
    decoder: FrameDecoder,
    reassembler: Reassembler,
    inbox: VecDeque<Vec<u8>>,
    corrupt_frames: u64,
}

impl<O: LinkOpener> RadioTransport<O> {
    pub fn new(settings: &TransportSettings, opener: O) -> Result<Self> {
        let TransportSettings::Radio {
            port,
            baud_rate,
            frame_size,
            reassembly_timeout_secs,
            node_id,
        } = settings
        else {
            return Err(Error::Validation("radio transport needs radio settings".into()));
        };
        let capacity = framing::payload_capacity(*frame_size)
            .map_err(|e| Error::Validation(e.to_string()))?;

        Ok(RadioTransport {
            opener,
            link: None,
            port: port.clone(),
            baud_rate: *baud_rate,
            frame_size: *frame_size,
            node_id: *node_id,
            next_seq: 0,
            decoder: FrameDecoder::new(capacity),
            reassembler: Reassembler::new(Duration::from_secs(*reassembly_timeout_secs)),
            inbox: VecDeque::new(),
            corrupt_frames: 0,
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Frames dropped for bad length, marker, or checksum since creation.
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.decoder.reset();
        self.reassembler.clear();
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let now = Instant::now();
        for &byte in bytes {
            match self.decoder.feed(byte) {
                Ok(Some(frame)) => {
                    if let Some(message) = self.reassembler.push(frame, now) {
                        self.inbox.push_back(message);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.corrupt_frames += 1;
                    debug!(error = %e, port = %self.port, "Dropped radio frame.");
                }
            }
        }
        for expired in self.reassembler.expire(now) {
            warn!(error = %expired, port = %self.port, "Discarded incomplete radio message.");
        }
    }

    /// Reads until a whole message is available or `wait` has elapsed.
    async fn read_until(&mut self, wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = [0u8; 256];
        while self.inbox.is_empty() {
            let link = self.link.as_mut().ok_or(Error::NotConnected)?;
            // A zero wait still polls the read once, which gives non-blocking semantics.
            let read = tokio::time::timeout_at(deadline, link.read(&mut buf)).await;
            match read {
                Err(_elapsed) => break,
                Ok(Ok(0)) => {
                    self.drop_link();
                    return Err(RadioError::LinkClosed.into());
                }
                Ok(Ok(n)) => self.ingest(&buf[..n]),
                Ok(Err(e)) => {
                    self.drop_link();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl<O: LinkOpener> Transport for RadioTransport<O> {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn max_message_size(&self) -> Option<usize> {
        framing::payload_capacity(self.frame_size)
            .ok()
            .map(|capacity| capacity * MAX_FRAGMENTS)
    }

    async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        match self.opener.open(&self.port, self.baud_rate).await {
            Ok(link) => {
                info!(port = %self.port, baud_rate = self.baud_rate, "Radio link open.");
                self.link = Some(link);
                Ok(())
            }
            Err(source) => Err(Error::LinkUnavailable {
                port: self.port.clone(),
                source,
            }),
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.link.is_none() {
            return Err(Error::NotConnected);
        }

        let msg_seq = self.next_seq;
        let frames = framing::fragment(self.node_id, msg_seq, payload, self.frame_size)?;
        self.next_seq = self.next_seq.wrapping_add(1);

        let link = self.link.as_mut().ok_or(Error::NotConnected)?;
        let mut written = Ok(());
        for frame in &frames {
            written = link.write_all(frame).await;
            if written.is_err() {
                break;
            }
        }
        if written.is_ok() {
            written = link.flush().await;
        }
        if let Err(e) = written {
            self.drop_link();
            return Err(e.into());
        }

        debug!(msg_seq, frames = frames.len(), bytes = payload.len(), "Radio packet sent.");
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(Some(message));
        }
        self.read_until(Duration::ZERO).await?;
        Ok(self.inbox.pop_front())
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(Some(message));
        }
        self.read_until(timeout).await?;
        Ok(self.inbox.pop_front())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.shutdown().await {
                debug!(error = %e, port = %self.port, "Radio link shutdown reported an error.");
            }
            info!(port = %self.port, "Radio link closed.");
        }
        self.drop_link();
        self.inbox.clear();
        Ok(())
    }
}
