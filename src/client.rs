//! The device client: one integration point for registration, telemetry,
//! alerts, and commands, whichever transport carries them.
//!
//! A client is driven by a single task. Outgoing packets pass through an
//! outbox where alerts sit ahead of telemetry; telemetry is bounded and sheds
//! its oldest entries under backpressure, alerts are retried until
//! acknowledged. Inbound traffic (acknowledgments, commands) is drained after
//! every send and on [`Client::poll`].

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ClientSettings, DeviceConfiguration};
use crate::error::{Error, ErrorKind, RadioError, Result};
use crate::spool::Spool;
use crate::transport::framing::MAX_FRAGMENTS;
use crate::transport::{AnyTransport, Transport};
use crate::types::{
    Ack, AckStatus, Alert, AlertMessage, ClientEvent, CommandMessage, ConnectionState,
    DeliveryReport, DeliveryStatus, Envelope, Location, Packet, Readings, RegistrationAck,
    TelemetryMessage, TransportKind,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const SEEN_COMMANDS: usize = 128;
const MAX_STORED_ACKS: usize = 256;

pub type CommandHandler = Box<dyn Fn(&CommandMessage) + Send + Sync>;

/// Per-call delivery options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Overall deadline. When it passes the outcome is reported as
    /// [`DeliveryStatus::Unknown`] rather than success or failure.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        SendOptions {
            timeout: Some(timeout),
        }
    }
}

#[derive(Debug, Clone)]
struct Outgoing {
    id: u32,
    bytes: Vec<u8>,
    /// Rejections seen while at the head of the outbox.
    failures: u32,
}

impl Outgoing {
    fn new(id: u32, bytes: Vec<u8>) -> Self {
        Outgoing {
            id,
            bytes,
            failures: 0,
        }
    }
}

#[derive(Debug)]
struct Outbox {
    alerts: VecDeque<Outgoing>,
    telemetry: VecDeque<Outgoing>,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Outbox {
            alerts: VecDeque::new(),
            telemetry: VecDeque::new(),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.alerts.len() + self.telemetry.len()
    }

    fn is_empty(&self) -> bool {
        self.alerts.is_empty() && self.telemetry.is_empty()
    }

    fn contains(&self, id: u32) -> bool {
        self.alerts.iter().chain(self.telemetry.iter()).any(|o| o.id == id)
    }

    fn push_alert(&mut self, outgoing: Outgoing) {
        if !self.alerts.iter().any(|o| o.id == outgoing.id) {
            self.alerts.push_back(outgoing);
        }
    }

    /// Queues telemetry and returns how many of the oldest entries were shed.
    fn push_telemetry(&mut self, outgoing: Outgoing) -> usize {
        self.telemetry.push_back(outgoing);
        self.shed()
    }

    /// Puts previously queued telemetry back in front of anything newer.
    fn restore_telemetry(&mut self, restored: Vec<Outgoing>) -> usize {
        for outgoing in restored.into_iter().rev() {
            self.telemetry.push_front(outgoing);
        }
        self.shed()
    }

    fn shed(&mut self) -> usize {
        let mut dropped = 0;
        while self.telemetry.len() > self.capacity {
            self.telemetry.pop_front();
            dropped += 1;
        }
        dropped
    }

    fn front(&self) -> Option<&Outgoing> {
        self.alerts.front().or_else(|| self.telemetry.front())
    }

    fn pop_front(&mut self) {
        if self.alerts.pop_front().is_none() {
            self.telemetry.pop_front();
        }
    }

    /// Records a non-link failure of the head packet. Telemetry is dropped at
    /// once; an alert stays queued until it has failed `max_failures` times,
    /// and is then removed and returned.
    fn fail_front(&mut self, max_failures: u32) -> Option<Outgoing> {
        match self.alerts.front_mut() {
            Some(alert) => {
                alert.failures += 1;
                if alert.failures >= max_failures {
                    self.alerts.pop_front()
                } else {
                    None
                }
            }
            None => {
                self.telemetry.pop_front();
                None
            }
        }
    }

    fn remove(&mut self, id: u32) {
        self.alerts.retain(|o| o.id != id);
        self.telemetry.retain(|o| o.id != id);
    }

    fn take_telemetry(&mut self) -> Vec<Outgoing> {
        self.telemetry.drain(..).collect()
    }
}

pub struct Client<T: Transport = AnyTransport> {
    config: DeviceConfiguration,
    settings: ClientSettings,
    transport: T,
    state: ConnectionState,
    location: Location,
    next_message_id: u32,
    next_sequence: u32,
    next_stream_id: u32,
    alert_attempts: u32,
    outbox: Outbox,
    acks: BTreeMap<u32, Ack>,
    seen_commands: VecDeque<String>,
    handlers: Vec<CommandHandler>,
    commands: broadcast::Sender<CommandMessage>,
    events: broadcast::Sender<ClientEvent>,
    spool: Option<Spool>,
}

impl Client<AnyTransport> {
    /// Builds a client with the transport named in `settings`.
    pub fn new(config: DeviceConfiguration, settings: ClientSettings) -> Result<Self> {
        let transport = AnyTransport::from_settings(&settings, config.device_id())?;
        Self::with_transport(config, settings, transport)
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(
        config: DeviceConfiguration,
        settings: ClientSettings,
        transport: T,
    ) -> Result<Self> {
        if settings.outbox_capacity == 0 {
            return Err(Error::Validation("outbox capacity must be at least 1".into()));
        }
        if settings.max_alert_retries == 0 {
            return Err(Error::Validation("alerts need at least one attempt".into()));
        }
        let spool = settings.spool_path.as_ref().map(Spool::open).transpose()?;

        let (commands, _) = broadcast::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Client {
            location: config.location(),
            outbox: Outbox::new(settings.outbox_capacity),
            config,
            settings,
            transport,
            state: ConnectionState::Uninitialized,
            next_message_id: rand::random(),
            next_sequence: 0,
            next_stream_id: 1,
            alert_attempts: 0,
            acks: BTreeMap::new(),
            seen_commands: VecDeque::new(),
            handlers: Vec::new(),
            commands,
            events,
            spool,
        })
    }

    pub fn config(&self) -> &DeviceConfiguration {
        &self.config
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_connected()
    }

    /// Position stamped on telemetry from now on. The configuration keeps its nominal location.
    pub fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Packets waiting in the outbox.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Every subscriber sees each command once, no matter how often the backend resends it.
    pub fn subscribe_commands(&self) -> broadcast::Receiver<CommandMessage> {
        self.commands.subscribe()
    }

    pub fn on_command<F>(&mut self, handler: F)
    where
        F: Fn(&CommandMessage) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!(device_id = %self.config.device_id(), "Already connected.");
            return Ok(());
        }

        let kind = self.transport.kind();
        self.state = ConnectionState::Connecting;
        if let Err(e) = self.transport.connect().await {
            self.state = ConnectionState::Disconnected;
            warn!(device_id = %self.config.device_id(), transport = %kind, error = %e, "Connect failed.");
            return Err(e.context("connect", kind));
        }

        self.state = ConnectionState::Connected;
        info!(device_id = %self.config.device_id(), transport = %kind, "Connected.");
        self.emit(ClientEvent::Connected { transport: kind });

        self.restore_spooled();
        if !self.outbox.is_empty() {
            if let Err(e) = self.flush().await {
                warn!(error = %e, queued = self.outbox.len(), "Could not flush queued packets after connect.");
            }
        }
        Ok(())
    }

    /// Connects, retrying with exponential backoff up to `reconnect_attempts` times.
    pub async fn connect_with_backoff(&mut self) -> Result<()> {
        let attempts = self.settings.reconnect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts || e.kind() == ErrorKind::Validation => {
                    return Err(e)
                }
                Err(e) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Reconnecting.");
                    self.emit(ClientEvent::Reconnecting { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        let was_connected = self.state == ConnectionState::Connected;
        let kind = self.transport.kind();
        let result = self.transport.disconnect().await;
        self.state = ConnectionState::Disconnected;
        if was_connected {
            info!(device_id = %self.config.device_id(), transport = %kind, "Disconnected.");
            self.emit(ClientEvent::Disconnected {
                reason: "requested".to_string(),
            });
        }
        result.map_err(|e| e.context("disconnect", kind))
    }

    /// Announces this device to the backend and waits for its verdict.
    pub async fn register_device(&mut self) -> Result<RegistrationAck> {
        if !self.is_connected() {
            return Err(Error::Registration("not connected".into()));
        }
        let kind = self.transport.kind();
        let request = self.config.registration_request();
        let outgoing = self
            .prepare(Envelope::Register(request))
            .map_err(|e| e.context("register_device", kind))?;
        let id = outgoing.id;

        self.transmit(&outgoing.bytes)
            .await
            .map_err(|e| e.context("register_device", kind))?;
        info!(device_id = %self.config.device_id(), message_id = id, "Registration sent.");

        let ack_timeout = self.settings.ack_timeout();
        let ack = self
            .wait_for_ack(id, ack_timeout)
            .await
            .map_err(|e| e.context("register_device", kind))?;
        match ack {
            Some(Ack {
                status: AckStatus::Accepted,
                detail,
                ..
            }) => {
                info!(device_id = %self.config.device_id(), "Registration accepted.");
                Ok(RegistrationAck {
                    device_id: self.config.device_id().to_string(),
                    status: AckStatus::Accepted,
                    detail,
                })
            }
            Some(Ack { detail, .. }) => Err(Error::Registration(
                detail.unwrap_or_else(|| "rejected by backend".to_string()),
            )),
            None => Err(Error::Registration(format!(
                "no acknowledgment within {}s",
                ack_timeout.as_secs()
            ))),
        }
    }

    pub async fn send_telemetry(&mut self, readings: Readings) -> Result<DeliveryReport> {
        self.submit_telemetry(readings, None, SendOptions::default())
            .await
    }

    pub async fn send_telemetry_with(
        &mut self,
        readings: Readings,
        options: SendOptions,
    ) -> Result<DeliveryReport> {
        self.submit_telemetry(readings, None, options).await
    }

    pub async fn send_alert(&mut self, alert: Alert) -> Result<DeliveryReport> {
        self.send_alert_with(alert, SendOptions::default()).await
    }

    /// Sends an alert and waits for its acknowledgment, retrying up to
    /// `max_alert_retries` attempts before giving up with `DeliveryFailed`.
    pub async fn send_alert_with(
        &mut self,
        alert: Alert,
        options: SendOptions,
    ) -> Result<DeliveryReport> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let kind = self.transport.kind();
        let message = AlertMessage {
            level: alert.level,
            device_id: self.config.device_id().to_string(),
            description: alert.description,
            timestamp: Utc::now(),
        };
        let outgoing = self
            .prepare(Envelope::Alert(message))
            .map_err(|e| e.context("send_alert", kind))?;
        let id = outgoing.id;
        self.alert_attempts = 0;

        match within(options.timeout, self.deliver_alert(outgoing.clone())).await {
            Some(result) => result.map_err(|e| e.context("send_alert", kind)),
            None => {
                // Unknown outcome: keep it queued. A duplicate is better than a lost alert.
                if !self.acks.contains_key(&id) {
                    self.outbox.push_alert(outgoing);
                }
                warn!(message_id = id, attempts = self.alert_attempts, "Alert outcome unknown at deadline.");
                Ok(DeliveryReport {
                    message_id: id,
                    transport: kind,
                    status: DeliveryStatus::Unknown,
                    attempts: self.alert_attempts,
                })
            }
        }
    }

    /// Sends a device-originated command and waits for the backend to acknowledge it.
    pub async fn send_command(&mut self, command: CommandMessage) -> Result<DeliveryReport> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let kind = self.transport.kind();
        let outgoing = self
            .prepare(Envelope::Command(command))
            .map_err(|e| e.context("send_command", kind))?;
        let id = outgoing.id;

        self.transmit(&outgoing.bytes)
            .await
            .map_err(|e| e.context("send_command", kind))?;
        let ack = self
            .wait_for_ack(id, self.settings.ack_timeout())
            .await
            .map_err(|e| e.context("send_command", kind))?;

        let status = match ack {
            Some(Ack {
                status: AckStatus::Accepted,
                ..
            }) => DeliveryStatus::Delivered,
            Some(Ack { detail, .. }) => {
                return Err(Error::Rejected {
                    message_id: id,
                    reason: detail.unwrap_or_else(|| "rejected".to_string()),
                })
            }
            None => DeliveryStatus::Unknown,
        };
        Ok(DeliveryReport {
            message_id: id,
            transport: kind,
            status,
            attempts: 1,
        })
    }

    /// Opens a telemetry stream that reuses this client's connection.
    pub fn create_stream(&mut self) -> Result<TelemetryStream<'_, T>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        debug!(stream_id, "Telemetry stream opened.");
        Ok(TelemetryStream {
            client: self,
            stream_id,
            sent: 0,
        })
    }

    /// Waits up to `timeout` for inbound traffic and handles everything pending.
    /// Returns the number of inbound packets processed.
    pub async fn poll(&mut self, timeout: Duration) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let kind = self.transport.kind();
        let mut handled = 0;

        let mut next = self.transport.receive_timeout(timeout).await;
        loop {
            match next {
                Ok(Some(bytes)) => {
                    self.handle_inbound(&bytes).await;
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    if e.is_link_failure() {
                        self.mark_link_lost(&e).await;
                    }
                    return Err(e.context("poll", kind));
                }
            }
            if !self.transport.is_connected() {
                break;
            }
            next = self.transport.receive().await;
        }
        Ok(handled)
    }

    async fn submit_telemetry(
        &mut self,
        readings: Readings,
        stream_id: Option<u32>,
        options: SendOptions,
    ) -> Result<DeliveryReport> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let kind = self.transport.kind();
        let message = TelemetryMessage {
            timestamp: Utc::now(),
            device_id: self.config.device_id().to_string(),
            sequence_number: self.next_sequence,
            stream_id,
            readings,
            location: self.location,
        };
        let outgoing = self
            .prepare(Envelope::Telemetry(message))
            .map_err(|e| e.context("send_telemetry", kind))?;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let id = outgoing.id;

        let dropped = self.outbox.push_telemetry(outgoing);
        if dropped > 0 {
            warn!(dropped, "Outbox full, shed oldest telemetry.");
            self.emit(ClientEvent::TelemetryDropped { count: dropped });
        }

        let status = match within(options.timeout, self.deliver_queued()).await {
            None => DeliveryStatus::Unknown,
            Some(Err(e)) => return Err(e.context("send_telemetry", kind)),
            Some(Ok(())) if self.outbox.contains(id) || !self.is_connected() => {
                DeliveryStatus::Queued
            }
            Some(Ok(())) => DeliveryStatus::Sent,
        };
        debug!(message_id = id, transport = %kind, ?status, "Telemetry submitted.");
        Ok(DeliveryReport {
            message_id: id,
            transport: kind,
            status,
            attempts: 1,
        })
    }

    /// Flushes the outbox, reconnecting once if the link drops. Telemetry that
    /// still cannot go out stays queued (and spilled to the spool if there is one).
    async fn deliver_queued(&mut self) -> Result<()> {
        match self.flush().await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_link_failure() => return Err(e),
            Err(_) => {}
        }
        if self.recover().await {
            match self.flush().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_link_failure() && e.kind() != ErrorKind::NotConnected => {
                    return Err(e)
                }
                Err(_) => {}
            }
        }
        self.spill_telemetry();
        Ok(())
    }

    async fn deliver_alert(&mut self, outgoing: Outgoing) -> Result<DeliveryReport> {
        let id = outgoing.id;
        let kind = self.transport.kind();
        let max_attempts = self.settings.max_alert_retries;
        let ack_timeout = self.settings.ack_timeout();

        for attempt in 1..=max_attempts {
            self.alert_attempts = attempt;
            // Queued before any reconnect so the flush after connect sends it ahead of telemetry.
            self.outbox.push_alert(outgoing.clone());
            if !self.is_connected() && !self.recover().await {
                warn!(message_id = id, attempt, "Alert waiting for the link to return.");
                continue;
            }
            if let Err(e) = self.flush().await {
                warn!(message_id = id, attempt, error = %e, "Alert transmission failed.");
                continue;
            }

            match self.wait_for_ack(id, ack_timeout).await {
                Ok(Some(Ack {
                    status: AckStatus::Accepted,
                    ..
                })) => {
                    info!(message_id = id, attempt, transport = %kind, "Alert acknowledged.");
                    return Ok(DeliveryReport {
                        message_id: id,
                        transport: kind,
                        status: DeliveryStatus::Delivered,
                        attempts: attempt,
                    });
                }
                Ok(Some(Ack { detail, .. })) => {
                    return Err(Error::Rejected {
                        message_id: id,
                        reason: detail.unwrap_or_else(|| "rejected".to_string()),
                    });
                }
                Ok(None) => {
                    warn!(message_id = id, attempt, "No acknowledgment for alert.");
                }
                Err(e) => {
                    warn!(message_id = id, attempt, error = %e, "Waiting for alert acknowledgment failed.");
                }
            }
        }

        self.outbox.remove(id);
        error!(message_id = id, attempts = max_attempts, "Alert delivery failed.");
        Err(Error::DeliveryFailed {
            message_id: id,
            attempts: max_attempts,
        })
    }

    /// Sends queued packets in priority order, then drains inbound traffic.
    async fn flush(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        while let Some(outgoing) = self.outbox.front() {
            let bytes = outgoing.bytes.clone();
            match self.transmit(&bytes).await {
                Ok(()) => self.outbox.pop_front(),
                // Still queued; the caller decides whether to reconnect.
                Err(e) if e.is_link_failure() => return Err(e),
                Err(e) => {
                    let max_failures = self.settings.max_alert_retries;
                    if let Some(alert) = self.outbox.fail_front(max_failures) {
                        error!(message_id = alert.id, attempts = alert.failures, error = %e, "Queued alert abandoned.");
                        self.emit(ClientEvent::AlertAbandoned {
                            message_id: alert.id,
                            attempts: alert.failures,
                        });
                    }
                    return Err(e);
                }
            }
        }
        self.drain_inbound().await;
        Ok(())
    }

    async fn transmit(&mut self, bytes: &[u8]) -> Result<()> {
        match self.transport.send(bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_link_failure() {
                    self.mark_link_lost(&e).await;
                }
                Err(e)
            }
        }
    }

    async fn wait_for_ack(&mut self, id: u32, timeout: Duration) -> Result<Option<Ack>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ack) = self.acks.remove(&id) {
                return Ok(Some(ack));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.transport.receive_timeout(remaining).await {
                Ok(Some(bytes)) => self.handle_inbound(&bytes).await,
                Ok(None) => {}
                Err(e) => {
                    if e.is_link_failure() {
                        self.mark_link_lost(&e).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn drain_inbound(&mut self) {
        loop {
            match self.transport.receive().await {
                Ok(Some(bytes)) => self.handle_inbound(&bytes).await,
                Ok(None) => break,
                Err(e) => {
                    if e.is_link_failure() {
                        self.mark_link_lost(&e).await;
                    }
                    debug!(error = %e, "Stopped draining inbound traffic.");
                    break;
                }
            }
        }
    }

    async fn handle_inbound(&mut self, bytes: &[u8]) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, bytes = bytes.len(), "Dropping undecodable inbound packet.");
                return;
            }
        };
        if packet.device_id != self.config.device_id() {
            debug!(to = %packet.device_id, "Ignoring packet addressed to another device.");
            return;
        }

        match packet.body {
            Envelope::Ack(ack) => {
                debug!(ack_id = ack.ack_id, status = ?ack.status, "Acknowledgment received.");
                self.acks.insert(ack.ack_id, ack);
                while self.acks.len() > MAX_STORED_ACKS {
                    self.acks.pop_first();
                }
            }
            Envelope::Command(command) => self.dispatch_command(packet.id, command).await,
            other => debug!(kind = other.label(), "Ignoring unexpected inbound packet."),
        }
    }

    async fn dispatch_command(&mut self, packet_id: u32, command: CommandMessage) {
        // Every copy is acknowledged; the backend resends until it sees one.
        match self.prepare(Envelope::Ack(Ack {
            ack_id: packet_id,
            status: AckStatus::Accepted,
            detail: None,
        })) {
            Ok(ack) => {
                if let Err(e) = self.transmit(&ack.bytes).await {
                    warn!(command_id = %command.command_id, error = %e, "Failed to acknowledge command.");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode command acknowledgment."),
        }

        if self.seen_commands.contains(&command.command_id) {
            debug!(command_id = %command.command_id, "Duplicate command suppressed.");
            return;
        }
        self.seen_commands.push_back(command.command_id.clone());
        if self.seen_commands.len() > SEEN_COMMANDS {
            self.seen_commands.pop_front();
        }

        info!(command_id = %command.command_id, name = %command.name, "Command received.");
        for handler in &self.handlers {
            handler(&command);
        }
        let _ = self.commands.send(command);
    }

    async fn recover(&mut self) -> bool {
        match self.connect_with_backoff().await {
            Ok(()) => self.is_connected(),
            Err(e) => {
                warn!(error = %e, "Could not re-establish the link.");
                false
            }
        }
    }

    async fn mark_link_lost(&mut self, cause: &Error) {
        if self.state == ConnectionState::Connected {
            warn!(device_id = %self.config.device_id(), error = %cause, "Link lost.");
            self.emit(ClientEvent::Disconnected {
                reason: cause.to_string(),
            });
        }
        self.state = ConnectionState::Disconnected;
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "Transport cleanup after link loss failed.");
        }
    }

    fn spill_telemetry(&mut self) {
        let Some(spool) = self.spool.as_ref() else {
            return;
        };
        let pending = self.outbox.take_telemetry();
        let mut kept = Vec::new();
        for outgoing in pending {
            if let Err(e) = spool.push(outgoing.id, &outgoing.bytes) {
                error!(message_id = outgoing.id, error = %e, "Failed to spool telemetry.");
                kept.push(outgoing);
            }
        }
        self.outbox.restore_telemetry(kept);
    }

    fn restore_spooled(&mut self) {
        let capacity = self.settings.outbox_capacity as u32;
        let Some(spool) = self.spool.as_mut() else {
            return;
        };
        match spool.take_batch(capacity) {
            Ok(packets) if !packets.is_empty() => {
                let restored = packets
                    .into_iter()
                    .map(|p| Outgoing::new(p.message_id, p.payload))
                    .collect();
                let dropped = self.outbox.restore_telemetry(restored);
                if dropped > 0 {
                    self.emit(ClientEvent::TelemetryDropped { count: dropped });
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to read telemetry spool."),
        }
    }

    fn prepare(&mut self, body: Envelope) -> Result<Outgoing> {
        let packet = Packet {
            id: self.next_message_id,
            device_id: self.config.device_id().to_string(),
            body,
        };
        let bytes = packet.encode()?;
        if let Some(limit) = self.transport.max_message_size() {
            if bytes.len() > limit {
                return Err(RadioError::PayloadTooLarge {
                    size: bytes.len(),
                    max_fragments: MAX_FRAGMENTS,
                }
                .into());
            }
        }
        self.next_message_id = self.next_message_id.wrapping_add(1);
        Ok(Outgoing::new(packet.id, bytes))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .settings
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let capped = exp.min(self.settings.reconnect_max_delay_ms);
        // Half fixed, half random, so a fleet coming back does not reconnect in lockstep.
        let half = capped / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=capped - half))
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Repeated telemetry over one client connection, tagged with a stream id.
pub struct TelemetryStream<'a, T: Transport> {
    client: &'a mut Client<T>,
    stream_id: u32,
    sent: u32,
}

impl<'a, T: Transport> TelemetryStream<'a, T> {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn client(&mut self) -> &mut Client<T> {
        self.client
    }

    pub async fn send(&mut self, readings: Readings) -> Result<DeliveryReport> {
        self.send_with(readings, SendOptions::default()).await
    }

    pub async fn send_with(
        &mut self,
        readings: Readings,
        options: SendOptions,
    ) -> Result<DeliveryReport> {
        let report = self
            .client
            .submit_telemetry(readings, Some(self.stream_id), options)
            .await?;
        self.sent += 1;
        Ok(report)
    }
}

async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSettings;
    use crate::types::AlertLevel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum AckMode {
        Accept,
        Reject,
        Silent,
    }

    struct MockTransport {
        connected: bool,
        connect_failures: u32,
        send_failures: u32,
        backend_failures: u32,
        send_delay: Option<Duration>,
        max_message: Option<usize>,
        ack_mode: AckMode,
        sent: Vec<Packet>,
        inbound: VecDeque<Vec<u8>>,
    }

    impl MockTransport {
        fn new() -> Self {
            MockTransport {
                connected: false,
                connect_failures: 0,
                send_failures: 0,
                backend_failures: 0,
                send_delay: None,
                max_message: None,
                ack_mode: AckMode::Accept,
                sent: Vec::new(),
                inbound: VecDeque::new(),
            }
        }

        fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent.iter().map(|p| p.body.label()).collect()
        }
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Radio
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn max_message_size(&self) -> Option<usize> {
            self.max_message
        }

        async fn connect(&mut self) -> Result<()> {
            if self.connect_failures > 0 {
                self.connect_failures -= 1;
                return Err(Error::LinkUnavailable {
                    port: "mock".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "absent"),
                });
            }
            self.connected = true;
            Ok(())
        }

        async fn send(&mut self, payload: &[u8]) -> Result<()> {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }
            if self.send_failures > 0 {
                self.send_failures -= 1;
                self.connected = false;
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into());
            }

            if self.backend_failures > 0 {
                self.backend_failures -= 1;
                return Err(Error::Backend {
                    stage: "send",
                    status: 503,
                });
            }

            let packet = Packet::decode(payload)?;
            let wants_ack = matches!(
                packet.body,
                Envelope::Register(_) | Envelope::Alert(_) | Envelope::Command(_)
            );
            if wants_ack && self.ack_mode != AckMode::Silent {
                let status = match self.ack_mode {
                    AckMode::Accept => AckStatus::Accepted,
                    _ => AckStatus::Rejected,
                };
                let ack = Packet {
                    id: 9_000,
                    device_id: packet.device_id.clone(),
                    body: Envelope::Ack(Ack {
                        ack_id: packet.id,
                        status,
                        detail: Some("mock".into()),
                    }),
                };
                self.inbound.push_back(ack.encode()?);
            }
            self.sent.push(packet);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            Ok(self.inbound.pop_front())
        }

        async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            if let Some(bytes) = self.inbound.pop_front() {
                return Ok(Some(bytes));
            }
            tokio::time::sleep(timeout).await;
            Ok(None)
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }
    }

    fn settings() -> ClientSettings {
        let mut settings = ClientSettings::new(TransportSettings::radio("/dev/mock"));
        settings.ack_timeout_secs = Some(2);
        settings.max_alert_retries = 3;
        settings.reconnect_attempts = 2;
        settings.reconnect_base_delay_ms = 10;
        settings.reconnect_max_delay_ms = 100;
        settings
    }

    fn config() -> DeviceConfiguration {
        DeviceConfiguration::new(
            "env_station_kl_001",
            "environmental_station",
            "secret",
            Location::new(3.139, 101.6869).unwrap(),
            ["temperature"],
        )
        .unwrap()
    }

    fn client_with(settings: ClientSettings, transport: MockTransport) -> Client<MockTransport> {
        Client::with_transport(config(), settings, transport).unwrap()
    }

    fn temperature(value: f64) -> Readings {
        let mut readings = Readings::new();
        readings.insert("temperature".into(), serde_json::json!(value));
        readings
    }

    fn command_packet(id: u32, command_id: &str) -> Vec<u8> {
        Packet {
            id,
            device_id: "env_station_kl_001".into(),
            body: Envelope::Command(CommandMessage {
                command_id: command_id.into(),
                name: "reboot".into(),
                params: serde_json::Value::Null,
                issued_at: Utc::now(),
            }),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn connected_only_after_connect() {
        let mut client = client_with(settings(), MockTransport::new());
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Uninitialized);

        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn double_connect_emits_one_event() {
        let mut client = client_with(settings(), MockTransport::new());
        let mut events = client.subscribe_events();

        client.connect().await.unwrap();
        client.connect().await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::Connected {
                transport: TransportKind::Radio
            }
        );
        assert!(events.try_recv().is_err());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_stays_disconnected() {
        let mut transport = MockTransport::new();
        transport.connect_failures = 1;
        let mut client = client_with(settings(), transport);
        let mut events = client.subscribe_events();

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinkUnavailable);
        assert!(!client.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn sends_while_disconnected_do_no_io() {
        let mut client = client_with(settings(), MockTransport::new());

        assert!(matches!(
            client.send_telemetry(temperature(20.0)).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            client.send_alert(Alert::new(AlertLevel::High, "flood")).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            client.send_command(CommandMessage::new("ping", serde_json::Value::Null)).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            client.register_device().await,
            Err(Error::Registration(_))
        ));
        assert!(client.create_stream().is_err());
        assert!(client.transport().sent.is_empty());
        assert_eq!(client.queued(), 0);
    }

    #[tokio::test]
    async fn send_fails_after_disconnect() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();

        let report = client.send_telemetry(temperature(25.0)).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Sent);
        assert_eq!(report.transport, TransportKind::Radio);

        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(matches!(
            client.send_telemetry(temperature(25.0)).await,
            Err(Error::NotConnected)
        ));
        assert_eq!(client.transport().sent.len(), 1);
    }

    #[tokio::test]
    async fn telemetry_is_stamped_by_the_client() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();

        client.send_telemetry(temperature(20.0)).await.unwrap();
        let moved = Location::new(3.2, 101.7).unwrap();
        client.set_location(moved);
        client.send_telemetry(temperature(21.0)).await.unwrap();

        let messages: Vec<&TelemetryMessage> = client
            .transport()
            .sent
            .iter()
            .filter_map(|p| match &p.body {
                Envelope::Telemetry(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].device_id, "env_station_kl_001");
        assert_eq!(messages[0].sequence_number + 1, messages[1].sequence_number);
        assert_eq!(messages[0].location, client.config().location());
        assert_eq!(messages[1].location, moved);
        assert_eq!(client.config().location(), Location::new(3.139, 101.6869).unwrap());
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_before_io() {
        let mut transport = MockTransport::new();
        transport.max_message = Some(32);
        let mut client = client_with(settings(), transport);
        client.connect().await.unwrap();

        let err = client.send_telemetry(temperature(20.0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Radio);
        assert!(client.transport().sent.is_empty());
        assert_eq!(client.queued(), 0);
    }

    #[test]
    fn outbox_puts_alerts_first_and_sheds_oldest_telemetry() {
        let mut outbox = Outbox::new(2);
        let item = |id| Outgoing::new(id, vec![]);
        assert_eq!(outbox.push_telemetry(item(1)), 0);
        assert_eq!(outbox.push_telemetry(item(2)), 0);
        assert_eq!(outbox.push_telemetry(item(3)), 1);
        outbox.push_alert(item(10));
        outbox.push_alert(item(10));

        assert_eq!(outbox.len(), 3);
        assert!(!outbox.contains(1));
        let mut order = Vec::new();
        while let Some(o) = outbox.front() {
            order.push(o.id);
            outbox.pop_front();
        }
        assert_eq!(order, vec![10, 2, 3]);
    }

    #[tokio::test]
    async fn alert_goes_out_ahead_of_queued_telemetry() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();
        let queued = client
            .prepare(Envelope::Telemetry(TelemetryMessage {
                timestamp: Utc::now(),
                device_id: "env_station_kl_001".into(),
                sequence_number: 0,
                stream_id: None,
                readings: temperature(19.0),
                location: client.location(),
            }))
            .unwrap();
        client.outbox.push_telemetry(queued);

        let report = client
            .send_alert(Alert::new(AlertLevel::Critical, "gas leak"))
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        assert_eq!(report.attempts, 1);
        assert_eq!(client.transport().sent_kinds(), vec!["alert", "telemetry"]);
    }

    fn queued_alert(client: &mut Client<MockTransport>) -> u32 {
        let alert = client
            .prepare(Envelope::Alert(AlertMessage {
                level: AlertLevel::Critical,
                device_id: "env_station_kl_001".into(),
                description: "pressure drop".into(),
                timestamp: Utc::now(),
            }))
            .unwrap();
        let id = alert.id;
        client.outbox.push_alert(alert);
        id
    }

    #[tokio::test]
    async fn backend_error_keeps_queued_alert() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();
        let alert_id = queued_alert(&mut client);
        client.transport.backend_failures = 1;

        let err = client.send_telemetry(temperature(20.0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(client.outbox.contains(alert_id));

        let report = client.send_telemetry(temperature(21.0)).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Sent);
        assert_eq!(
            client.transport().sent_kinds(),
            vec!["alert", "telemetry", "telemetry"]
        );
        assert_eq!(client.transport().sent[0].id, alert_id);
    }

    #[tokio::test]
    async fn alert_failing_every_flush_is_abandoned_loudly() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();
        let alert_id = queued_alert(&mut client);
        client.transport.backend_failures = 3;
        let mut events = client.subscribe_events();

        for reading in 0..3 {
            assert!(client.send_telemetry(temperature(reading as f64)).await.is_err());
        }
        assert!(!client.outbox.contains(alert_id));
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::AlertAbandoned {
                message_id: alert_id,
                attempts: 3
            }
        );

        // Telemetry held behind the alert goes out once the backend recovers.
        client.send_telemetry(temperature(3.0)).await.unwrap();
        assert_eq!(client.transport().sent_kinds(), vec!["telemetry"; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_outbox_sheds_oldest_telemetry() {
        let mut settings = settings();
        settings.outbox_capacity = 2;
        let mut transport = MockTransport::new();
        transport.send_delay = Some(Duration::from_secs(60));
        let mut client = client_with(settings, transport);
        client.connect().await.unwrap();
        let mut events = client.subscribe_events();

        // The link accepts nothing in time, so every reading stays queued.
        let stalled = SendOptions::with_timeout(Duration::from_secs(1));
        for reading in 0..4 {
            let report = client
                .send_telemetry_with(temperature(reading as f64), stalled)
                .await
                .unwrap();
            assert_eq!(report.status, DeliveryStatus::Unknown);
        }
        assert_eq!(client.queued(), 2);
        for _ in 0..2 {
            assert_eq!(
                events.try_recv().unwrap(),
                ClientEvent::TelemetryDropped { count: 1 }
            );
        }
        assert!(events.try_recv().is_err());

        client.transport.send_delay = None;
        client.send_telemetry(temperature(4.0)).await.unwrap();
        let sequences: Vec<u32> = client
            .transport()
            .sent
            .iter()
            .filter_map(|p| match &p.body {
                Envelope::Telemetry(t) => Some(t.sequence_number),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_alert_fails_after_retries() {
        let mut transport = MockTransport::new();
        transport.ack_mode = AckMode::Silent;
        let mut client = client_with(settings(), transport);
        client.connect().await.unwrap();

        let err = client
            .send_alert(Alert::new(AlertLevel::High, "water level"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { attempts: 3, .. }));
        let sent = &client.transport().sent;
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|p| p.id == sent[0].id));
        assert_eq!(client.queued(), 0);
    }

    #[tokio::test]
    async fn rejected_alert_is_surfaced() {
        let mut transport = MockTransport::new();
        transport.ack_mode = AckMode::Reject;
        let mut client = client_with(settings(), transport);
        client.connect().await.unwrap();

        let err = client
            .send_alert(Alert::new(AlertLevel::Low, "battery"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(client.transport().sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn alert_past_deadline_is_unknown_and_stays_queued() {
        let mut transport = MockTransport::new();
        transport.ack_mode = AckMode::Silent;
        let mut client = client_with(settings(), transport);
        client.connect().await.unwrap();

        let report = client
            .send_alert_with(
                Alert::new(AlertLevel::Critical, "fire"),
                SendOptions::with_timeout(Duration::from_millis(500)),
            )
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Unknown);
        assert!(client.outbox.contains(report.message_id));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_telemetry_is_unknown() {
        let mut transport = MockTransport::new();
        transport.send_delay = Some(Duration::from_secs(5));
        let mut client = client_with(settings(), transport);
        client.connect().await.unwrap();

        let report = client
            .send_telemetry_with(
                temperature(20.0),
                SendOptions::with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Unknown);
        assert!(client.outbox.contains(report.message_id));
    }

    #[tokio::test(start_paused = true)]
    async fn link_drop_reconnects_and_delivers() {
        let mut transport = MockTransport::new();
        transport.send_failures = 1;
        let mut client = client_with(settings(), transport);
        client.connect().await.unwrap();
        let mut events = client.subscribe_events();

        let report = client.send_telemetry(temperature(22.0)).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Sent);
        assert!(client.is_connected());
        assert_eq!(client.transport().sent.len(), 1);

        assert!(matches!(events.try_recv().unwrap(), ClientEvent::Disconnected { .. }));
        assert!(matches!(events.try_recv().unwrap(), ClientEvent::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_is_queued_when_reconnect_fails() {
        let mut transport = MockTransport::new();
        transport.send_failures = 1;
        let mut client = client_with(settings(), transport);
        client.connect().await.unwrap();
        client.transport.connect_failures = 10;
        let mut events = client.subscribe_events();

        let report = client.send_telemetry(temperature(22.0)).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Queued);
        assert!(!client.is_connected());
        assert_eq!(client.queued(), 1);

        assert!(matches!(events.try_recv().unwrap(), ClientEvent::Disconnected { .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::Reconnecting { attempt: 1, .. }
        ));

        // The queued reading goes out as soon as the link is back.
        client.transport.connect_failures = 0;
        client.connect().await.unwrap();
        assert_eq!(client.queued(), 0);
        assert_eq!(client.transport().sent_kinds(), vec!["telemetry"]);
    }

    #[tokio::test(start_paused = true)]
    async fn spooled_telemetry_survives_into_next_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings();
        settings.spool_path = Some(dir.path().join("spool.db"));
        let mut transport = MockTransport::new();
        transport.send_failures = 1;
        let mut client = client_with(settings.clone(), transport);
        client.connect().await.unwrap();
        client.transport.connect_failures = 10;

        let report = client.send_telemetry(temperature(30.0)).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Queued);
        assert_eq!(client.queued(), 0);
        drop(client);

        // A fresh client, as after a reboot, replays the spool on connect.
        let mut client = client_with(settings, MockTransport::new());
        client.connect().await.unwrap();
        let sent = &client.transport().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, report.message_id);
    }

    #[tokio::test]
    async fn registration_accepted_and_rejected() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();
        let ack = client.register_device().await.unwrap();
        assert_eq!(ack.device_id, "env_station_kl_001");
        assert_eq!(ack.status, AckStatus::Accepted);

        let Envelope::Register(request) = &client.transport().sent[0].body else {
            panic!("expected registration");
        };
        assert!(request.capabilities.contains("temperature"));

        client.transport.ack_mode = AckMode::Reject;
        assert!(matches!(
            client.register_device().await,
            Err(Error::Registration(_))
        ));
    }

    #[tokio::test]
    async fn commands_are_acked_and_delivered_once() {
        let mut client = client_with(settings(), MockTransport::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        client.on_command(move |command| {
            assert_eq!(command.name, "reboot");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut commands = client.subscribe_commands();
        client.connect().await.unwrap();

        client.transport.inbound.push_back(command_packet(41, "cmd-1"));
        client.transport.inbound.push_back(command_packet(42, "cmd-1"));
        let handled = client.poll(Duration::from_millis(10)).await.unwrap();

        assert_eq!(handled, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(commands.try_recv().unwrap().command_id, "cmd-1");
        assert!(commands.try_recv().is_err());

        let acked: Vec<u32> = client
            .transport()
            .sent
            .iter()
            .filter_map(|p| match &p.body {
                Envelope::Ack(ack) => Some(ack.ack_id),
                _ => None,
            })
            .collect();
        assert_eq!(acked, vec![41, 42]);
    }

    #[tokio::test]
    async fn packets_for_other_devices_are_ignored() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();
        let foreign = Packet {
            id: 5,
            device_id: "someone_else".into(),
            body: Envelope::Command(CommandMessage::new("reboot", serde_json::Value::Null)),
        };
        client.transport.inbound.push_back(foreign.encode().unwrap());

        let mut commands = client.subscribe_commands();
        client.poll(Duration::from_millis(10)).await.unwrap();
        assert!(commands.try_recv().is_err());
        assert!(client.transport().sent.is_empty());
    }

    #[tokio::test]
    async fn command_to_backend_is_delivered() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();
        let report = client
            .send_command(CommandMessage::new("request_sync", serde_json::json!({"full": true})))
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn stream_shares_connection_and_order() {
        let mut client = client_with(settings(), MockTransport::new());
        client.connect().await.unwrap();

        let mut stream = client.create_stream().unwrap();
        let stream_id = stream.id();
        for i in 0..3 {
            let report = stream.send(temperature(20.0 + i as f64)).await.unwrap();
            assert_eq!(report.status, DeliveryStatus::Sent);
        }
        assert_eq!(stream.sent(), 3);

        let sent: Vec<(Option<u32>, u32)> = client
            .transport()
            .sent
            .iter()
            .filter_map(|p| match &p.body {
                Envelope::Telemetry(t) => Some((t.stream_id, t.sequence_number)),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(id, _)| *id == Some(stream_id)));
        assert!(sent.windows(2).all(|w| w[0].1 < w[1].1));

        client.disconnect().await.unwrap();
        assert!(client.create_stream().is_err());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let client = client_with(settings(), MockTransport::new());
        for attempt in 1..=10 {
            let delay = client.backoff_delay(attempt).as_millis() as u64;
            let full = (10u64 << (attempt - 1)).min(100);
            assert!(delay >= full / 2 && delay <= full, "attempt {attempt}: {delay}");
        }
    }
}
