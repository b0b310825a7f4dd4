use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sensor-channel name to reading. The schema is open; values only need to serialize.
pub type Readings = BTreeMap<String, serde_json::Value>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    DirectNetwork,
    Radio,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::DirectNetwork => f.write_str("direct-network"),
            TransportKind::Radio => f.write_str("radio"),
        }
    }
}

/// Position in decimal degrees.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::Validation(format!("latitude {latitude} out of range")));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::Validation(format!("longitude {longitude} out of range")));
        }
        Ok(Location { latitude, longitude })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub sequence_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u32>,
    pub readings: Readings,
    pub location: Location,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// What the application hands to the client; the client stamps the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: String,
}

impl Alert {
    pub fn new(level: AlertLevel, description: impl Into<String>) -> Self {
        Alert {
            level,
            description: description.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub level: AlertLevel,
    pub device_id: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub command_id: String,
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}

impl CommandMessage {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        CommandMessage {
            command_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            params,
            issued_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct RegistrationRequest {
    pub device_id: String,
    pub device_type: String,
    pub credential: String,
    pub location: Location,
    pub capabilities: BTreeSet<String>,
}

impl fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("device_id", &self.device_id)
            .field("device_type", &self.device_type)
            .field("credential", &"<redacted>")
            .field("location", &self.location)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ack {
    pub ack_id: u32,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Register(RegistrationRequest),
    Telemetry(TelemetryMessage),
    Alert(AlertMessage),
    Command(CommandMessage),
    Ack(Ack),
}

impl Envelope {
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::Register(_) => "register",
            Envelope::Telemetry(_) => "telemetry",
            Envelope::Alert(_) => "alert",
            Envelope::Command(_) => "command",
            Envelope::Ack(_) => "ack",
        }
    }
}

/// Unit of transmission on every transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: u32,
    pub device_id: String,
    pub body: Envelope,
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationAck {
    pub device_id: String,
    pub status: AckStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The backend acknowledged the message.
    Delivered,
    /// Handed to the transport; no acknowledgment expected.
    Sent,
    /// Held in the outbox until the link comes back.
    Queued,
    /// The caller's deadline passed before the outcome was known.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub message_id: u32,
    pub transport: TransportKind,
    pub status: DeliveryStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { transport: TransportKind },
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    TelemetryDropped { count: usize },
    /// A queued alert kept failing on the backend and was abandoned.
    AlertAbandoned { message_id: u32, attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_levels_are_ordered() {
        assert!(AlertLevel::Low < AlertLevel::Medium);
        assert!(AlertLevel::Medium < AlertLevel::High);
        assert!(AlertLevel::High < AlertLevel::Critical);
    }

    #[test]
    fn location_rejects_out_of_range() {
        assert!(Location::new(3.139, 101.6869).is_ok());
        assert!(Location::new(90.5, 0.0).is_err());
        assert!(Location::new(0.0, -180.1).is_err());
        assert!(Location::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn telemetry_packet_parses_back() {
        let mut readings = Readings::new();
        readings.insert("temperature".into(), serde_json::json!(25.0));
        readings.insert("wind".into(), serde_json::json!({"speed": 4.2, "dir": 270}));
        let packet = Packet {
            id: 7,
            device_id: "buoy_07".into(),
            body: Envelope::Telemetry(TelemetryMessage {
                timestamp: Utc::now(),
                device_id: "buoy_07".into(),
                sequence_number: 3,
                stream_id: None,
                readings: readings.clone(),
                location: Location::new(3.139, 101.6869).unwrap(),
            }),
        };

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        let Envelope::Telemetry(msg) = decoded.body else {
            panic!("expected telemetry");
        };
        assert_eq!(msg.device_id, "buoy_07");
        assert_eq!(msg.readings, readings);
        assert!((msg.location.latitude - 3.139).abs() < 1e-9);
        assert!((msg.location.longitude - 101.6869).abs() < 1e-9);
    }

    #[test]
    fn registration_debug_hides_credential() {
        let req = RegistrationRequest {
            device_id: "helmet_3".into(),
            device_type: "wearable".into(),
            credential: "s3cret".into(),
            location: Location::new(0.0, 0.0).unwrap(),
            capabilities: BTreeSet::new(),
        };
        assert!(!format!("{req:?}").contains("s3cret"));
    }
}
