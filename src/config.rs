use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Location, RegistrationRequest, TransportKind};

/// Immutable identity of a device. Built once at boot and owned by its client.
#[derive(Clone, PartialEq)]
pub struct DeviceConfiguration {
    device_id: String,
    device_type: String,
    credential: String,
    location: Location,
    capabilities: BTreeSet<String>,
}

impl DeviceConfiguration {
    pub fn new<I, S>(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        credential: impl Into<String>,
        location: Location,
        capabilities: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(Error::Validation("device id must not be empty".into()));
        }
        // Re-check in case the location was built by hand rather than through Location::new.
        let location = Location::new(location.latitude, location.longitude)?;
        let capabilities = validate_capabilities(capabilities)?;

        Ok(DeviceConfiguration {
            device_id,
            device_type: device_type.into(),
            credential: credential.into(),
            location,
            capabilities,
        })
    }

    pub fn from_env() -> Result<Self> {
        let device_id = env::var("C3_DEVICE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let device_type =
            env::var("C3_DEVICE_TYPE").unwrap_or_else(|_| "environmental_station".to_string());
        let credential = env::var("C3_CREDENTIAL").unwrap_or_default();

        let latitude = get_env_var("C3_LATITUDE", 0.0)?;
        let longitude = get_env_var("C3_LONGITUDE", 0.0)?;
        let capabilities: Vec<String> = env::var("C3_CAPABILITIES")
            .map(|raw| raw.split(',').map(|tag| tag.trim().to_string()).collect())
            .unwrap_or_default();

        Self::new(
            device_id,
            device_type,
            credential,
            Location::new(latitude, longitude)?,
            capabilities,
        )
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    pub fn with_location(&self, location: Location) -> Result<Self> {
        Self::new(
            self.device_id.clone(),
            self.device_type.clone(),
            self.credential.clone(),
            location,
            self.capabilities.iter().cloned(),
        )
    }

    pub fn with_capabilities<I, S>(&self, capabilities: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            self.device_id.clone(),
            self.device_type.clone(),
            self.credential.clone(),
            self.location,
            capabilities,
        )
    }

    pub(crate) fn registration_request(&self) -> RegistrationRequest {
        RegistrationRequest {
            device_id: self.device_id.clone(),
            device_type: self.device_type.clone(),
            credential: self.credential.clone(),
            location: self.location,
            capabilities: self.capabilities.clone(),
        }
    }
}

impl fmt::Debug for DeviceConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfiguration")
            .field("device_id", &self.device_id)
            .field("device_type", &self.device_type)
            .field("credential", &"<redacted>")
            .field("location", &self.location)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

fn validate_capabilities<I, S>(capabilities: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut set = BTreeSet::new();
    for tag in capabilities {
        let tag = tag.into();
        if tag.trim().is_empty() {
            return Err(Error::Validation("capability tags must be non-empty".into()));
        }
        set.insert(tag);
    }
    Ok(set)
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSettings {
    Direct {
        backend_url: String,
        #[serde(default = "default_handshake_timeout")]
        handshake_timeout_secs: u64,
        #[serde(default = "default_request_timeout")]
        request_timeout_secs: u64,
    },
    Radio {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_frame_size")]
        frame_size: usize,
        #[serde(default = "default_reassembly_timeout")]
        reassembly_timeout_secs: u64,
        #[serde(default)]
        node_id: u8,
    },
}

impl TransportSettings {
    pub fn direct(backend_url: impl Into<String>) -> Self {
        TransportSettings::Direct {
            backend_url: backend_url.into(),
            handshake_timeout_secs: default_handshake_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn radio(port: impl Into<String>) -> Self {
        TransportSettings::Radio {
            port: port.into(),
            baud_rate: default_baud_rate(),
            frame_size: default_frame_size(),
            reassembly_timeout_secs: default_reassembly_timeout(),
            node_id: 0,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSettings::Direct { .. } => TransportKind::DirectNetwork,
            TransportSettings::Radio { .. } => TransportKind::Radio,
        }
    }
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    15
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_frame_size() -> usize {
    240
}

fn default_reassembly_timeout() -> u64 {
    60
}

/// Transport selection and the timing knobs of the delivery pipeline.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub transport: TransportSettings,
    /// Per-attempt wait for an acknowledgment. Defaults depend on the transport.
    pub ack_timeout_secs: Option<u64>,
    pub max_alert_retries: u32,
    pub outbox_capacity: usize,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub spool_path: Option<PathBuf>,
}

impl ClientSettings {
    pub fn new(transport: TransportSettings) -> Self {
        ClientSettings {
            transport,
            ack_timeout_secs: None,
            max_alert_retries: 5,
            outbox_capacity: 256,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            spool_path: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let transport = match env::var("C3_TRANSPORT").as_deref() {
            Ok("radio") => TransportSettings::Radio {
                port: env::var("C3_RADIO_PORT").unwrap_or_else(|_| "/dev/ttyUSB0".to_string()),
                baud_rate: get_env_var("C3_RADIO_BAUD", default_baud_rate())?,
                frame_size: get_env_var("C3_RADIO_FRAME_SIZE", default_frame_size())?,
                reassembly_timeout_secs: get_env_var(
                    "C3_RADIO_REASSEMBLY_TIMEOUT_SECS",
                    default_reassembly_timeout(),
                )?,
                node_id: get_env_var("C3_RADIO_NODE_ID", 0)?,
            },
            Ok("direct") | Err(_) => TransportSettings::Direct {
                backend_url: env::var("C3_BACKEND_URL")
                    .unwrap_or_else(|_| "http://localhost:8000".to_string()),
                handshake_timeout_secs: get_env_var(
                    "C3_HANDSHAKE_TIMEOUT_SECS",
                    default_handshake_timeout(),
                )?,
                request_timeout_secs: get_env_var(
                    "C3_REQUEST_TIMEOUT_SECS",
                    default_request_timeout(),
                )?,
            },
            Ok(other) => {
                return Err(Error::Validation(format!("unknown transport '{other}'")));
            }
        };

        let defaults = Self::new(transport);
        Ok(ClientSettings {
            ack_timeout_secs: match env::var("C3_ACK_TIMEOUT_SECS") {
                Ok(_) => Some(get_env_var("C3_ACK_TIMEOUT_SECS", 0)?),
                Err(_) => None,
            },
            max_alert_retries: get_env_var("C3_MAX_ALERT_RETRIES", defaults.max_alert_retries)?,
            outbox_capacity: get_env_var("C3_OUTBOX_CAPACITY", defaults.outbox_capacity)?,
            reconnect_attempts: get_env_var("C3_RECONNECT_ATTEMPTS", defaults.reconnect_attempts)?,
            reconnect_base_delay_ms: get_env_var(
                "C3_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            )?,
            reconnect_max_delay_ms: get_env_var(
                "C3_RECONNECT_MAX_DELAY_MS",
                defaults.reconnect_max_delay_ms,
            )?,
            spool_path: env::var("C3_SPOOL_PATH").ok().map(PathBuf::from),
            ..defaults
        })
    }

    pub fn ack_timeout(&self) -> Duration {
        let secs = self.ack_timeout_secs.unwrap_or(match self.transport.kind() {
            TransportKind::DirectNetwork => 10,
            TransportKind::Radio => 30,
        });
        Duration::from_secs(secs)
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("C3_CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("c3_client.json")
    }

    pub fn load_from_file() -> Result<Self> {
        let contents = fs::read_to_string(Self::get_config_file_path())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save_to_file(&self) -> Result<()> {
        let config_file_path = Self::get_config_file_path();
        if let Some(parent) = config_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(&config_file_path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

/// Reads `key` as a `T`, falling back to `default` when unset. Values that do
/// not parse, including ones out of range for `T`, are rejected.
fn get_env_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse()
            .map_err(|_| Error::Validation(format!("{key} is not a valid value: '{val}'"))),
        Err(_) => Ok(default),
    }
}
