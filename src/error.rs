use thiserror::Error;

use crate::types::TransportKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures specific to the long-range radio link.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("payload of {size} bytes needs more than {max_fragments} fragments")]
    PayloadTooLarge { size: usize, max_fragments: usize },

    #[error("frame size {0} is outside the supported range")]
    InvalidFrameSize(usize),

    #[error("corrupt frame: {0}")]
    CorruptFrame(&'static str),

    #[error("message {msg_seq} timed out with {received}/{expected} fragments")]
    ReassemblyTimeout {
        msg_seq: u16,
        received: usize,
        expected: usize,
    },

    #[error("serial link closed by peer")]
    LinkClosed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("link unavailable on {port}: {source}")]
    LinkUnavailable {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not connected")]
    NotConnected,

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("delivery of message {message_id} failed after {attempts} attempts")]
    DeliveryFailed { message_id: u32, attempts: u32 },

    #[error("backend rejected message {message_id}: {reason}")]
    Rejected { message_id: u32, reason: String },

    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("backend answered {status} during {stage}")]
    Backend { stage: &'static str, status: u16 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("spool error: {0}")]
    Spool(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} over {transport} failed: {source}")]
    Context {
        operation: &'static str,
        transport: TransportKind,
        #[source]
        source: Box<Error>,
    },
}

/// Coarse classification that survives [`Error::Context`] wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    LinkUnavailable,
    NotConnected,
    Registration,
    DeliveryFailed,
    Rejected,
    Radio,
    Network,
    Serialization,
    Spool,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::LinkUnavailable { .. } => ErrorKind::LinkUnavailable,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::Registration(_) => ErrorKind::Registration,
            Error::DeliveryFailed { .. } => ErrorKind::DeliveryFailed,
            Error::Rejected { .. } => ErrorKind::Rejected,
            Error::Radio(_) => ErrorKind::Radio,
            Error::Network(_) | Error::Backend { .. } => ErrorKind::Network,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Spool(_) => ErrorKind::Spool,
            Error::Io(_) => ErrorKind::Io,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Wraps a transport error with the operation and transport that produced it.
    pub fn context(self, operation: &'static str, transport: TransportKind) -> Self {
        match self {
            // Caller-facing conditions stay unwrapped so they can be matched directly.
            Error::NotConnected
            | Error::Validation(_)
            | Error::LinkUnavailable { .. }
            | Error::Registration(_)
            | Error::DeliveryFailed { .. }
            | Error::Rejected { .. }
            | Error::Context { .. } => self,
            other => Error::Context {
                operation,
                transport,
                source: Box::new(other),
            },
        }
    }

    /// Whether the failure means the link is gone and a reconnect is warranted.
    pub fn is_link_failure(&self) -> bool {
        match self {
            Error::Io(_) | Error::Network(_) | Error::Radio(RadioError::LinkClosed) => true,
            Error::Context { source, .. } => source.is_link_failure(),
            _ => false,
        }
    }
}
