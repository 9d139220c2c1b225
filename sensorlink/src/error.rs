//! Error types for each layer of the client
//!
//! Transport errors carry a recoverable/fatal classification. Only the
//! provisioner acts on it, deciding between retry, abort and `Failed`.
//! None of these types ever hold key material, the proof of possession or a
//! Wi-Fi password.

use std::time::Duration;

use sensorlink_crypto::CryptoError;
use sensorlink_proto::status_name;
use uuid::Uuid;

use crate::model::ProvisioningStatus;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("no bluetooth adapter found")]
    NoAdapter,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("provisioning service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("characteristic {0} supports neither notify nor indicate")]
    NotifyUnsupported(Uuid),
    #[error("not connected")]
    NotConnected,
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("link error: {0}")]
    Link(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl TransportError {
    /// Recoverable errors may succeed on a retry of the same operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected
                | TransportError::Timeout { .. }
                | TransportError::WriteRejected(_)
                | TransportError::Link(_)
                | TransportError::Http(_)
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        TransportError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::DeviceNotFound => {
                TransportError::DeviceNotFound("peripheral went away".to_string())
            }
            btleplug::Error::TimedOut(timeout) => TransportError::timeout("bluetooth", timeout),
            other => TransportError::Link(other.to_string()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    /// Wrong proof of possession, or the device failed to prove it holds the
    /// same secrets. Never retried.
    #[error("device rejected the proof of possession")]
    Rejected,
    #[error("device refused the handshake: {}", status_name(*.0))]
    DeviceStatus(u8),
    #[error("malformed handshake response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl HandshakeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HandshakeError::Transport(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("secure session: {0}")]
    Handshake(#[from] HandshakeError),
    /// Response failed authentication or could not be decoded
    #[error("{endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },
    #[error("{endpoint}: device answered {}", status_name(*.status))]
    DeviceRejected { endpoint: String, status: u8 },
    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ProvisioningStatus,
    },
    #[error("no secure session")]
    NotSecure,
    #[error("device does not support {0}")]
    Unsupported(&'static str),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<ProvisionError>,
    },
    #[error("device did not finish joining within {0:?}")]
    Timeout(Duration),
}

impl ProvisionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProvisionError::Transport(e) => e.is_recoverable(),
            ProvisionError::Handshake(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn protocol(endpoint: &str, reason: impl Into<String>) -> Self {
        ProvisionError::Protocol {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}
