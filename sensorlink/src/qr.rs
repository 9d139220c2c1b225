//! QR bootstrap text parser
//!
//! Devices carry a QR code with the data needed to find and authenticate
//! them, in one of two encodings of the same fields:
//!
//! ```text
//! {"ver":"v1","name":"PROV_ABC","pop":"secret123","transport":"ble"}
//! name:PROV_ABC,pop:secret123,transport:ble
//! ```
//!
//! Only the decoded text is handled here, not the image.

use std::collections::HashMap;

use secrecy::SecretString;
use serde::Deserialize;

use crate::model::TransportKind;

/// Version assumed when the QR text does not name one
pub const DEFAULT_VERSION: &str = "v1";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QrError {
    #[error("QR text is empty")]
    Empty,
    #[error("QR text is neither JSON nor key:value pairs")]
    UnknownFormat,
    #[error("invalid QR JSON: {0}")]
    Json(String),
    #[error("malformed key:value pair {0:?}")]
    MalformedPair(String),
    #[error("QR text is missing required field {0:?}")]
    MissingField(&'static str),
}

/// Decoded contents of a device's QR code
#[derive(Clone, PartialEq, Eq)]
pub struct QrProvisioningData {
    pub version: String,
    pub transport: TransportKind,
    /// BLE advertised name or SoftAP SSID of the device
    pub service_name: String,
    proof_of_possession: String,
    /// SoftAP network password, when the access point is protected
    password: Option<String>,
}

impl QrProvisioningData {
    /// The proof of possession, wrapped so it cannot be logged by accident
    pub fn pop(&self) -> SecretString {
        SecretString::from(self.proof_of_possession.clone())
    }

    pub fn ap_password(&self) -> Option<SecretString> {
        self.password.clone().map(SecretString::from)
    }

    pub fn has_ap_password(&self) -> bool {
        self.password.is_some()
    }
}

impl std::fmt::Debug for QrProvisioningData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrProvisioningData")
            .field("version", &self.version)
            .field("transport", &self.transport)
            .field("service_name", &self.service_name)
            .field("proof_of_possession", &"[REDACTED]")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Deserialize)]
struct QrJson {
    ver: Option<String>,
    name: Option<String>,
    pop: Option<String>,
    transport: Option<String>,
    password: Option<String>,
}

/// Parse decoded QR text
///
/// Text starting with `{` is JSON; otherwise text containing `:` is a
/// comma separated `key:value` list. `name`, `pop` and `transport` are
/// required; `transport` `ble` selects BLE and anything else SoftAP.
pub fn parse(text: &str) -> Result<QrProvisioningData, QrError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(QrError::Empty);
    }

    let fields = if text.starts_with('{') {
        serde_json::from_str::<QrJson>(text).map_err(|e| QrError::Json(e.to_string()))?
    } else if text.contains(':') {
        parse_pairs(text)?
    } else {
        return Err(QrError::UnknownFormat);
    };

    let name = fields.name.ok_or(QrError::MissingField("name"))?;
    let pop = fields.pop.ok_or(QrError::MissingField("pop"))?;
    let transport = fields.transport.ok_or(QrError::MissingField("transport"))?;

    Ok(QrProvisioningData {
        version: fields.ver.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        transport: if transport == "ble" {
            TransportKind::Ble
        } else {
            TransportKind::SoftAp
        },
        service_name: name,
        proof_of_possession: pop,
        password: fields.password,
    })
}

fn parse_pairs(text: &str) -> Result<QrJson, QrError> {
    let mut pairs = HashMap::new();
    for pair in text.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        // values may themselves contain ':'
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| QrError::MalformedPair(pair.to_string()))?;
        pairs.insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(QrJson {
        ver: pairs.remove("ver"),
        name: pairs.remove("name"),
        pop: pairs.remove("pop"),
        transport: pairs.remove("transport"),
        password: pairs.remove("password"),
    })
}
