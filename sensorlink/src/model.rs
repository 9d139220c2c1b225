//! Values passed between discovery, the repository and the provisioner

use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use secrecy::SecretString;
use sensorlink_crypto::SessionKey;
use sensorlink_proto::config::{FailReason, MAX_PASSWORD_LEN, MAX_SSID_LEN, WifiStationState};
use sensorlink_proto::scan::WifiAuthMode;
use sensorlink_proto::version::VersionInfo;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::qr::QrProvisioningData;

/// Link a device is provisioned over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bluetooth Low Energy GATT
    Ble,
    /// HTTP on the device's own access point
    SoftAp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ble => f.write_str("ble"),
            TransportKind::SoftAp => f.write_str("softap"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ble" => Ok(TransportKind::Ble),
            "softap" => Ok(TransportKind::SoftAp),
            other => Err(format!("unknown transport {other:?}, expected ble or softap")),
        }
    }
}

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningDevice {
    /// Opaque, transport specific identity
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub transport: TransportKind,
    pub service_uuid: Option<Uuid>,
    pub pop_hint: Option<String>,
}

impl ProvisioningDevice {
    /// Descriptor for the device named by a scanned QR code
    pub fn from_qr(data: &QrProvisioningData) -> Self {
        Self {
            id: data.service_name.clone(),
            name: data.service_name.clone(),
            rssi: None,
            transport: data.transport,
            service_uuid: None,
            pop_hint: None,
        }
    }
}

/// State of the secure session with the connected device
///
/// The key is set at most once. A new handshake starts from a fresh session
/// value, and dropping the session wipes the key.
#[derive(Debug)]
pub struct ProvisioningSession {
    device: ProvisioningDevice,
    version: Option<String>,
    capabilities: Vec<String>,
    session_key: Option<SessionKey>,
}

impl ProvisioningSession {
    pub fn new(device: ProvisioningDevice) -> Self {
        Self {
            device,
            version: None,
            capabilities: Vec::new(),
            session_key: None,
        }
    }

    pub fn device(&self) -> &ProvisioningDevice {
        &self.device
    }

    /// Protocol version reported by the device, once queried
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Unknown capabilities count as present until the version is queried
    pub fn supports(&self, capability: &str) -> bool {
        self.version.is_none() || self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_secure(&self) -> bool {
        self.session_key.is_some()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    pub(crate) fn set_version(&mut self, info: VersionInfo) {
        self.version = Some(info.prov.ver);
        self.capabilities = info.prov.cap;
    }

    pub(crate) fn set_session_key(&mut self, key: SessionKey) {
        debug_assert!(self.session_key.is_none(), "session key is never rotated");
        self.session_key = Some(key);
    }

    /// Same device and version, without a key
    pub(crate) fn renew(self) -> Self {
        Self {
            device: self.device,
            version: self.version,
            capabilities: self.capabilities,
            session_key: None,
        }
    }
}

/// An access point reported by the device's Wi-Fi scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiFiNetwork {
    pub ssid: String,
    pub rssi: i8,
    pub auth_mode: WifiAuthMode,
    pub channel: u8,
    pub bssid: [u8; 6],
}

impl WiFiNetwork {
    /// BSSID as `aa:bb:cc:dd:ee:ff`
    pub fn bssid_string(&self) -> String {
        self.bssid
            .iter()
            .map(|b| HEXLOWER.encode(&[*b]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Network credentials handed to the provisioner
///
/// Consumed by value when provisioning; the password is redacted from
/// `Debug` output and wiped on drop.
#[derive(Debug)]
pub struct WiFiCredentials {
    pub ssid: String,
    pub password: SecretString,
}

impl WiFiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        use secrecy::ExposeSecret;

        if self.ssid.is_empty() || self.ssid.len() > MAX_SSID_LEN {
            return Err(ProvisionError::InvalidCredentials(format!(
                "SSID must be 1 to {MAX_SSID_LEN} bytes"
            )));
        }
        if self.password.expose_secret().len() > MAX_PASSWORD_LEN {
            return Err(ProvisionError::InvalidCredentials(format!(
                "password must be at most {MAX_PASSWORD_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// Provisioning state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningStatus {
    Idle,
    Connected,
    ConfigReceived,
    ConfigApplied,
    Success,
    Failed,
}

impl ProvisioningStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProvisioningStatus::Success | ProvisioningStatus::Failed)
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisioningStatus::Idle => "idle",
            ProvisioningStatus::Connected => "connected",
            ProvisioningStatus::ConfigReceived => "config received",
            ProvisioningStatus::ConfigApplied => "config applied",
            ProvisioningStatus::Success => "success",
            ProvisioningStatus::Failed => "failed",
        })
    }
}

/// Station state as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiStatusReport {
    pub state: WifiStationState,
    pub fail_reason: FailReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = WiFiCredentials::new("HomeNet", "hunter22");
        let shown = format!("{credentials:?}");
        assert!(shown.contains("HomeNet"));
        assert!(!shown.contains("hunter22"));
    }

    #[test]
    fn credential_limits() {
        assert!(WiFiCredentials::new("", "x").validate().is_err());
        assert!(WiFiCredentials::new("a".repeat(33), "x").validate().is_err());
        assert!(WiFiCredentials::new("Home", "p".repeat(65)).validate().is_err());
        assert!(WiFiCredentials::new("Open", "").validate().is_ok());
    }

    #[test]
    fn transport_kind_parses() {
        assert_eq!("BLE".parse::<TransportKind>().unwrap(), TransportKind::Ble);
        assert_eq!("softap".parse::<TransportKind>().unwrap(), TransportKind::SoftAp);
        assert!("wifi".parse::<TransportKind>().is_err());
    }

    #[test]
    fn bssid_formatting() {
        let network = WiFiNetwork {
            ssid: "HomeNet".into(),
            rssi: -40,
            auth_mode: WifiAuthMode::Wpa2Psk,
            channel: 6,
            bssid: [0x24, 0x0a, 0xc4, 0x00, 0x01, 0xff],
        };
        assert_eq!(network.bssid_string(), "24:0a:c4:00:01:ff");
    }

    #[test]
    fn session_key_lifecycle() {
        let device = ProvisioningDevice {
            id: "aa".into(),
            name: "PROV_ABC".into(),
            rssi: Some(-50),
            transport: TransportKind::Ble,
            service_uuid: None,
            pop_hint: None,
        };
        let mut session = ProvisioningSession::new(device);
        assert!(!session.is_secure());
        assert!(session.supports("wifi_scan"));

        session.set_version(VersionInfo::new("v1.1", &["custom_data"]));
        assert!(!session.supports("wifi_scan"));

        session.set_session_key(SessionKey::generate());
        assert!(session.is_secure());
        let renewed = session.renew();
        assert!(!renewed.is_secure());
        assert_eq!(renewed.version(), Some("v1.1"));
    }
}
