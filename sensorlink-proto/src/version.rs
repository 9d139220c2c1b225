//! `prov-version` payload: protocol version and device capabilities
//!
//! Sent in the clear as JSON, e.g.
//! `{"prov":{"ver":"v1.1","cap":["wifi_scan","custom_data"]}}`.

use std::io;

use serde::{Deserialize, Serialize};

/// Capability advertised by devices that can scan for Wi-Fi networks
pub const CAP_WIFI_SCAN: &str = "wifi_scan";

/// Capability advertised by devices that accept `custom-data`
pub const CAP_CUSTOM_DATA: &str = "custom_data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub prov: ProvInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvInfo {
    pub ver: String,
    #[serde(default)]
    pub cap: Vec<String>,
}

impl VersionInfo {
    pub fn new(ver: &str, cap: &[&str]) -> Self {
        Self {
            prov: ProvInfo {
                ver: ver.to_string(),
                cap: cap.iter().map(|c| c.to_string()).collect(),
            },
        }
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.prov.cap.iter().any(|c| c == cap)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of strings cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid version info: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_payload() {
        let info = VersionInfo::from_bytes(br#"{"prov":{"ver":"v1.1","cap":["wifi_scan"]}}"#)
            .unwrap();
        assert_eq!(info.prov.ver, "v1.1");
        assert!(info.has_capability(CAP_WIFI_SCAN));
        assert!(!info.has_capability(CAP_CUSTOM_DATA));
    }

    #[test]
    fn capabilities_are_optional() {
        let info = VersionInfo::from_bytes(br#"{"prov":{"ver":"v1"}}"#).unwrap();
        assert!(info.prov.cap.is_empty());
    }
}
