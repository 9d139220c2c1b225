//! Wi-Fi station abstraction
//!
//! Firmware crates implement [`Wifi`] on top of their radio stack.
//! [`SimulatedWifi`] is an in-memory station for tests and demos.

use sensorlink_proto::config::{FailReason, WifiStationState};
use sensorlink_proto::scan::WifiAuthMode;
use zeroize::Zeroizing;

/// Wi-Fi network scan result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i8,
    pub auth_mode: WifiAuthMode,
    pub bssid: [u8; 6],
}

/// Station connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed(FailReason),
}

impl WifiStatus {
    /// Wire representation reported by `GetStatus`
    pub fn station_state(self) -> (WifiStationState, FailReason) {
        match self {
            WifiStatus::Disconnected => (WifiStationState::Disconnected, FailReason::None),
            WifiStatus::Connecting => (WifiStationState::Connecting, FailReason::None),
            WifiStatus::Connected => (WifiStationState::Connected, FailReason::None),
            WifiStatus::Failed(reason) => (WifiStationState::ConnectionFailed, reason),
        }
    }
}

/// Trait for Wi-Fi station operations
pub trait Wifi {
    /// Error type for Wi-Fi operations
    type Error: std::fmt::Display;

    /// Scan for available networks
    fn scan(&mut self) -> Result<Vec<ScanResult>, Self::Error>;

    /// Start joining a network. Progress is reported through [`Wifi::status`].
    fn connect(&mut self, ssid: &str, password: &[u8]) -> Result<(), Self::Error>;

    /// Current connection status. Takes `&mut self` so polling may advance
    /// the station's state.
    fn status(&mut self) -> WifiStatus;

    fn is_connected(&mut self) -> bool {
        self.status() == WifiStatus::Connected
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedWifiError {
    #[error("radio busy: a connection attempt is in progress")]
    RadioBusy,
}

struct SimulatedNetwork {
    info: ScanResult,
    password: Zeroizing<Vec<u8>>,
}

/// In-memory Wi-Fi station
///
/// A connection attempt reports `Connecting` for `connect_polls` status
/// polls, then settles on `Connected`, or `Failed` with `AuthError` for a
/// wrong password or `NetworkNotFound` for an unknown SSID.
pub struct SimulatedWifi {
    networks: Vec<SimulatedNetwork>,
    connect_polls: u32,
    pending_polls: u32,
    outcome: WifiStatus,
    connect_attempts: u32,
}

impl SimulatedWifi {
    pub fn new() -> Self {
        Self {
            networks: Vec::new(),
            connect_polls: 1,
            pending_polls: 0,
            outcome: WifiStatus::Disconnected,
            connect_attempts: 0,
        }
    }

    /// Add a visible network that accepts `password`
    pub fn with_network(mut self, info: ScanResult, password: &[u8]) -> Self {
        self.networks.push(SimulatedNetwork {
            info,
            password: Zeroizing::new(password.to_vec()),
        });
        self
    }

    /// Number of status polls that report `Connecting` after `connect`
    pub fn with_connect_polls(mut self, polls: u32) -> Self {
        self.connect_polls = polls;
        self
    }

    /// How many times `connect` has been called
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }
}

impl Default for SimulatedWifi {
    fn default() -> Self {
        Self::new()
    }
}

impl Wifi for SimulatedWifi {
    type Error = SimulatedWifiError;

    fn scan(&mut self) -> Result<Vec<ScanResult>, Self::Error> {
        if self.pending_polls > 0 {
            return Err(SimulatedWifiError::RadioBusy);
        }
        Ok(self.networks.iter().map(|n| n.info.clone()).collect())
    }

    fn connect(&mut self, ssid: &str, password: &[u8]) -> Result<(), Self::Error> {
        self.connect_attempts += 1;
        self.outcome = match self.networks.iter().find(|n| n.info.ssid == ssid) {
            None => WifiStatus::Failed(FailReason::NetworkNotFound),
            Some(network) if network.password.as_slice() == password => WifiStatus::Connected,
            Some(_) => WifiStatus::Failed(FailReason::AuthError),
        };
        self.pending_polls = self.connect_polls;
        Ok(())
    }

    fn status(&mut self) -> WifiStatus {
        if self.pending_polls > 0 {
            self.pending_polls -= 1;
            return WifiStatus::Connecting;
        }
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> ScanResult {
        ScanResult {
            ssid: "HomeNet".to_string(),
            channel: 6,
            rssi: -45,
            auth_mode: WifiAuthMode::Wpa2Psk,
            bssid: [0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01],
        }
    }

    #[test]
    fn connects_after_pending_polls() {
        let mut wifi = SimulatedWifi::new()
            .with_network(home(), b"hunter22")
            .with_connect_polls(2);
        assert_eq!(wifi.status(), WifiStatus::Disconnected);

        wifi.connect("HomeNet", b"hunter22").unwrap();
        assert_eq!(wifi.status(), WifiStatus::Connecting);
        assert_eq!(wifi.status(), WifiStatus::Connecting);
        assert!(wifi.is_connected());
    }

    #[test]
    fn wrong_password_and_unknown_network() {
        let mut wifi = SimulatedWifi::new()
            .with_network(home(), b"hunter22")
            .with_connect_polls(0);

        wifi.connect("HomeNet", b"letmein").unwrap();
        assert_eq!(wifi.status(), WifiStatus::Failed(FailReason::AuthError));

        wifi.connect("Cafe", b"").unwrap();
        assert_eq!(wifi.status(), WifiStatus::Failed(FailReason::NetworkNotFound));
        assert_eq!(wifi.connect_attempts(), 2);
    }

    #[test]
    fn scan_refused_while_connecting() {
        let mut wifi = SimulatedWifi::new().with_network(home(), b"hunter22");
        assert_eq!(wifi.scan().unwrap(), vec![home()]);
        wifi.connect("HomeNet", b"hunter22").unwrap();
        assert_eq!(wifi.scan().unwrap_err(), SimulatedWifiError::RadioBusy);
    }

    #[test]
    fn failed_status_maps_to_wire() {
        assert_eq!(
            WifiStatus::Failed(FailReason::AuthError).station_state(),
            (WifiStationState::ConnectionFailed, FailReason::AuthError)
        );
    }
}
