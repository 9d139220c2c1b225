//! Plaintext payloads of the `prov-scan` endpoint
//!
//! A Wi-Fi scan on the device is driven in three steps: start the scan,
//! poll its status until it reports finished, then page through results.

use std::io;

use crate::invalid_data;

pub const CMD_SCAN_START: u8 = 0x10;
pub const CMD_SCAN_STATUS: u8 = 0x11;
pub const CMD_SCAN_RESULT: u8 = 0x12;

/// Authentication mode of a scanned access point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WifiAuthMode {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
    Wpa2Wpa3Psk,
}

impl WifiAuthMode {
    pub fn as_u8(self) -> u8 {
        match self {
            WifiAuthMode::Open => 0,
            WifiAuthMode::Wep => 1,
            WifiAuthMode::WpaPsk => 2,
            WifiAuthMode::Wpa2Psk => 3,
            WifiAuthMode::WpaWpa2Psk => 4,
            WifiAuthMode::Wpa2Enterprise => 5,
            WifiAuthMode::Wpa3Psk => 6,
            WifiAuthMode::Wpa2Wpa3Psk => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => WifiAuthMode::Open,
            1 => WifiAuthMode::Wep,
            2 => WifiAuthMode::WpaPsk,
            3 => WifiAuthMode::Wpa2Psk,
            4 => WifiAuthMode::WpaWpa2Psk,
            5 => WifiAuthMode::Wpa2Enterprise,
            6 => WifiAuthMode::Wpa3Psk,
            7 => WifiAuthMode::Wpa2Wpa3Psk,
            _ => return None,
        })
    }

    /// True when joining requires a passphrase
    pub fn requires_password(self) -> bool {
        self != WifiAuthMode::Open
    }
}

/// Scan command, as sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    /// `[0x10][blocking: u8][period_ms: u16 BE]`
    Start { blocking: bool, period_ms: u16 },
    /// `[0x11]`
    Status,
    /// `[0x12][start: u16 BE][count: u8]`
    Result { start: u16, count: u8 },
}

impl ScanCommand {
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            ScanCommand::Start {
                blocking,
                period_ms,
            } => {
                let mut buf = vec![CMD_SCAN_START, blocking as u8];
                buf.extend_from_slice(&period_ms.to_be_bytes());
                buf
            }
            ScanCommand::Status => vec![CMD_SCAN_STATUS],
            ScanCommand::Result { start, count } => {
                let mut buf = vec![CMD_SCAN_RESULT];
                buf.extend_from_slice(&start.to_be_bytes());
                buf.push(count);
                buf
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        match data {
            [CMD_SCAN_START, blocking, p0, p1] => Ok(ScanCommand::Start {
                blocking: *blocking != 0,
                period_ms: u16::from_be_bytes([*p0, *p1]),
            }),
            [CMD_SCAN_STATUS] => Ok(ScanCommand::Status),
            [CMD_SCAN_RESULT, s0, s1, count] => Ok(ScanCommand::Result {
                start: u16::from_be_bytes([*s0, *s1]),
                count: *count,
            }),
            [] => Err(invalid_data("scan command empty")),
            [other, ..] => Err(invalid_data(format!(
                "unknown or malformed scan command 0x{other:02x}"
            ))),
        }
    }
}

/// Response to `Status`: `[status][finished: u8][count: u16 BE]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatusResponse {
    pub status: u8,
    pub finished: bool,
    pub count: u16,
}

impl ScanStatusResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.status, self.finished as u8];
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let [status, finished, c0, c1] = data else {
            return Err(invalid_data("scan status response must be 4 bytes"));
        };
        Ok(Self {
            status: *status,
            finished: *finished != 0,
            count: u16::from_be_bytes([*c0, *c1]),
        })
    }
}

/// One access point in a scan result page
///
/// `[ssid_len][ssid][channel][rssi: i8][auth][bssid: 6]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i8,
    pub auth_mode: WifiAuthMode,
    pub bssid: [u8; 6],
}

/// Response to `Result`: `[status][n: u8]` followed by `n` entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResultResponse {
    pub status: u8,
    pub entries: Vec<ScanEntry>,
}

impl ScanResultResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.status, self.entries.len() as u8];
        for entry in &self.entries {
            buf.push(entry.ssid.len() as u8);
            buf.extend_from_slice(entry.ssid.as_bytes());
            buf.push(entry.channel);
            buf.push(entry.rssi as u8);
            buf.push(entry.auth_mode.as_u8());
            buf.extend_from_slice(&entry.bssid);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < 2 {
            return Err(invalid_data("scan result response too short"));
        }
        let status = data[0];
        let count = data[1] as usize;
        let mut entries = Vec::with_capacity(count);
        let mut pos = 2;

        for _ in 0..count {
            let ssid_len = *data
                .get(pos)
                .ok_or_else(|| invalid_data("scan entry truncated"))? as usize;
            pos += 1;
            // ssid + channel + rssi + auth + bssid
            if data.len() < pos + ssid_len + 9 {
                return Err(invalid_data("scan entry truncated"));
            }
            let ssid = String::from_utf8_lossy(&data[pos..pos + ssid_len]).into_owned();
            pos += ssid_len;
            let channel = data[pos];
            let rssi = data[pos + 1] as i8;
            let auth = data[pos + 2];
            let auth_mode = WifiAuthMode::from_u8(auth)
                .ok_or_else(|| invalid_data(format!("unknown auth mode {auth}")))?;
            let bssid: [u8; 6] = data[pos + 3..pos + 9]
                .try_into()
                .map_err(|_| invalid_data("scan entry BSSID truncated"))?;
            pos += 9;

            entries.push(ScanEntry {
                ssid,
                channel,
                rssi,
                auth_mode,
                bssid,
            });
        }

        if pos != data.len() {
            return Err(invalid_data("scan result response has trailing bytes"));
        }

        Ok(Self { status, entries })
    }
}
