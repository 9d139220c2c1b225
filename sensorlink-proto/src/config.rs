//! Plaintext payloads of the `prov-config` and `prov-apply` endpoints
//!
//! These payloads are encrypted with the session key before they are framed.

use std::io;

use crate::invalid_data;

pub const CMD_SET_CONFIG: u8 = 0x01;
pub const CMD_GET_STATUS: u8 = 0x02;
pub const CMD_APPLY: u8 = 0x03;

/// Longest SSID allowed by 802.11
pub const MAX_SSID_LEN: usize = 32;

/// Longest WPA passphrase
pub const MAX_PASSWORD_LEN: usize = 64;

/// Station state reported by the device after applying credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStationState {
    Connected,
    Connecting,
    Disconnected,
    ConnectionFailed,
}

impl WifiStationState {
    pub fn as_u8(self) -> u8 {
        match self {
            WifiStationState::Connected => 0,
            WifiStationState::Connecting => 1,
            WifiStationState::Disconnected => 2,
            WifiStationState::ConnectionFailed => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WifiStationState::Connected),
            1 => Some(WifiStationState::Connecting),
            2 => Some(WifiStationState::Disconnected),
            3 => Some(WifiStationState::ConnectionFailed),
            _ => None,
        }
    }
}

/// Why the station failed to join, meaningful with `ConnectionFailed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    None,
    AuthError,
    NetworkNotFound,
}

impl FailReason {
    pub fn as_u8(self) -> u8 {
        match self {
            FailReason::None => 0,
            FailReason::AuthError => 1,
            FailReason::NetworkNotFound => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FailReason::None),
            1 => Some(FailReason::AuthError),
            2 => Some(FailReason::NetworkNotFound),
            _ => None,
        }
    }
}

/// Encode a SetConfig command: `[0x01][ssid_len][ssid][pass_len][pass]`
///
/// The caller owns the returned buffer and is expected to wipe it once it
/// has been encrypted, since it carries the passphrase in the clear.
pub fn set_config(ssid: &str, password: &[u8]) -> io::Result<Vec<u8>> {
    if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("SSID must be 1 to {MAX_SSID_LEN} bytes"),
        ));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("password must be at most {MAX_PASSWORD_LEN} bytes"),
        ));
    }

    let mut buf = Vec::with_capacity(3 + ssid.len() + password.len());
    buf.push(CMD_SET_CONFIG);
    buf.push(ssid.len() as u8);
    buf.extend_from_slice(ssid.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password);
    Ok(buf)
}

/// Encode a GetStatus command
pub fn get_status() -> Vec<u8> {
    vec![CMD_GET_STATUS]
}

/// Encode an Apply command
pub fn apply() -> Vec<u8> {
    vec![CMD_APPLY]
}

/// Decoded config command, as seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    SetConfig { ssid: String, password: Vec<u8> },
    GetStatus,
    Apply,
}

impl ConfigCommand {
    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        match data.split_first() {
            Some((&CMD_SET_CONFIG, rest)) => {
                let (&ssid_len, rest) = rest
                    .split_first()
                    .ok_or_else(|| invalid_data("SetConfig SSID length missing"))?;
                let ssid_len = ssid_len as usize;
                if rest.len() < ssid_len + 1 {
                    return Err(invalid_data("SetConfig SSID truncated"));
                }
                let ssid = String::from_utf8(rest[..ssid_len].to_vec())
                    .map_err(|_| invalid_data("SetConfig SSID is not utf-8"))?;
                let pass_len = rest[ssid_len] as usize;
                let password = &rest[ssid_len + 1..];
                if password.len() != pass_len {
                    return Err(invalid_data("SetConfig password length mismatch"));
                }
                Ok(ConfigCommand::SetConfig {
                    ssid,
                    password: password.to_vec(),
                })
            }
            Some((&CMD_GET_STATUS, [])) => Ok(ConfigCommand::GetStatus),
            Some((&CMD_APPLY, [])) => Ok(ConfigCommand::Apply),
            Some((other, _)) => Err(invalid_data(format!(
                "unknown or malformed config command 0x{other:02x}"
            ))),
            None => Err(invalid_data("config command empty")),
        }
    }
}

/// Response to GetStatus: `[status][state][fail_reason]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: u8,
    pub state: WifiStationState,
    pub fail_reason: FailReason,
}

impl StatusResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![self.status, self.state.as_u8(), self.fail_reason.as_u8()]
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let [status, state, reason] = data else {
            return Err(invalid_data("status response must be 3 bytes"));
        };
        Ok(Self {
            status: *status,
            state: WifiStationState::from_u8(*state)
                .ok_or_else(|| invalid_data(format!("unknown station state {state}")))?,
            fail_reason: FailReason::from_u8(*reason)
                .ok_or_else(|| invalid_data(format!("unknown fail reason {reason}")))?,
        })
    }
}
