//! Handshake messages exchanged on the `prov-session` endpoint
//!
//! The handshake runs in two rounds:
//!
//! 1. `Start`: both sides exchange key-agreement public values.
//! 2. `Verify`: both sides exchange key confirmations over the transcript.
//!
//! These messages are the only payloads besides `prov-version` that travel
//! unencrypted.

use std::io;

use crate::invalid_data;

const SESSION_START: u8 = 0x00;
const SESSION_START_RESPONSE: u8 = 0x01;
const SESSION_VERIFY: u8 = 0x02;
const SESSION_VERIFY_RESPONSE: u8 = 0x03;

/// Length of a key confirmation (HMAC-SHA256)
pub const CONFIRMATION_LEN: usize = 32;

/// Client to device handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// `[0x00][len: u16 BE][client_public]`
    Start { client_public: Vec<u8> },
    /// `[0x02][client_confirm: 32]`
    Verify { client_confirm: [u8; CONFIRMATION_LEN] },
}

/// Device to client handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResponse {
    /// `[0x01][status][len: u16 BE][device_public]`
    Start { status: u8, device_public: Vec<u8> },
    /// `[0x03][status][device_confirm: 32]`, zeroed unless status is success
    Verify {
        status: u8,
        device_confirm: [u8; CONFIRMATION_LEN],
    },
}

fn read_public(data: &[u8], what: &str) -> io::Result<Vec<u8>> {
    if data.len() < 2 {
        return Err(invalid_data(format!("{what} length missing")));
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() != 2 + len {
        return Err(invalid_data(format!("{what} length mismatch")));
    }
    Ok(data[2..].to_vec())
}

fn read_confirmation(data: &[u8], what: &str) -> io::Result<[u8; CONFIRMATION_LEN]> {
    data.try_into()
        .map_err(|_| invalid_data(format!("{what} must be {CONFIRMATION_LEN} bytes")))
}

fn write_public(buf: &mut Vec<u8>, public: &[u8]) {
    buf.extend_from_slice(&(public.len() as u16).to_be_bytes());
    buf.extend_from_slice(public);
}

impl SessionCommand {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SessionCommand::Start { client_public } => {
                let mut buf = Vec::with_capacity(3 + client_public.len());
                buf.push(SESSION_START);
                write_public(&mut buf, client_public);
                buf
            }
            SessionCommand::Verify { client_confirm } => {
                let mut buf = Vec::with_capacity(1 + CONFIRMATION_LEN);
                buf.push(SESSION_VERIFY);
                buf.extend_from_slice(client_confirm);
                buf
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        match data.split_first() {
            Some((&SESSION_START, rest)) => Ok(SessionCommand::Start {
                client_public: read_public(rest, "client public value")?,
            }),
            Some((&SESSION_VERIFY, rest)) => Ok(SessionCommand::Verify {
                client_confirm: read_confirmation(rest, "client confirmation")?,
            }),
            Some((other, _)) => Err(invalid_data(format!(
                "unknown session command 0x{other:02x}"
            ))),
            None => Err(invalid_data("session command empty")),
        }
    }
}

impl SessionResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SessionResponse::Start {
                status,
                device_public,
            } => {
                let mut buf = Vec::with_capacity(4 + device_public.len());
                buf.push(SESSION_START_RESPONSE);
                buf.push(*status);
                write_public(&mut buf, device_public);
                buf
            }
            SessionResponse::Verify {
                status,
                device_confirm,
            } => {
                let mut buf = Vec::with_capacity(2 + CONFIRMATION_LEN);
                buf.push(SESSION_VERIFY_RESPONSE);
                buf.push(*status);
                buf.extend_from_slice(device_confirm);
                buf
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < 2 {
            return Err(invalid_data("session response too short"));
        }
        let status = data[1];
        match data[0] {
            SESSION_START_RESPONSE => Ok(SessionResponse::Start {
                status,
                device_public: read_public(&data[2..], "device public value")?,
            }),
            SESSION_VERIFY_RESPONSE => Ok(SessionResponse::Verify {
                status,
                device_confirm: read_confirmation(&data[2..], "device confirmation")?,
            }),
            other => Err(invalid_data(format!(
                "unknown session response 0x{other:02x}"
            ))),
        }
    }
}
