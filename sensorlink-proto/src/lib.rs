//! SensorLink wire protocol - endpoint names, frame envelope and command payloads
//!
//! Every message exchanged with a device travels inside a [`Frame`], which
//! names the logical endpoint the payload belongs to. The endpoint payloads
//! themselves are described in the submodules.

use std::io;

pub mod ble;
pub mod config;
pub mod scan;
pub mod session;
pub mod version;

/// Well-known endpoint names multiplexed over the provisioning channels
pub mod endpoints {
    /// Capability and protocol version query (plaintext JSON)
    pub const VERSION: &str = "prov-version";
    /// Secure session handshake (plaintext handshake messages)
    pub const SESSION: &str = "prov-session";
    /// Wi-Fi network discovery on the device
    pub const SCAN: &str = "prov-scan";
    /// Credential submission and status query
    pub const CONFIG: &str = "prov-config";
    /// Commit of previously submitted credentials
    pub const APPLY: &str = "prov-apply";
    /// Opaque application payload
    pub const CUSTOM_DATA: &str = "custom-data";

    pub const ALL: [&str; 6] = [VERSION, SESSION, SCAN, CONFIG, APPLY, CUSTOM_DATA];
}

// Response status codes, carried in the first byte of every response payload
pub const STATUS_SUCCESS: u8 = 0;
pub const STATUS_INVALID_STATE: u8 = 1;
pub const STATUS_INVALID_ARGUMENT: u8 = 2;
pub const STATUS_INVALID_PROOF: u8 = 3;
pub const STATUS_INTERNAL_ERROR: u8 = 4;

/// Human readable name of a response status code
pub fn status_name(status: u8) -> &'static str {
    match status {
        STATUS_SUCCESS => "success",
        STATUS_INVALID_STATE => "invalid state",
        STATUS_INVALID_ARGUMENT => "invalid argument",
        STATUS_INVALID_PROOF => "invalid proof",
        STATUS_INTERNAL_ERROR => "internal error",
        _ => "unknown status",
    }
}

/// Largest payload a frame may carry
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

pub(crate) fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Payload consisting of a single status byte
pub fn status_only(status: u8) -> Vec<u8> {
    vec![status]
}

/// Parse a payload consisting of a single status byte
pub fn parse_status(data: &[u8]) -> io::Result<u8> {
    match data {
        [status] => Ok(*status),
        [] => Err(invalid_data("status response empty")),
        _ => Err(invalid_data("status response has trailing bytes")),
    }
}

/// Frame: addresses a payload to a named endpoint
///
/// Wire layout: `[endpoint_len: u8][endpoint][seq: u32 BE][payload_len: u32 BE][payload]`
///
/// `seq` pairs a response with the request that caused it: the device copies
/// the request's number into its reply. Zero marks a frame that answers no
/// particular request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub endpoint: String,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Bytes between the endpoint name and the payload
const FRAME_TRAILER_HEADER: usize = 8;

impl Frame {
    pub fn new(endpoint: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            endpoint: endpoint.into(),
            seq: 0,
            payload,
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Encode the frame. Endpoint names are limited to 255 bytes, which
    /// configuration validation enforces before any frame is built.
    pub fn to_bytes(&self) -> Vec<u8> {
        debug_assert!(self.endpoint.len() <= u8::MAX as usize);
        let name = self.endpoint.as_bytes();
        let mut buf =
            Vec::with_capacity(1 + name.len() + FRAME_TRAILER_HEADER + self.payload.len());
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Total encoded length of the frame that `data` starts with, once enough
    /// of the header is present to tell
    ///
    /// `Ok(None)` means the header itself is still incomplete.
    pub fn encoded_len(data: &[u8]) -> io::Result<Option<usize>> {
        let Some((&name_len, rest)) = data.split_first() else {
            return Ok(None);
        };
        let name_len = name_len as usize;
        if name_len == 0 {
            return Err(invalid_data("frame endpoint empty"));
        }
        let header = name_len + FRAME_TRAILER_HEADER;
        if rest.len() < header {
            return Ok(None);
        }
        let len_bytes = &rest[name_len + 4..header];
        let payload_len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        // Sanity check
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(invalid_data("frame too large"));
        }
        Ok(Some(1 + header + payload_len))
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let total = match Self::encoded_len(data)? {
            Some(total) => total,
            None if data.is_empty() => return Err(invalid_data("frame empty")),
            None => return Err(invalid_data("frame header truncated")),
        };
        if data.len() != total {
            return Err(invalid_data(format!(
                "frame payload length mismatch: header says {total} bytes in all, got {}",
                data.len()
            )));
        }

        let name_len = data[0] as usize;
        let endpoint = std::str::from_utf8(&data[1..1 + name_len])
            .map_err(|_| invalid_data("frame endpoint is not utf-8"))?
            .to_string();
        let seq_bytes = &data[1 + name_len..5 + name_len];
        let seq = u32::from_be_bytes([seq_bytes[0], seq_bytes[1], seq_bytes[2], seq_bytes[3]]);

        Ok(Self {
            endpoint,
            seq,
            payload: data[1 + name_len + FRAME_TRAILER_HEADER..].to_vec(),
        })
    }
}

/// Rebuilds whole frames from a byte stream that may split or join them
///
/// Links with a small maximum transfer unit deliver a long frame in pieces.
/// Feed each piece to [`push`](FrameAssembler::push) and it hands back every
/// frame the pieces complete.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the encoded frames it completes, in order
    ///
    /// A header that cannot start a valid frame discards everything buffered
    /// so far, as there is no way to find the next frame boundary.
    pub fn push(&mut self, chunk: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let total = match Frame::encoded_len(&self.buf) {
                Ok(Some(total)) if self.buf.len() >= total => total,
                Ok(_) => return Ok(frames),
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            };
            let rest = self.buf.split_off(total);
            frames.push(std::mem::replace(&mut self.buf, rest));
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
