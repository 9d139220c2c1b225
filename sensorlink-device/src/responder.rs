//! Device-side protocol handler
//!
//! [`DeviceResponder`] consumes request frames as they arrive on the config
//! channel and produces the response frame to send back on the session
//! channel. It owns the proof of possession, the handshake state and the
//! session key, and drives a [`Wifi`] station.

use sensorlink_crypto::{
    DecryptedMessage, EncryptedMessage, KeyAgreement, Role, SessionKey, SessionSecrets,
    Spake2Agreement, decrypt, encrypt,
};
use sensorlink_proto::config::{
    ConfigCommand, FailReason, MAX_PASSWORD_LEN, MAX_SSID_LEN, StatusResponse, WifiStationState,
};
use sensorlink_proto::scan::{ScanCommand, ScanEntry, ScanResultResponse, ScanStatusResponse};
use sensorlink_proto::session::{CONFIRMATION_LEN, SessionCommand, SessionResponse};
use sensorlink_proto::version::{CAP_CUSTOM_DATA, CAP_WIFI_SCAN, VersionInfo};
use sensorlink_proto::{
    Frame, STATUS_INTERNAL_ERROR, STATUS_INVALID_ARGUMENT, STATUS_INVALID_PROOF,
    STATUS_INVALID_STATE, STATUS_SUCCESS, endpoints, status_only,
};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::wifi::{ScanResult, Wifi};

/// Protocol version reported on `prov-version`
pub const PROTOCOL_VERSION: &str = "v1.1";

/// Handler for `custom-data` payloads: request bytes in, reply bytes out
pub type CustomDataHandler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

enum Handshake {
    Idle,
    AwaitingConfirmation(SessionSecrets),
    Established(SessionKey),
}

struct StagedCredentials {
    ssid: String,
    password: Zeroizing<Vec<u8>>,
}

pub struct DeviceResponder<W, K = Spake2Agreement> {
    pop: Zeroizing<Vec<u8>>,
    agreement: K,
    handshake: Handshake,
    wifi: W,
    staged: Option<StagedCredentials>,
    applied: bool,
    scan_results: Option<Vec<ScanResult>>,
    custom_data: Option<CustomDataHandler>,
}

impl<W: Wifi> DeviceResponder<W> {
    pub fn new(pop: &[u8], wifi: W) -> Self {
        Self::with_agreement(pop, wifi, Spake2Agreement::new())
    }
}

impl<W: Wifi, K: KeyAgreement> DeviceResponder<W, K> {
    pub fn with_agreement(pop: &[u8], wifi: W, agreement: K) -> Self {
        Self {
            pop: Zeroizing::new(pop.to_vec()),
            agreement,
            handshake: Handshake::Idle,
            wifi,
            staged: None,
            applied: false,
            scan_results: None,
            custom_data: None,
        }
    }

    /// Accept `custom-data` and advertise the capability
    pub fn with_custom_data(mut self, handler: CustomDataHandler) -> Self {
        self.custom_data = Some(handler);
        self
    }

    /// True once a client has completed the handshake
    pub fn is_secure(&self) -> bool {
        matches!(self.handshake, Handshake::Established(_))
    }

    pub fn wifi(&self) -> &W {
        &self.wifi
    }

    pub fn wifi_mut(&mut self) -> &mut W {
        &mut self.wifi
    }

    /// Drop the session, as on a BLE disconnect
    pub fn reset_session(&mut self) {
        self.handshake = Handshake::Idle;
        self.staged = None;
    }

    pub fn version_info(&self) -> VersionInfo {
        let mut caps = vec![CAP_WIFI_SCAN];
        if self.custom_data.is_some() {
            caps.push(CAP_CUSTOM_DATA);
        }
        VersionInfo::new(PROTOCOL_VERSION, &caps)
    }

    /// Handle one inbound frame, returning the encoded response frame
    ///
    /// The response carries the request's sequence number. Undecodable
    /// frames and unknown endpoints produce no response.
    pub fn handle_frame(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let frame = match Frame::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return None;
            }
        };
        debug!(endpoint = %frame.endpoint, seq = frame.seq, len = frame.payload.len(), "request");

        let payload = match frame.endpoint.as_str() {
            endpoints::VERSION => self.version_info().to_bytes(),
            endpoints::SESSION => self.handle_session(&frame.payload).to_bytes(),
            endpoints::SCAN => self.secure(&frame.payload, Self::handle_scan),
            endpoints::CONFIG => self.secure(&frame.payload, Self::handle_config),
            endpoints::APPLY => self.secure(&frame.payload, Self::handle_apply),
            endpoints::CUSTOM_DATA => self.secure(&frame.payload, Self::handle_custom_data),
            other => {
                warn!(endpoint = %other, "unknown endpoint");
                return None;
            }
        };
        Some(Frame::new(frame.endpoint, payload).with_seq(frame.seq).to_bytes())
    }

    fn handle_session(&mut self, payload: &[u8]) -> SessionResponse {
        let command = match SessionCommand::from_bytes(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "malformed session command");
                return SessionResponse::Start {
                    status: STATUS_INVALID_ARGUMENT,
                    device_public: Vec::new(),
                };
            }
        };

        match command {
            SessionCommand::Start { client_public } => {
                // A new handshake always replaces the current session
                self.reset_session();
                let device_public = self.agreement.start(Role::Device, &self.pop);
                let shared = match self.agreement.finish(&client_public) {
                    Ok(shared) => shared,
                    Err(e) => {
                        warn!(error = %e, "session start rejected");
                        return SessionResponse::Start {
                            status: STATUS_INVALID_ARGUMENT,
                            device_public: Vec::new(),
                        };
                    }
                };
                let secrets = SessionSecrets::derive(&shared, &client_public, &device_public);
                self.handshake = Handshake::AwaitingConfirmation(secrets);
                SessionResponse::Start {
                    status: STATUS_SUCCESS,
                    device_public,
                }
            }
            SessionCommand::Verify { client_confirm } => {
                let rejected = |status| SessionResponse::Verify {
                    status,
                    device_confirm: [0; CONFIRMATION_LEN],
                };
                let secrets = match std::mem::replace(&mut self.handshake, Handshake::Idle) {
                    Handshake::AwaitingConfirmation(secrets) => secrets,
                    other => {
                        self.handshake = other;
                        warn!("session verify without a pending handshake");
                        return rejected(STATUS_INVALID_STATE);
                    }
                };
                if !secrets.verify_confirmation(Role::Client, &client_confirm) {
                    warn!("client failed proof of possession");
                    return rejected(STATUS_INVALID_PROOF);
                }
                let device_confirm = secrets.confirmation(Role::Device);
                self.handshake = Handshake::Established(secrets.into_session_key());
                info!("secure session established");
                SessionResponse::Verify {
                    status: STATUS_SUCCESS,
                    device_confirm,
                }
            }
        }
    }

    /// Decrypt `payload`, run `handler` on the plaintext and encrypt its reply
    ///
    /// Without a session, or when the payload fails authentication, the
    /// response payload is empty.
    fn secure(&mut self, payload: &[u8], handler: fn(&mut Self, &[u8]) -> Vec<u8>) -> Vec<u8> {
        let Handshake::Established(key) = &self.handshake else {
            warn!("encrypted request before session established");
            return Vec::new();
        };
        let plaintext = EncryptedMessage::from_bytes(payload)
            .map(|message| decrypt(key, &message))
            .and_then(DecryptedMessage::into_valid);
        let Some(plaintext) = plaintext.map(Zeroizing::new) else {
            warn!("request failed authentication");
            return Vec::new();
        };

        let reply = Zeroizing::new(handler(self, &plaintext));

        match &self.handshake {
            Handshake::Established(key) => encrypt(key, &reply).to_bytes(),
            _ => Vec::new(),
        }
    }

    fn handle_scan(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let command = match ScanCommand::from_bytes(plaintext) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "malformed scan command");
                return status_only(STATUS_INVALID_ARGUMENT);
            }
        };

        match command {
            ScanCommand::Start {
                blocking,
                period_ms,
            } => {
                debug!(blocking, period_ms, "wifi scan requested");
                match self.wifi.scan() {
                    Ok(results) => {
                        info!(count = results.len(), "wifi scan finished");
                        self.scan_results = Some(results);
                        status_only(STATUS_SUCCESS)
                    }
                    Err(e) => {
                        warn!(error = %e, "wifi scan failed");
                        self.scan_results = None;
                        status_only(STATUS_INTERNAL_ERROR)
                    }
                }
            }
            ScanCommand::Status => ScanStatusResponse {
                status: STATUS_SUCCESS,
                finished: self.scan_results.is_some(),
                count: self
                    .scan_results
                    .as_ref()
                    .map_or(0, |r| r.len().min(u16::MAX as usize) as u16),
            }
            .to_bytes(),
            ScanCommand::Result { start, count } => {
                let Some(results) = &self.scan_results else {
                    return ScanResultResponse {
                        status: STATUS_INVALID_STATE,
                        entries: Vec::new(),
                    }
                    .to_bytes();
                };
                let start = start as usize;
                if start > results.len() {
                    return ScanResultResponse {
                        status: STATUS_INVALID_ARGUMENT,
                        entries: Vec::new(),
                    }
                    .to_bytes();
                }
                let end = (start + count as usize).min(results.len());
                let entries = results[start..end]
                    .iter()
                    .map(|r| ScanEntry {
                        ssid: r.ssid.clone(),
                        channel: r.channel,
                        rssi: r.rssi,
                        auth_mode: r.auth_mode,
                        bssid: r.bssid,
                    })
                    .collect();
                ScanResultResponse {
                    status: STATUS_SUCCESS,
                    entries,
                }
                .to_bytes()
            }
        }
    }

    fn handle_config(&mut self, plaintext: &[u8]) -> Vec<u8> {
        match ConfigCommand::from_bytes(plaintext) {
            Ok(ConfigCommand::SetConfig { ssid, password }) => {
                let password = Zeroizing::new(password);
                if ssid.is_empty() || ssid.len() > MAX_SSID_LEN || password.len() > MAX_PASSWORD_LEN
                {
                    warn!("credentials out of bounds");
                    return status_only(STATUS_INVALID_ARGUMENT);
                }
                info!(ssid = %ssid, "credentials received");
                self.staged = Some(StagedCredentials { ssid, password });
                self.applied = false;
                status_only(STATUS_SUCCESS)
            }
            Ok(ConfigCommand::GetStatus) => {
                let (state, fail_reason) = if self.applied {
                    self.wifi.status().station_state()
                } else {
                    (WifiStationState::Disconnected, FailReason::None)
                };
                StatusResponse {
                    status: STATUS_SUCCESS,
                    state,
                    fail_reason,
                }
                .to_bytes()
            }
            Ok(ConfigCommand::Apply) => {
                warn!("apply sent to the config endpoint");
                status_only(STATUS_INVALID_ARGUMENT)
            }
            Err(e) => {
                warn!(error = %e, "malformed config command");
                status_only(STATUS_INVALID_ARGUMENT)
            }
        }
    }

    fn handle_apply(&mut self, plaintext: &[u8]) -> Vec<u8> {
        if !matches!(ConfigCommand::from_bytes(plaintext), Ok(ConfigCommand::Apply)) {
            warn!("malformed apply command");
            return status_only(STATUS_INVALID_ARGUMENT);
        }
        let Some(staged) = &self.staged else {
            warn!("apply without staged credentials");
            return status_only(STATUS_INVALID_STATE);
        };
        // the client repeats Apply when our acknowledgement is lost
        if self.applied {
            debug!(ssid = %staged.ssid, "apply repeated, already joining");
            return status_only(STATUS_SUCCESS);
        }

        match self.wifi.connect(&staged.ssid, &staged.password) {
            Ok(()) => {
                info!(ssid = %staged.ssid, "joining network");
                self.applied = true;
                status_only(STATUS_SUCCESS)
            }
            Err(e) => {
                warn!(error = %e, "failed to start joining network");
                status_only(STATUS_INTERNAL_ERROR)
            }
        }
    }

    fn handle_custom_data(&mut self, plaintext: &[u8]) -> Vec<u8> {
        match self.custom_data.as_mut() {
            Some(handler) => handler(plaintext),
            None => {
                debug!("custom data ignored, no handler installed");
                Vec::new()
            }
        }
    }
}

impl<W, K> std::fmt::Debug for DeviceResponder<W, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handshake = match self.handshake {
            Handshake::Idle => "idle",
            Handshake::AwaitingConfirmation(_) => "awaiting confirmation",
            Handshake::Established(_) => "established",
        };
        f.debug_struct("DeviceResponder")
            .field("handshake", &handshake)
            .field("applied", &self.applied)
            .finish_non_exhaustive()
    }
}
