//! Client side of the `prov-session` handshake
//!
//! Both rounds travel in the clear. The proof of possession never leaves
//! this function: only the key-agreement public value and a key
//! confirmation go on the wire, so a wrong PoP is detected by the device
//! rejecting our confirmation.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use sensorlink_crypto::{KeyAgreement, Role, SessionKey, SessionSecrets};
use sensorlink_proto::{STATUS_INVALID_PROOF, STATUS_SUCCESS};
use sensorlink_proto::session::{SessionCommand, SessionResponse};
use tracing::{debug, info, warn};

use crate::error::HandshakeError;
use crate::transport::{ProvisioningTransport, exchange};

async fn round<T: ProvisioningTransport>(
    transport: &T,
    endpoint: &str,
    command: SessionCommand,
    timeout: Duration,
) -> Result<SessionResponse, HandshakeError> {
    let reply = exchange(transport, endpoint, command.to_bytes(), timeout).await?;
    SessionResponse::from_bytes(&reply).map_err(|e| HandshakeError::Malformed(e.to_string()))
}

/// Run the two-round handshake and return the session key
///
/// `agreement` is consumed by the run; pass a fresh one per attempt. On any
/// error the derived secrets are dropped (and wiped) before returning.
pub async fn establish_secure_session<T, K>(
    transport: &T,
    agreement: &mut K,
    pop: &SecretString,
    endpoint: &str,
    timeout: Duration,
) -> Result<SessionKey, HandshakeError>
where
    T: ProvisioningTransport,
    K: KeyAgreement,
{
    let client_public = agreement.start(Role::Client, pop.expose_secret().as_bytes());
    debug!(endpoint, "handshake round one");

    let start = SessionCommand::Start {
        client_public: client_public.clone(),
    };
    let device_public = match round(transport, endpoint, start, timeout).await? {
        SessionResponse::Start {
            status: STATUS_SUCCESS,
            device_public,
        } => device_public,
        SessionResponse::Start { status, .. } => return Err(HandshakeError::DeviceStatus(status)),
        SessionResponse::Verify { .. } => {
            return Err(HandshakeError::Malformed(
                "verify response to start".to_string(),
            ));
        }
    };

    let shared = agreement.finish(&device_public)?;
    let secrets = SessionSecrets::derive(&shared, &client_public, &device_public);
    drop(shared);

    debug!(endpoint, "handshake round two");
    let verify = SessionCommand::Verify {
        client_confirm: secrets.confirmation(Role::Client),
    };
    match round(transport, endpoint, verify, timeout).await? {
        SessionResponse::Verify {
            status: STATUS_SUCCESS,
            device_confirm,
        } => {
            if !secrets.verify_confirmation(Role::Device, &device_confirm) {
                warn!("device confirmation does not match");
                return Err(HandshakeError::Rejected);
            }
        }
        SessionResponse::Verify {
            status: STATUS_INVALID_PROOF,
            ..
        } => {
            warn!("device rejected our confirmation");
            return Err(HandshakeError::Rejected);
        }
        SessionResponse::Verify { status, .. } => return Err(HandshakeError::DeviceStatus(status)),
        SessionResponse::Start { .. } => {
            return Err(HandshakeError::Malformed(
                "start response to verify".to_string(),
            ));
        }
    }

    info!("secure session established");
    Ok(secrets.into_session_key())
}
