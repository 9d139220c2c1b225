//! Password-authenticated key agreement
//!
//! The proof of possession printed on the device is the password. Each side
//! runs one [`KeyAgreement`], exchanges public messages, and derives
//! [`SessionSecrets`] from the shared secret plus the transcript
//! `client_public ‖ device_public`. Both sides then prove knowledge of the
//! secrets with an HMAC over the transcript before the session key is used.

use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use zeroize::Zeroizing;

use crate::CryptoError;
use crate::key::{SESSION_KEY_LEN, SessionKey, derive_key};
use crate::mac::{MAC_LEN, compute_mac, verify_mac};

const CLIENT_IDENTITY: &[u8] = b"sensorlink-client";
const DEVICE_IDENTITY: &[u8] = b"sensorlink-device";

const SESSION_KEY_INFO: &[u8] = b"sensorlink session key";
const CLIENT_CONFIRM_INFO: &[u8] = b"sensorlink client confirm";
const DEVICE_CONFIRM_INFO: &[u8] = b"sensorlink device confirm";

/// Which end of the exchange we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Device,
}

/// One run of a two-message key agreement
pub trait KeyAgreement: Send {
    /// Begin the exchange with the shared low-entropy secret and return our
    /// public message. Calling `start` again discards any earlier run.
    fn start(&mut self, role: Role, secret: &[u8]) -> Vec<u8>;

    /// Consume the peer's public message and return the shared secret.
    /// The in-progress state is discarded whatever the outcome.
    fn finish(&mut self, peer_message: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// SPAKE2 over Ed25519
#[derive(Default)]
pub struct Spake2Agreement {
    state: Option<Spake2<Ed25519Group>>,
}

impl Spake2Agreement {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyAgreement for Spake2Agreement {
    fn start(&mut self, role: Role, secret: &[u8]) -> Vec<u8> {
        let password = Password::new(secret);
        let id_a = Identity::new(CLIENT_IDENTITY);
        let id_b = Identity::new(DEVICE_IDENTITY);

        let (state, message) = match role {
            Role::Client => Spake2::<Ed25519Group>::start_a(&password, &id_a, &id_b),
            Role::Device => Spake2::<Ed25519Group>::start_b(&password, &id_a, &id_b),
        };
        self.state = Some(state);
        message
    }

    fn finish(&mut self, peer_message: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let state = self.state.take().ok_or(CryptoError::NotStarted)?;
        state
            .finish(peer_message)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::InvalidPeerMessage)
    }
}

impl std::fmt::Debug for Spake2Agreement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spake2Agreement")
            .field("started", &self.state.is_some())
            .finish()
    }
}

/// Keys derived from a completed agreement
pub struct SessionSecrets {
    session_key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    client_confirm_key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    device_confirm_key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    transcript: Vec<u8>,
}

impl SessionSecrets {
    /// HKDF-SHA256 over the shared secret, salted with `SHA-256(transcript)`
    pub fn derive(shared_secret: &[u8], client_public: &[u8], device_public: &[u8]) -> Self {
        let mut transcript = Vec::with_capacity(client_public.len() + device_public.len());
        transcript.extend_from_slice(client_public);
        transcript.extend_from_slice(device_public);
        let salt = Sha256::digest(&transcript);

        Self {
            session_key: derive_key(Some(&salt[..]), shared_secret, SESSION_KEY_INFO),
            client_confirm_key: derive_key(Some(&salt[..]), shared_secret, CLIENT_CONFIRM_INFO),
            device_confirm_key: derive_key(Some(&salt[..]), shared_secret, DEVICE_CONFIRM_INFO),
            transcript,
        }
    }

    fn confirm_key(&self, role: Role) -> &[u8] {
        match role {
            Role::Client => &self.client_confirm_key[..],
            Role::Device => &self.device_confirm_key[..],
        }
    }

    /// Key confirmation sent by `role`
    pub fn confirmation(&self, role: Role) -> [u8; MAC_LEN] {
        compute_mac(self.confirm_key(role), &self.transcript)
    }

    /// Check a confirmation received from `role`
    pub fn verify_confirmation(&self, role: Role, confirmation: &[u8]) -> bool {
        verify_mac(self.confirm_key(role), &self.transcript, confirmation)
    }

    pub fn into_session_key(self) -> SessionKey {
        SessionKey::from_zeroizing(self.session_key)
    }
}

impl std::fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecrets([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(client_pop: &[u8], device_pop: &[u8]) -> (SessionSecrets, SessionSecrets) {
        let mut client = Spake2Agreement::new();
        let mut device = Spake2Agreement::new();
        let client_public = client.start(Role::Client, client_pop);
        let device_public = device.start(Role::Device, device_pop);

        let client_shared = client.finish(&device_public).unwrap();
        let device_shared = device.finish(&client_public).unwrap();
        (
            SessionSecrets::derive(&client_shared, &client_public, &device_public),
            SessionSecrets::derive(&device_shared, &client_public, &device_public),
        )
    }

    #[test]
    fn matching_pop_agrees() {
        let (client, device) = run(b"abcd1234", b"abcd1234");
        assert!(device.verify_confirmation(Role::Client, &client.confirmation(Role::Client)));
        assert!(client.verify_confirmation(Role::Device, &device.confirmation(Role::Device)));
        assert_eq!(
            client.into_session_key().as_bytes(),
            device.into_session_key().as_bytes()
        );
    }

    #[test]
    fn wrong_pop_fails_confirmation() {
        let (client, device) = run(b"abcd1234", b"wrong-pop");
        assert!(!device.verify_confirmation(Role::Client, &client.confirmation(Role::Client)));
        assert!(!client.verify_confirmation(Role::Device, &device.confirmation(Role::Device)));
    }

    #[test]
    fn confirmations_are_role_bound() {
        let (client, device) = run(b"pop", b"pop");
        // a device echoing the client's confirmation back must not pass
        let echoed = client.confirmation(Role::Client);
        assert!(!client.verify_confirmation(Role::Device, &echoed));
        assert_ne!(
            device.confirmation(Role::Device),
            device.confirmation(Role::Client)
        );
    }

    #[test]
    fn finish_requires_start() {
        let mut agreement = Spake2Agreement::new();
        assert_eq!(
            agreement.finish(&[0; 33]).unwrap_err(),
            CryptoError::NotStarted
        );
    }

    #[test]
    fn malformed_peer_message_is_rejected() {
        let mut agreement = Spake2Agreement::new();
        agreement.start(Role::Client, b"pop");
        assert_eq!(
            agreement.finish(&[1, 2, 3]).unwrap_err(),
            CryptoError::InvalidPeerMessage
        );
        // state was consumed by the failed finish
        assert_eq!(
            agreement.finish(&[1, 2, 3]).unwrap_err(),
            CryptoError::NotStarted
        );
    }

    #[test]
    fn same_side_messages_are_rejected() {
        let mut a = Spake2Agreement::new();
        let mut b = Spake2Agreement::new();
        a.start(Role::Client, b"pop");
        let other_client = b.start(Role::Client, b"pop");
        assert!(a.finish(&other_client).is_err());
    }
}
