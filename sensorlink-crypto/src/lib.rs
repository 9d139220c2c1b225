//! SensorLink session cryptography
//!
//! - [`encrypt`]/[`decrypt`]: AES-256-CTR with an HMAC-SHA256 tag, keyed by
//!   a 32-byte [`SessionKey`]
//! - [`compute_mac`]/[`verify_mac`]: HMAC-SHA256 with a constant-time check
//! - [`KeyAgreement`]: the pluggable exchange that turns a proof of
//!   possession into a session key, with [`Spake2Agreement`] as the
//!   provided implementation
//!
//! # Example
//!
//! ```
//! use sensorlink_crypto::{SessionKey, decrypt, encrypt};
//!
//! let key = SessionKey::generate();
//! let message = encrypt(&key, b"ssid=HomeNet");
//! let opened = decrypt(&key, &message);
//! assert_eq!(opened.into_valid().as_deref(), Some(&b"ssid=HomeNet"[..]));
//! ```

mod agreement;
mod cipher;
mod key;
mod mac;

pub use agreement::{KeyAgreement, Role, SessionSecrets, Spake2Agreement};
pub use cipher::{DecryptedMessage, EncryptedMessage, IV_LEN, TAG_LEN, decrypt, encrypt};
pub use key::{SESSION_KEY_LEN, SessionKey};
pub use mac::{MAC_LEN, compute_mac, constant_time_eq, verify_mac};

/// Failures of the key agreement
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key agreement has not been started")]
    NotStarted,
    #[error("peer key agreement message rejected")]
    InvalidPeerMessage,
}
