//! Frame protection: AES-256-CTR, then HMAC-SHA256 over `IV ‖ ciphertext`
//!
//! The tag is appended to the CTR output, so an [`EncryptedMessage`]'s
//! `ciphertext` is `CTR(plaintext) ‖ tag` and its wire form is
//! `IV ‖ CTR(plaintext) ‖ tag`.

use aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::key::{SessionKey, derive_key};
use crate::mac::{compute_mac, verify_mac};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;

const MAC_KEY_INFO: &[u8] = b"sensorlink frame mac";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub iv: [u8; IV_LEN],
    /// CTR output followed by the 32-byte tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IV_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Split a wire payload into IV and ciphertext. `None` if shorter than an IV.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (iv, ciphertext) = data.split_at_checked(IV_LEN)?;
        Some(Self {
            iv: iv.try_into().ok()?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Outcome of [`decrypt`]
///
/// An invalid message carries no plaintext at all, so there is nothing to
/// use by mistake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    plaintext: Vec<u8>,
    is_valid: bool,
}

impl DecryptedMessage {
    pub fn valid(plaintext: Vec<u8>) -> Self {
        Self {
            plaintext,
            is_valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            plaintext: Vec::new(),
            is_valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// Plaintext, empty when invalid
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    pub fn into_valid(self) -> Option<Vec<u8>> {
        self.is_valid.then_some(self.plaintext)
    }
}

fn mac_input(iv: &[u8; IV_LEN], body: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(IV_LEN + body.len());
    input.extend_from_slice(iv);
    input.extend_from_slice(body);
    input
}

/// Encrypt under a fresh random IV
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> EncryptedMessage {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut body = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&iv),
    );
    cipher.apply_keystream(&mut body);

    let mac_key = derive_key(None, key.as_bytes(), MAC_KEY_INFO);
    let tag = compute_mac(&mac_key[..], &mac_input(&iv, &body));
    body.extend_from_slice(&tag);

    EncryptedMessage {
        iv,
        ciphertext: body,
    }
}

/// Verify the tag, then decrypt. Never panics; every failure is `invalid()`.
pub fn decrypt(key: &SessionKey, message: &EncryptedMessage) -> DecryptedMessage {
    let Some(split) = message.ciphertext.len().checked_sub(TAG_LEN) else {
        return DecryptedMessage::invalid();
    };
    let (body, tag) = message.ciphertext.split_at(split);

    let mac_key = derive_key(None, key.as_bytes(), MAC_KEY_INFO);
    if !verify_mac(&mac_key[..], &mac_input(&message.iv, body), tag) {
        return DecryptedMessage::invalid();
    }

    let mut plaintext = body.to_vec();
    let mut cipher = Aes256Ctr::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&message.iv),
    );
    if cipher.try_apply_keystream(&mut plaintext).is_err() {
        return DecryptedMessage::invalid();
    }
    DecryptedMessage::valid(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes([0x5a; 32])
    }

    #[test]
    fn round_trip() {
        let key = key();
        for len in [0usize, 1, 15, 16, 17, 100, 1024] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let message = encrypt(&key, &plaintext);
            assert_eq!(message.ciphertext.len(), len + TAG_LEN);
            let opened = decrypt(&key, &message);
            assert!(opened.is_valid());
            assert_eq!(opened.plaintext(), &plaintext[..]);
        }
    }

    #[test]
    fn every_bit_flip_is_detected() {
        let key = key();
        let message = encrypt(&key, b"ssid=HomeNet;pass=hunter22");
        let wire = message.to_bytes();
        for byte in 0..wire.len() {
            for bit in 0..8 {
                let mut tampered = wire.clone();
                tampered[byte] ^= 1 << bit;
                let tampered = EncryptedMessage::from_bytes(&tampered).unwrap();
                let opened = decrypt(&key, &tampered);
                assert!(!opened.is_valid(), "flip at byte {byte} bit {bit}");
                assert!(opened.plaintext().is_empty());
            }
        }
    }

    #[test]
    fn wrong_key_is_invalid() {
        let message = encrypt(&key(), b"custom");
        let other = SessionKey::from_bytes([0xa5; 32]);
        assert_eq!(decrypt(&other, &message), DecryptedMessage::invalid());
    }

    #[test]
    fn short_ciphertext_is_invalid() {
        let key = key();
        let message = EncryptedMessage {
            iv: [0; IV_LEN],
            ciphertext: vec![0; TAG_LEN - 1],
        };
        assert!(!decrypt(&key, &message).is_valid());
        assert!(EncryptedMessage::from_bytes(&[0; IV_LEN - 1]).is_none());
    }

    #[test]
    fn ivs_are_fresh() {
        let key = key();
        let a = encrypt(&key, b"same");
        let b = encrypt(&key, b"same");
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn invalid_message_yields_no_plaintext() {
        assert_eq!(DecryptedMessage::invalid().into_valid(), None);
        assert_eq!(
            DecryptedMessage::valid(b"x".to_vec()).into_valid(),
            Some(b"x".to_vec())
        );
    }
}
