use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const SESSION_KEY_LEN: usize = 32;

/// 256-bit symmetric key protecting one provisioning session
///
/// The buffer is wiped when the key is dropped. The type is deliberately not
/// `Clone`: a session owns exactly one copy of its key.
pub struct SessionKey(Zeroizing<[u8; SESSION_KEY_LEN]>);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a key from a slice, which must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; SESSION_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }

    /// Fresh random key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    pub(crate) fn from_zeroizing(bytes: Zeroizing<[u8; SESSION_KEY_LEN]>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

/// HKDF-SHA256 expansion of `ikm` into a 32-byte key labelled by `info`
pub(crate) fn derive_key(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> Zeroizing<[u8; SESSION_KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}
