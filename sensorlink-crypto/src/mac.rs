use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const MAC_LEN: usize = 32;

/// HMAC-SHA256 of `data` keyed by `key`
pub fn compute_mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Recompute the MAC of `data` and compare it to `mac` in constant time
pub fn verify_mac(key: &[u8], data: &[u8], mac: &[u8]) -> bool {
    constant_time_eq(&compute_mac(key, data), mac)
}

/// Compare two buffers without an early exit on the first differing byte
///
/// Buffers of different lengths are unequal straight away; lengths are not
/// secret. Equal-length buffers are XOR-accumulated over every byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    std::hint::black_box(diff) == 0
}
