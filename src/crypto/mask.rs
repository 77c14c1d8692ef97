//! Keystream masking for rewritten cover records

use sha2::{Digest, Sha256};

/// Derive the keystream used to mask cover payloads during the server-hello
/// rewrite window: `SHA-256(password || server_random)`. The client unmasks
/// with the same construction, so the output must stay byte-exact.
pub fn mask_key(password: &[u8], server_random: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(server_random);
    hasher.finalize().into()
}

/// XOR `data` with `key`, wrapping around when the payload outruns the key.
pub fn xor_slice(data: &mut [u8], key: &[u8]) {
    for (byte, &k) in data.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}
