//! Pseudorandom

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Global secure random instance
pub static SECURE_RANDOM: Lazy<SecureRandom> = Lazy::new(SecureRandom::new);

/// Process-wide CSPRNG behind a lock, used for alert-record padding.
pub struct SecureRandom {
    inner: Mutex<StdRng>,
}

impl SecureRandom {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fill a buffer with random bytes
    pub fn fill(&self, buf: &mut [u8]) {
        self.inner.lock().fill_bytes(buf);
    }

    /// Generate random bytes
    pub fn bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf);
        buf
    }
}

impl Default for SecureRandom {
    fn default() -> Self {
        Self::new()
    }
}
