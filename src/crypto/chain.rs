//! Chained HMAC-SHA1 record tags
//!
//! Every tunnel record carries a 4-byte tag over a running keyed state:
//!
//! ```text
//! tag(payload) = HMAC(state, payload)[..4]
//! state        = state . payload . tag(payload)
//! ```
//!
//! Two parties advancing from the same seed stay in lockstep exactly as long
//! as they observe the same payload sequence, which is what gives each record
//! authentication and replay resistance without a per-record key schedule.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::protocol::constants::HMAC_TAG_SIZE;

type HmacSha1 = Hmac<Sha1>;

/// Running tag state for one direction of a session.
#[derive(Clone)]
pub struct TagChain {
    mac: HmacSha1,
}

impl TagChain {
    /// Key the chain with the password and absorb the seed.
    pub fn new(password: &[u8], seed: &[u8]) -> Self {
        let mut mac = HmacSha1::new_from_slice(password).expect("HMAC accepts any key length");
        mac.update(seed);
        Self { mac }
    }

    /// Absorb bytes into the running state.
    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    /// Tag for the current state. Does not advance the chain.
    pub fn tag(&self) -> [u8; HMAC_TAG_SIZE] {
        let digest = self.mac.clone().finalize().into_bytes();
        let mut tag = [0u8; HMAC_TAG_SIZE];
        tag.copy_from_slice(&digest[..HMAC_TAG_SIZE]);
        tag
    }

    /// Absorb a payload, emit its tag, and absorb the tag as well: the full
    /// chain step used on the verified tunnel.
    pub fn tag_and_advance(&mut self, payload: &[u8]) -> [u8; HMAC_TAG_SIZE] {
        self.mac.update(payload);
        let tag = self.tag();
        self.mac.update(&tag);
        tag
    }

    /// Probe a payload against a candidate tag without touching the running
    /// state.
    pub fn matches(&self, payload: &[u8], candidate: &[u8]) -> bool {
        let mut probe = self.clone();
        probe.update(payload);
        let tag = probe.tag();
        tag[..].ct_eq(candidate).unwrap_u8() == 1
    }
}

impl std::fmt::Debug for TagChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TagChain")
    }
}

/// The three per-session chains derived from one server random.
///
/// `add` tags what the relay sends, `verify` recognises and then checks what
/// the client sends, and `ignore` lets a reader discard late echoes of
/// records tagged by its peer's `add` chain. The server-side reader never
/// arms `ignore`; it exists for the client end of the same record format.
pub struct SessionChains {
    pub add: TagChain,
    pub verify: TagChain,
    pub ignore: TagChain,
}

impl SessionChains {
    pub fn derive(password: &[u8], server_random: &[u8]) -> Self {
        let add = TagChain::new(password, server_random);
        let mut verify = add.clone();
        verify.update(b"C");
        let mut ignore = add.clone();
        ignore.update(b"S");
        Self { add, verify, ignore }
    }
}
