//! ClientHello authentication and ServerHello inspection

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use super::constants::*;
use crate::error::{RelayError, Result};

type HmacSha1 = Hmac<Sha1>;

/// An account allowed through the relay. Several users may share one
/// listener; authentication reports which one matched.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub password: Vec<u8>,
}

impl User {
    pub fn new(name: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }
}

/// Verify a candidate ClientHello record against the user table.
///
/// The last 4 bytes of the 32-byte session id carry
/// `HMAC-SHA1(password, record-with-those-bytes-zeroed)[..4]`, computed over
/// the record payload (header excluded). The first user whose password
/// reproduces the tag wins; callers should keep passwords distinct.
pub fn verify_client_hello<'a>(frame: &[u8], users: &'a [User]) -> Result<&'a User> {
    const MIN_LEN: usize =
        TLS_HEADER_SIZE + 1 + 3 + 2 + TLS_RANDOM_SIZE + 1 + TLS_SESSION_ID_SIZE;
    const HMAC_INDEX: usize = SESSION_ID_LENGTH_INDEX + 1 + TLS_SESSION_ID_SIZE - HMAC_TAG_SIZE;

    if frame.len() < MIN_LEN {
        return Err(RelayError::ShortRead);
    }
    if frame[0] != CONTENT_HANDSHAKE {
        return Err(RelayError::UnexpectedRecordType(frame[0]));
    }
    if frame[TLS_HEADER_SIZE] != HANDSHAKE_CLIENT_HELLO {
        return Err(RelayError::UnexpectedHandshakeType(frame[TLS_HEADER_SIZE]));
    }
    if frame[SESSION_ID_LENGTH_INDEX] != TLS_SESSION_ID_SIZE as u8 {
        return Err(RelayError::BadSessionIdLength(frame[SESSION_ID_LENGTH_INDEX]));
    }

    for user in users {
        let mut mac = HmacSha1::new_from_slice(&user.password)
            .expect("HMAC accepts any key length");
        mac.update(&frame[TLS_HEADER_SIZE..HMAC_INDEX]);
        mac.update(&[0u8; HMAC_TAG_SIZE]);
        mac.update(&frame[HMAC_INDEX + HMAC_TAG_SIZE..]);
        let digest = mac.finalize().into_bytes();

        if frame[HMAC_INDEX..HMAC_INDEX + HMAC_TAG_SIZE]
            .ct_eq(&digest[..HMAC_TAG_SIZE])
            .unwrap_u8()
            == 1
        {
            return Ok(user);
        }
    }

    Err(RelayError::HmacMismatch)
}

/// Pull the 32-byte server random out of a ServerHello record, if the record
/// is shaped like one. No further validation.
pub fn extract_server_random(frame: &[u8]) -> Option<[u8; TLS_RANDOM_SIZE]> {
    const MIN_LEN: usize = TLS_HEADER_SIZE + 1 + 3 + 2 + TLS_RANDOM_SIZE;

    if frame.len() < MIN_LEN
        || frame[0] != CONTENT_HANDSHAKE
        || frame[TLS_HEADER_SIZE] != HANDSHAKE_SERVER_HELLO
    {
        return None;
    }

    frame[SERVER_RANDOM_INDEX..SERVER_RANDOM_INDEX + TLS_RANDOM_SIZE]
        .try_into()
        .ok()
}

/// Whether the ServerHello selects TLS 1.3 through the supported_versions
/// extension. Advisory only: the caller uses it to decide between the
/// tunneled phase and a transparent copy.
pub fn is_server_hello_tls13(frame: &[u8]) -> bool {
    fn read_u8(buf: &mut &[u8]) -> Option<u8> {
        let (&value, rest) = buf.split_first()?;
        *buf = rest;
        Some(value)
    }

    fn read_u16(buf: &mut &[u8]) -> Option<u16> {
        if buf.len() < 2 {
            return None;
        }
        let value = u16::from_be_bytes([buf[0], buf[1]]);
        *buf = &buf[2..];
        Some(value)
    }

    fn skip(buf: &mut &[u8], n: usize) -> Option<()> {
        if buf.len() < n {
            return None;
        }
        *buf = &buf[n..];
        Some(())
    }

    let mut rest = match frame.get(SESSION_ID_LENGTH_INDEX..) {
        Some(r) => r,
        None => return false,
    };

    let parse = |rest: &mut &[u8]| -> Option<bool> {
        let session_id_len = read_u8(rest)? as usize;
        skip(rest, session_id_len)?;
        // cipher suite + compression method
        skip(rest, 3)?;

        let ext_list_len = read_u16(rest)? as usize;
        if rest.len() < ext_list_len {
            return None;
        }
        let mut exts = &rest[..ext_list_len];

        while !exts.is_empty() {
            let ext_type = read_u16(&mut exts)?;
            let ext_len = read_u16(&mut exts)? as usize;
            if ext_type != EXT_SUPPORTED_VERSIONS {
                skip(&mut exts, ext_len)?;
                continue;
            }
            if ext_len != 2 {
                return None;
            }
            return Some(read_u16(&mut exts)? == TLS13_WIRE_VERSION);
        }
        None
    };

    parse(&mut rest).unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build a minimal authenticating ClientHello: header, handshake header,
    /// version, client random, and a 32-byte session id whose last 4 bytes
    /// are the HMAC tag for `password`.
    pub fn build_client_hello(password: &[u8], session_prefix: &[u8; 28]) -> Vec<u8> {
        let body_len: usize = 1 + 3 + 2 + TLS_RANDOM_SIZE + 1 + TLS_SESSION_ID_SIZE;
        let mut frame = Vec::with_capacity(TLS_HEADER_SIZE + body_len);
        frame.push(CONTENT_HANDSHAKE);
        frame.extend_from_slice(&[0x03, 0x01]);
        frame.extend_from_slice(&(body_len as u16).to_be_bytes());
        frame.push(HANDSHAKE_CLIENT_HELLO);
        frame.extend_from_slice(&((body_len as u32 - 4).to_be_bytes())[1..]);
        frame.extend_from_slice(&TLS_LEGACY_VERSION);
        frame.extend_from_slice(&[0x5a; TLS_RANDOM_SIZE]);
        frame.push(TLS_SESSION_ID_SIZE as u8);
        frame.extend_from_slice(session_prefix);
        frame.extend_from_slice(&[0u8; HMAC_TAG_SIZE]);

        let mut mac = HmacSha1::new_from_slice(password).unwrap();
        mac.update(&frame[TLS_HEADER_SIZE..]);
        let digest = mac.finalize().into_bytes();
        let tag_at = frame.len() - HMAC_TAG_SIZE;
        frame[tag_at..].copy_from_slice(&digest[..HMAC_TAG_SIZE]);
        frame
    }

    /// Build a ServerHello with the given random, an empty session id and,
    /// optionally, a supported_versions extension selecting TLS 1.3.
    pub fn build_server_hello(server_random: &[u8; 32], tls13: bool) -> Vec<u8> {
        let mut extensions: Vec<u8> = Vec::new();
        // a filler extension the parser must step over
        extensions.extend_from_slice(&[0x00, 0x33, 0x00, 0x02, 0xab, 0xcd]);
        if tls13 {
            extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);
        }

        let mut body: Vec<u8> = Vec::new();
        body.extend_from_slice(&TLS_LEGACY_VERSION);
        body.extend_from_slice(server_random);
        body.push(0); // empty session id
        body.extend_from_slice(&[0x13, 0x01]); // cipher suite
        body.push(0x00); // compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut frame = Vec::new();
        frame.push(CONTENT_HANDSHAKE);
        frame.extend_from_slice(&TLS_LEGACY_VERSION);
        frame.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        frame.push(HANDSHAKE_SERVER_HELLO);
        frame.extend_from_slice(&((body.len() as u32).to_be_bytes())[1..]);
        frame.extend_from_slice(&body);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{build_client_hello, build_server_hello};
    use super::*;

    fn users() -> Vec<User> {
        vec![
            User::new("alice", b"hunter2".to_vec()),
            User::new("bob", b"swordfish".to_vec()),
        ]
    }

    #[test]
    fn test_authenticates_matching_user() {
        let frame = build_client_hello(b"swordfish", &[7u8; 28]);
        let users = users();
        let user = verify_client_hello(&frame, &users).unwrap();
        assert_eq!(user.name, "bob");
    }

    #[test]
    fn test_bit_flip_outside_tag_fails() {
        let good = build_client_hello(b"hunter2", &[1u8; 28]);
        assert!(verify_client_hello(&good, &users()).is_ok());

        // Flip one bit in a handful of positions outside the tag region.
        for &pos in &[6usize, 12, 40, 50, 71] {
            let mut frame = good.clone();
            frame[pos] ^= 0x01;
            // Offsets 0, 5 and 43 are structural; these positions only break
            // the MAC.
            assert!(
                matches!(verify_client_hello(&frame, &users()), Err(RelayError::HmacMismatch)),
                "flip at {pos} should fail authentication"
            );
        }
    }

    #[test]
    fn test_rejects_malformed_hello() {
        let good = build_client_hello(b"hunter2", &[2u8; 28]);

        assert!(matches!(
            verify_client_hello(&good[..60], &users()),
            Err(RelayError::ShortRead)
        ));

        let mut frame = good.clone();
        frame[0] = CONTENT_APPLICATION_DATA;
        assert!(matches!(
            verify_client_hello(&frame, &users()),
            Err(RelayError::UnexpectedRecordType(0x17))
        ));

        let mut frame = good.clone();
        frame[TLS_HEADER_SIZE] = HANDSHAKE_SERVER_HELLO;
        assert!(matches!(
            verify_client_hello(&frame, &users()),
            Err(RelayError::UnexpectedHandshakeType(0x02))
        ));

        let mut frame = good;
        frame[SESSION_ID_LENGTH_INDEX] = 16;
        assert!(matches!(
            verify_client_hello(&frame, &users()),
            Err(RelayError::BadSessionIdLength(16))
        ));
    }

    #[test]
    fn test_unknown_password_rejected() {
        let frame = build_client_hello(b"letmein", &[3u8; 28]);
        assert!(matches!(
            verify_client_hello(&frame, &users()),
            Err(RelayError::HmacMismatch)
        ));
    }

    #[test]
    fn test_extract_server_random() {
        let random: [u8; 32] = std::array::from_fn(|i| i as u8);
        let frame = build_server_hello(&random, true);
        assert_eq!(extract_server_random(&frame), Some(random));

        // Wrong handshake type
        let mut bad = frame.clone();
        bad[TLS_HEADER_SIZE] = HANDSHAKE_CLIENT_HELLO;
        assert_eq!(extract_server_random(&bad), None);

        // Too short
        assert_eq!(extract_server_random(&frame[..40]), None);
    }

    #[test]
    fn test_tls13_detection() {
        let random = [0u8; 32];
        assert!(is_server_hello_tls13(&build_server_hello(&random, true)));
        assert!(!is_server_hello_tls13(&build_server_hello(&random, false)));
    }

    #[test]
    fn test_tls13_truncated_extensions() {
        let random = [0u8; 32];
        let frame = build_server_hello(&random, true);
        // Chop the frame inside the extension list.
        assert!(!is_server_hello_tls13(&frame[..frame.len() - 3]));
        // Chop before the extension list length.
        assert!(!is_server_hello_tls13(&frame[..SESSION_ID_LENGTH_INDEX + 1]));
    }
}
