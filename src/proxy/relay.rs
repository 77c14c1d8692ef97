//! Handshake relay
//!
//! After the hellos have been exchanged, two directions run concurrently:
//! client records stream to the cover until one of them carries a valid
//! chained tag (the client has switched to tunnel traffic), while cover
//! `application_data` records are masked and tagged on their way to the
//! client so it can tell a real relay from a bare TLS server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::crypto::{mask_key, xor_slice, TagChain};
use crate::error::{client_read_err, cover_read_err, RelayError, Result};
use crate::protocol::constants::*;
use crate::protocol::record::{write_record, RecordReader};

/// What the client→cover direction hands back on success.
pub struct ClientHandoff<R> {
    pub reader: RecordReader<R>,
    pub hmac_verify: TagChain,
    /// First tunnel payload, header already stripped; replayed to the
    /// tunneled handler.
    pub first_frame: BytesMut,
}

/// What the cover→client direction hands back on success.
pub struct CoverHandoff<W> {
    pub writer: W,
    pub hmac_add: TagChain,
}

impl<W> std::fmt::Debug for CoverHandoff<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverHandoff").finish_non_exhaustive()
    }
}

/// Copy client records to the cover until one matches the verify chain.
///
/// Non-matching records are forwarded byte for byte. A match is probed on a
/// snapshot first so an unsuccessful candidate leaves the chain untouched;
/// the accepting update then feeds payload and tag into the real chain.
pub async fn client_to_cover<R, W>(
    mut client: RecordReader<R>,
    mut cover: W,
    mut hmac_verify: TagChain,
    finished: Arc<AtomicBool>,
    cover_closed: Arc<Notify>,
) -> Result<ClientHandoff<R>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut frame = client.next_record().await.map_err(client_read_err)?;

        if frame.len() > TLS_HMAC_HEADER_SIZE && frame[0] == CONTENT_APPLICATION_DATA {
            let mut probe = hmac_verify.clone();
            probe.update(&frame[TLS_HMAC_HEADER_SIZE..]);
            let tag = probe.tag();
            if frame[TLS_HEADER_SIZE..TLS_HMAC_HEADER_SIZE]
                .ct_eq(&tag)
                .unwrap_u8()
                == 1
            {
                hmac_verify.update(&frame[TLS_HMAC_HEADER_SIZE..]);
                hmac_verify.update(&tag);
                let first_frame = frame.split_off(TLS_HMAC_HEADER_SIZE);

                finished.store(true, Ordering::Relaxed);
                let _ = cover.shutdown().await;
                cover_closed.notify_one();

                debug!(payload = first_frame.len(), "client switched to tunnel traffic");
                return Ok(ClientHandoff {
                    reader: client,
                    hmac_verify,
                    first_frame,
                });
            }
        }

        write_record(&mut cover, &frame)
            .await
            .map_err(RelayError::CoverWrite)?;
        cover.flush().await.map_err(RelayError::CoverWrite)?;
    }
}

/// Rewrite cover records towards the client.
///
/// `application_data` payloads are XOR-masked with the session keystream,
/// absorbed into the add chain and re-emitted with a 4-byte tag spliced in
/// after the header; everything else is forwarded verbatim. The direction
/// ends when the client→cover side signals the handoff, or when the cover
/// goes away, which counts as success only once the handshake finished.
pub async fn cover_to_client<R, W>(
    mut cover: RecordReader<R>,
    mut client: W,
    password: Vec<u8>,
    server_random: [u8; TLS_RANDOM_SIZE],
    mut hmac_add: TagChain,
    finished: Arc<AtomicBool>,
    cover_closed: Arc<Notify>,
) -> Result<CoverHandoff<W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let write_key = mask_key(&password, &server_random);

    loop {
        let mut frame = tokio::select! {
            record = cover.next_record() => match record {
                Ok(frame) => frame,
                Err(err) => {
                    let err = cover_read_err(err);
                    if finished.load(Ordering::Relaxed) && err.is_disconnect() {
                        trace!("cover closed after handoff");
                        return Ok(CoverHandoff { writer: client, hmac_add });
                    }
                    return Err(err);
                }
            },
            _ = cover_closed.notified() => {
                trace!("cover released after handoff");
                return Ok(CoverHandoff { writer: client, hmac_add });
            }
        };

        if frame[0] == CONTENT_APPLICATION_DATA {
            let payload_len = frame.len() - TLS_HEADER_SIZE;
            xor_slice(&mut frame[TLS_HEADER_SIZE..], &write_key);
            hmac_add.update(&frame[TLS_HEADER_SIZE..]);
            let tag = hmac_add.tag();
            frame[3..TLS_HEADER_SIZE]
                .copy_from_slice(&((payload_len + HMAC_TAG_SIZE) as u16).to_be_bytes());

            let mut out = BytesMut::with_capacity(frame.len() + HMAC_TAG_SIZE);
            out.extend_from_slice(&frame[..TLS_HEADER_SIZE]);
            out.extend_from_slice(&tag);
            out.extend_from_slice(&frame[TLS_HEADER_SIZE..]);
            client
                .write_all(&out)
                .await
                .map_err(RelayError::ClientWrite)?;
        } else {
            write_record(&mut client, &frame)
                .await
                .map_err(RelayError::ClientWrite)?;
        }
        client.flush().await.map_err(RelayError::ClientWrite)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionChains;
    use tokio::io::{duplex, AsyncReadExt};

    const RANDOM: [u8; 32] = [0x42u8; 32];
    const PASSWORD: &[u8] = b"hunter2";

    fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![content_type, 0x03, 0x03];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_forwards_until_tag_matches() {
        let (mut client_tx, client_rx) = duplex(1 << 16);
        let (cover_tx, mut cover_rx) = duplex(1 << 16);

        let chains = SessionChains::derive(PASSWORD, &RANDOM);
        let finished = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(Notify::new());

        let task = tokio::spawn(client_to_cover(
            RecordReader::new(client_rx),
            cover_tx,
            chains.verify,
            finished.clone(),
            closed.clone(),
        ));

        // Ordinary handshake traffic is forwarded untouched.
        let finished_msg = record(CONTENT_HANDSHAKE, b"finished");
        client_tx.write_all(&finished_msg).await.unwrap();

        // An unauthenticated application_data record is forwarded too.
        let stray = record(CONTENT_APPLICATION_DATA, b"\x00\x00\x00\x00stray");
        client_tx.write_all(&stray).await.unwrap();

        // The first properly tagged record triggers the handoff.
        let mut sender = SessionChains::derive(PASSWORD, &RANDOM).verify;
        sender.update(b"tunnel!");
        let tag = sender.tag();
        let mut payload = tag.to_vec();
        payload.extend_from_slice(b"tunnel!");
        client_tx
            .write_all(&record(CONTENT_APPLICATION_DATA, &payload))
            .await
            .unwrap();

        let handoff = task.await.unwrap().unwrap();
        assert_eq!(&handoff.first_frame[..], b"tunnel!");
        assert!(finished.load(Ordering::Relaxed));

        // The cover saw exactly the two forwarded records, then EOF: not one
        // byte of the tunnel frame leaked.
        let mut seen = Vec::new();
        cover_rx.read_to_end(&mut seen).await.unwrap();
        let mut expected = finished_msg;
        expected.extend_from_slice(&stray);
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_rewrites_cover_application_data() {
        let (mut cover_tx, cover_rx) = duplex(1 << 16);
        let (client_tx, mut client_rx) = duplex(1 << 16);

        let chains = SessionChains::derive(PASSWORD, &RANDOM);
        let finished = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(Notify::new());

        let task = tokio::spawn(cover_to_client(
            RecordReader::new(cover_rx),
            client_tx,
            PASSWORD.to_vec(),
            RANDOM,
            chains.add,
            finished.clone(),
            closed.clone(),
        ));

        // Handshake records pass through unchanged.
        let hs = record(CONTENT_HANDSHAKE, b"cert-data");
        cover_tx.write_all(&hs).await.unwrap();

        let mut echoed = vec![0u8; hs.len()];
        client_rx.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, hs);

        // Application data grows by exactly the tag and verifies client-side.
        let secret = b"ticket-payload";
        cover_tx
            .write_all(&record(CONTENT_APPLICATION_DATA, secret))
            .await
            .unwrap();

        let mut header = [0u8; TLS_HEADER_SIZE];
        client_rx.read_exact(&mut header).await.unwrap();
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        assert_eq!(len, secret.len() + HMAC_TAG_SIZE);
        let mut body = vec![0u8; len];
        client_rx.read_exact(&mut body).await.unwrap();

        // The client's mirror of the add chain accepts the tag...
        let mut mirror = SessionChains::derive(PASSWORD, &RANDOM).add;
        mirror.update(&body[HMAC_TAG_SIZE..]);
        assert_eq!(mirror.tag(), body[..HMAC_TAG_SIZE]);

        // ...and unmasking recovers the original payload.
        let key = mask_key(PASSWORD, &RANDOM);
        let mut payload = body[HMAC_TAG_SIZE..].to_vec();
        xor_slice(&mut payload, &key);
        assert_eq!(payload, secret);

        // Cover going away before the handoff is an error...
        drop(cover_tx);
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_cover_eof_after_handoff_is_success() {
        let (cover_tx, cover_rx) = duplex(1 << 16);
        let (client_tx, _client_rx) = duplex(1 << 16);

        let chains = SessionChains::derive(PASSWORD, &RANDOM);
        let finished = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(Notify::new());

        let task = tokio::spawn(cover_to_client(
            RecordReader::new(cover_rx),
            client_tx,
            PASSWORD.to_vec(),
            RANDOM,
            chains.add,
            finished,
            closed,
        ));

        drop(cover_tx);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_notify_releases_cover_direction() {
        let (_cover_tx, cover_rx) = duplex(1 << 16);
        let (client_tx, _client_rx) = duplex(1 << 16);

        let chains = SessionChains::derive(PASSWORD, &RANDOM);
        let finished = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(Notify::new());

        let task = tokio::spawn(cover_to_client(
            RecordReader::new(cover_rx),
            client_tx,
            PASSWORD.to_vec(),
            RANDOM,
            chains.add,
            finished.clone(),
            closed.clone(),
        ));

        finished.store(true, Ordering::Relaxed);
        closed.notify_one();
        assert!(task.await.unwrap().is_ok());
    }
}
