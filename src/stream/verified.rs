//! Verified tunnel stream
//!
//! Wraps the client connection once the handshake relay has handed off.
//! Outbound payloads become `application_data` records carrying a chained
//! 4-byte HMAC tag; inbound records are verified against the peer's chain,
//! silently discarded while the ignore chain is armed, or answered with a
//! camouflage alert and a fatal error.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::random::SECURE_RANDOM;
use crate::crypto::TagChain;
use crate::error::RelayError;
use crate::protocol::constants::*;

/// Check a tunnel record against a chain, mirroring the wire rule: the
/// payload is always absorbed, the tag only when `feed_tag` is set (the
/// ignore chain tracks records whose tags were never chained by the sender).
fn verify_application_data(frame: &[u8], chain: &mut TagChain, feed_tag: bool) -> bool {
    if frame.len() < TLS_HMAC_HEADER_SIZE
        || frame[1] != TLS_LEGACY_VERSION[0]
        || frame[2] != TLS_LEGACY_VERSION[1]
    {
        return false;
    }
    chain.update(&frame[TLS_HMAC_HEADER_SIZE..]);
    let tag = chain.tag();
    if feed_tag {
        chain.update(&tag);
    }
    frame[TLS_HEADER_SIZE..TLS_HMAC_HEADER_SIZE]
        .ct_eq(&tag)
        .unwrap_u8()
        == 1
}

/// Build the fixed-size camouflage alert: a real-looking `alert` record with
/// random padding.
fn build_alert() -> BytesMut {
    let mut record = BytesMut::with_capacity(ALERT_RECORD_SIZE);
    record.extend_from_slice(&[
        CONTENT_ALERT,
        TLS_LEGACY_VERSION[0],
        TLS_LEGACY_VERSION[1],
        0,
        (ALERT_RECORD_SIZE - TLS_HEADER_SIZE) as u8,
    ]);
    let mut padding = [0u8; ALERT_RECORD_SIZE - TLS_HEADER_SIZE];
    SECURE_RANDOM.fill(&mut padding);
    record.extend_from_slice(&padding);
    record
}

/// Framed, authenticated wrapper over the raw client connection.
pub struct VerifiedConn<S> {
    stream: S,
    /// Write-side chain; locked per record so a fragmented write stays
    /// serialised record by record.
    hmac_add: Mutex<TagChain>,
    hmac_verify: TagChain,
    hmac_ignore: Option<TagChain>,
    /// Inbound wire bytes not yet framed into a record
    raw: BytesMut,
    /// Verified payload not yet handed to the caller
    decoded: BytesMut,
    /// Assembled outbound record bytes not yet written through
    write_buf: BytesMut,
    /// Payload length to report once `write_buf` drains
    pending_write: Option<usize>,
    /// Alert record remainder, flushed before surfacing `failure`
    alert: Option<BytesMut>,
    failure: Option<io::Error>,
    dead: bool,
}

impl<S> VerifiedConn<S> {
    pub fn new(
        stream: S,
        hmac_add: TagChain,
        hmac_verify: TagChain,
        hmac_ignore: Option<TagChain>,
    ) -> Self {
        Self {
            stream,
            hmac_add: Mutex::new(hmac_add),
            hmac_verify,
            hmac_ignore,
            raw: BytesMut::with_capacity(16384),
            decoded: BytesMut::new(),
            write_buf: BytesMut::new(),
            pending_write: None,
            alert: None,
            failure: None,
            dead: false,
        }
    }

    /// Hand the caller payload that was already extracted and verified
    /// before this wrapper existed (the client's first tunnel frame).
    pub fn prepend_decoded(&mut self, payload: &[u8]) {
        self.decoded.extend_from_slice(payload);
    }

    /// Feed wire bytes that were read off the connection but never parsed
    /// (residue left in the handshake relay's record reader).
    pub fn prepend_raw(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

enum Processed {
    Delivered,
    Discarded,
    Failed,
}

impl<S: AsyncRead + AsyncWrite + Unpin> VerifiedConn<S> {
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut tmp = [0u8; 8192];
        let mut buf = ReadBuf::new(&mut tmp);
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut buf))?;
        let filled = buf.filled();
        self.raw.extend_from_slice(filled);
        Poll::Ready(Ok(filled.len()))
    }

    fn take_frame(&mut self) -> Option<BytesMut> {
        if self.raw.len() < TLS_HEADER_SIZE {
            return None;
        }
        let length = u16::from_be_bytes([self.raw[3], self.raw[4]]) as usize;
        let total = TLS_HEADER_SIZE + length;
        if self.raw.len() < total {
            return None;
        }
        Some(self.raw.split_to(total))
    }

    fn fail(&mut self, kind: io::ErrorKind, err: RelayError, with_alert: bool) {
        if with_alert {
            self.alert = Some(build_alert());
        }
        self.failure = Some(io::Error::new(kind, err));
    }

    fn process_frame(&mut self, frame: BytesMut) -> Processed {
        match frame[0] {
            CONTENT_ALERT => {
                // Peer closure; no alert goes back.
                self.fail(io::ErrorKind::ConnectionReset, RelayError::RemoteAlert, false);
                Processed::Failed
            }
            CONTENT_APPLICATION_DATA => {
                if let Some(ignore) = self.hmac_ignore.as_mut() {
                    if verify_application_data(&frame, ignore, false) {
                        // A late echo from the cover; drop it and stay armed.
                        return Processed::Discarded;
                    }
                    self.hmac_ignore = None;
                }
                if verify_application_data(&frame, &mut self.hmac_verify, true) {
                    self.decoded.extend_from_slice(&frame[TLS_HMAC_HEADER_SIZE..]);
                    Processed::Delivered
                } else {
                    self.fail(
                        io::ErrorKind::InvalidData,
                        RelayError::VerificationFailed,
                        true,
                    );
                    Processed::Failed
                }
            }
            other => {
                self.fail(
                    io::ErrorKind::InvalidData,
                    RelayError::UnexpectedRecordType(other),
                    true,
                );
                Processed::Failed
            }
        }
    }

    /// Push the queued alert out, best effort: write errors drop the alert
    /// rather than masking the failure that triggered it.
    fn poll_send_alert(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while let Some(alert) = self.alert.as_mut() {
            if alert.is_empty() {
                self.alert = None;
                break;
            }
            match Pin::new(&mut self.stream).poll_write(cx, alert) {
                Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => {
                    self.alert = None;
                }
                Poll::Ready(Ok(n)) => {
                    alert.advance(n);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(())
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed mid record",
                )));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for VerifiedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.decoded.is_empty() {
                let n = this.decoded.len().min(out.remaining());
                out.put_slice(&this.decoded.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.alert.is_some() || this.failure.is_some() {
                ready!(this.poll_send_alert(cx));
                this.dead = true;
                let err = this.failure.take().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel already failed")
                });
                return Poll::Ready(Err(err));
            }

            if this.dead {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "tunnel already failed",
                )));
            }

            if let Some(frame) = this.take_frame() {
                match this.process_frame(frame) {
                    Processed::Delivered | Processed::Discarded => continue,
                    Processed::Failed => continue, // surfaced by the branch above
                }
            }

            let n = ready!(this.poll_fill(cx))?;
            if n == 0 {
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid record",
                )));
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for VerifiedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(len) = this.pending_write {
                ready!(this.poll_drain(cx))?;
                this.pending_write = None;
                return Poll::Ready(Ok(len));
            }

            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            let chunk = &buf[..buf.len().min(MAX_TUNNEL_PAYLOAD)];
            let tag = this.hmac_add.lock().tag_and_advance(chunk);

            this.write_buf.reserve(TLS_HMAC_HEADER_SIZE + chunk.len());
            this.write_buf.extend_from_slice(&[
                CONTENT_APPLICATION_DATA,
                TLS_LEGACY_VERSION[0],
                TLS_LEGACY_VERSION[1],
            ]);
            this.write_buf
                .extend_from_slice(&((HMAC_TAG_SIZE + chunk.len()) as u16).to_be_bytes());
            this.write_buf.extend_from_slice(&tag);
            this.write_buf.extend_from_slice(chunk);
            this.pending_write = Some(chunk.len());
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // pending_write stays set so an interrupted poll_write can still
        // report its chunk instead of tagging it twice.
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}
