//! TLS record codec

use bytes::BytesMut;
use std::io::{Error, ErrorKind, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::constants::TLS_HEADER_SIZE;

/// Reads one TLS record at a time from a byte stream.
///
/// Bytes are accumulated in an internal buffer, so a `next_record` future
/// dropped mid-read loses nothing; the relay directions rely on this when
/// they race record reads inside `select!`. The codec never interprets
/// content types.
pub struct RecordReader<R> {
    upstream: R,
    buffer: BytesMut,
}

impl<R> RecordReader<R> {
    /// Create new record reader
    pub fn new(upstream: R) -> Self {
        Self {
            upstream,
            buffer: BytesMut::with_capacity(16384),
        }
    }

    /// Consume the reader, returning the upstream and any bytes that were
    /// received but not yet framed into a record.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.upstream, self.buffer)
    }
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    /// Read the next record: 5-byte header plus payload, as one buffer.
    ///
    /// Fails with `UnexpectedEof` when the stream ends before a full record
    /// arrives, including at a record boundary.
    pub async fn next_record(&mut self) -> Result<BytesMut> {
        loop {
            if self.buffer.len() >= TLS_HEADER_SIZE {
                let length = u16::from_be_bytes([self.buffer[3], self.buffer[4]]) as usize;
                let total = TLS_HEADER_SIZE + length;
                if self.buffer.len() >= total {
                    return Ok(self.buffer.split_to(total));
                }
            }

            let n = self.upstream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream closed before a full record",
                ));
            }
        }
    }
}

/// Write a framed record back out. The caller has already positioned the
/// header fields; nothing is reframed here.
pub async fn write_record<W>(writer: &mut W, record: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    writer.write_all(record).await
}
