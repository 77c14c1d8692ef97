//! Transparent relay for peers that fail authentication
//!
//! A probe that speaks TLS at us must see exactly what it would see talking
//! to the cover host directly, so after the decision to fall back the
//! session degrades to a plain byte pump in both directions: no framing, no
//! cryptography, no extra latency.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::protocol::record::RecordReader;

const COPY_BUFFER_SIZE: usize = 8192;

/// Pump bytes between client and cover until both directions reach EOF.
///
/// The record readers are dissolved first so bytes they buffered but never
/// framed still reach the other side.
pub async fn relay_transparent<CR, CW, UR, UW>(
    client_reader: RecordReader<CR>,
    mut client_writer: CW,
    cover_reader: RecordReader<UR>,
    mut cover_writer: UW,
) -> Result<()>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    UR: AsyncRead + Unpin + Send + 'static,
    UW: AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_read, client_residual) = client_reader.into_parts();
    let (mut cover_read, cover_residual) = cover_reader.into_parts();

    if !client_residual.is_empty() {
        cover_writer
            .write_all(&client_residual)
            .await
            .map_err(RelayError::CoverWrite)?;
    }
    if !cover_residual.is_empty() {
        client_writer
            .write_all(&cover_residual)
            .await
            .map_err(RelayError::ClientWrite)?;
    }

    let mut up = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = cover_writer.shutdown().await;
                    return Ok(());
                }
                Ok(n) => {
                    if let Err(e) = cover_writer.write_all(&buf[..n]).await {
                        return Err(RelayError::CoverWrite(e));
                    }
                }
                Err(e) => {
                    let _ = cover_writer.shutdown().await;
                    return Err(RelayError::ClientRead(e));
                }
            }
        }
    });

    let mut down = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            match cover_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = client_writer.shutdown().await;
                    return Ok(());
                }
                Ok(n) => {
                    if let Err(e) = client_writer.write_all(&buf[..n]).await {
                        return Err(RelayError::ClientWrite(e));
                    }
                }
                Err(e) => {
                    let _ = client_writer.shutdown().await;
                    return Err(RelayError::CoverRead(e));
                }
            }
        }
    });

    // First error tears the session down; a clean EOF waits for the other
    // direction to finish its half of the close.
    let result = tokio::select! {
        first = &mut up => match flatten(first) {
            Ok(()) => flatten(down.await),
            Err(e) => {
                down.abort();
                Err(e)
            }
        },
        first = &mut down => match flatten(first) {
            Ok(()) => flatten(up.await),
            Err(e) => {
                up.abort();
                Err(e)
            }
        },
    };

    debug!("transparent relay finished");
    result
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(RelayError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_pass_untouched_both_ways() {
        let (mut client_peer, client_side) = duplex(1 << 16);
        let (mut cover_peer, cover_side) = duplex(1 << 16);

        let (client_read, client_write) = tokio::io::split(client_side);
        let (cover_read, cover_write) = tokio::io::split(cover_side);

        let mut client_rec = RecordReader::new(client_read);
        let cover_rec = RecordReader::new(cover_read);

        // Leave residue in the client reader: a full record plus a partial
        // follow-up the codec buffered but never framed.
        client_peer
            .write_all(&[0x16, 0x03, 0x01, 0x00, 0x02, 0xaa, 0xbb, 0x17, 0x03])
            .await
            .unwrap();
        let first = client_rec.next_record().await.unwrap();
        assert_eq!(first.len(), 7);

        let task = tokio::spawn(relay_transparent(
            client_rec,
            client_write,
            cover_rec,
            cover_write,
        ));

        // The buffered partial bytes arrive at the cover before new traffic.
        let mut got = [0u8; 2];
        cover_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, &[0x17, 0x03]);

        client_peer.write_all(b"payload from client").await.unwrap();
        let mut got = [0u8; 19];
        cover_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"payload from client");

        cover_peer.write_all(b"reply from cover").await.unwrap();
        let mut got = [0u8; 16];
        client_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"reply from cover");

        // Both ends closing lets the relay finish cleanly.
        drop(client_peer);
        drop(cover_peer);
        assert!(task.await.unwrap().is_ok());
    }
}
