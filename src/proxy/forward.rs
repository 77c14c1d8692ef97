//! Default tunneled-connection handler
//!
//! Forwards the decrypted tunnel stream to a fixed backend address, the role
//! the relay plays when it fronts an actual proxy service.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::stats::Stats;
use crate::stream::VerifiedConn;

use super::service::{TunnelHandler, TunnelInfo};

pub struct ForwardHandler {
    backend_addr: String,
    connect_timeout: Duration,
    stats: Arc<Stats>,
}

impl ForwardHandler {
    pub fn new(backend_addr: impl Into<String>, connect_timeout: Duration, stats: Arc<Stats>) -> Self {
        Self {
            backend_addr: backend_addr.into(),
            connect_timeout,
            stats,
        }
    }
}

impl TunnelHandler for ForwardHandler {
    async fn handle<S>(&self, mut conn: VerifiedConn<S>, info: TunnelInfo) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut backend = timeout(self.connect_timeout, TcpStream::connect(&self.backend_addr))
            .await
            .map_err(|_| {
                RelayError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "backend connect timed out",
                ))
            })??;
        backend.set_nodelay(true).ok();

        debug!(peer = %info.peer, user = %info.user, backend = %self.backend_addr, "tunnel open");

        match tokio::io::copy_bidirectional(&mut conn, &mut backend).await {
            Ok((up, down)) => {
                self.stats.add_octets(&info.user, up, down);
                debug!(
                    peer = %info.peer,
                    user = %info.user,
                    up = up,
                    down = down,
                    "tunnel closed"
                );
                Ok(())
            }
            // The peer tearing the tunnel down with an alert is an orderly
            // close, not a fault.
            Err(e) if matches!(RelayError::from_io(&e), Some(RelayError::RemoteAlert)) => {
                debug!(peer = %info.peer, user = %info.user, "peer closed tunnel with alert");
                Ok(())
            }
            Err(e) => Err(RelayError::Io(e)),
        }
    }
}
