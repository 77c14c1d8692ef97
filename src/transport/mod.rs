//! Transport layer: the upstream dial capability

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How the relay reaches the cover host. Abstracted so tests can substitute
/// in-memory streams for real sockets.
pub trait Dialer: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn dial(&self, addr: &str) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// Plain TCP dialer with a connect timeout.
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
