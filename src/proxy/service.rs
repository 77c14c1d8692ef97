//! Session orchestration
//!
//! One `Service` fronts a listener: it authenticates ClientHellos against
//! the user table, relays the real TLS handshake against the cover host,
//! and on success hands the verified tunnel to the configured handler.
//! Anything that fails authentication is indistinguishable from a plain TCP
//! relay to the cover.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::crypto::SessionChains;
use crate::error::{client_read_err, cover_read_err, RelayError, Result};
use crate::protocol::hello::{extract_server_random, is_server_hello_tls13, verify_client_hello};
use crate::protocol::record::{write_record, RecordReader};
use crate::protocol::User;
use crate::stats::Stats;
use crate::stream::VerifiedConn;
use crate::transport::Dialer;

use super::fallback::relay_transparent;
use super::relay::{client_to_cover, cover_to_client, ClientHandoff, CoverHandoff};

/// Per-tunnel metadata passed to the handler.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub peer: SocketAddr,
    pub user: String,
}

/// Consumer of authenticated tunnels.
pub trait TunnelHandler: Send + Sync + 'static {
    fn handle<S>(
        &self,
        conn: VerifiedConn<S>,
        info: TunnelInfo,
    ) -> impl Future<Output = Result<()>> + Send
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// The relay service: one instance per listener, shared across sessions.
pub struct Service<D, H> {
    version: u8,
    users: Vec<User>,
    cover_addr: String,
    dialer: D,
    handler: Arc<H>,
    stats: Arc<Stats>,
}

impl<D: Dialer, H: TunnelHandler> Service<D, H> {
    pub fn new(
        version: u8,
        users: Vec<User>,
        cover_addr: impl Into<String>,
        dialer: D,
        handler: Arc<H>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        if !matches!(version, 1..=3) {
            return Err(RelayError::InvalidConfig(format!(
                "unknown protocol version: {version}"
            )));
        }
        if users.is_empty() {
            return Err(RelayError::InvalidConfig("no users configured".into()));
        }
        if users.iter().any(|u| u.password.is_empty()) {
            return Err(RelayError::InvalidConfig("empty password".into()));
        }
        let cover_addr = cover_addr.into();
        let (host, port) = match cover_addr.rsplit_once(':') {
            Some(split) => split,
            None => {
                return Err(RelayError::InvalidConfig(format!(
                    "cover address '{cover_addr}' is not host:port"
                )))
            }
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(RelayError::InvalidConfig(format!(
                "cover address '{cover_addr}' is not host:port"
            )));
        }

        Ok(Self {
            version,
            users,
            cover_addr,
            dialer,
            handler,
            stats,
        })
    }

    /// Serve one client connection for its whole lifetime: through the
    /// handshake relay and the tunneled handler, or down the transparent
    /// fallback if the peer turns out not to be ours.
    pub async fn accept<S>(&self, client: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.stats.session_opened();

        if self.version != 3 {
            return Err(RelayError::UnsupportedVersion(self.version));
        }

        let cover = self
            .dialer
            .dial(&self.cover_addr)
            .await
            .map_err(RelayError::CoverDial)?;

        self.run_v3(client, cover, peer).await
    }

    async fn run_v3<S, U>(&self, client: S, cover: U, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (client_read, mut client_write) = tokio::io::split(client);
        let (cover_read, mut cover_write) = tokio::io::split(cover);
        let mut client_rec = RecordReader::new(client_read);
        let mut cover_rec = RecordReader::new(cover_read);

        // One record each way, forwarded verbatim before we judge it.
        let client_hello = client_rec.next_record().await.map_err(client_read_err)?;
        write_record(&mut cover_write, &client_hello)
            .await
            .map_err(RelayError::CoverWrite)?;

        let user = match verify_client_hello(&client_hello, &self.users) {
            Ok(user) => user.clone(),
            Err(err) => {
                warn!(peer = %peer, error = %err, "client hello verify failed");
                self.stats.fallback_started();
                return relay_transparent(client_rec, client_write, cover_rec, cover_write).await;
            }
        };
        trace!(peer = %peer, user = %user.name, "client hello verify success");
        drop(client_hello);

        let server_hello = cover_rec.next_record().await.map_err(cover_read_err)?;
        write_record(&mut client_write, &server_hello)
            .await
            .map_err(RelayError::ClientWrite)?;

        let server_random = match extract_server_random(&server_hello) {
            Some(random) => random,
            None => {
                warn!(peer = %peer, "server random extract failed, will copy bidirectional");
                self.stats.fallback_started();
                return relay_transparent(client_rec, client_write, cover_rec, cover_write).await;
            }
        };

        if !is_server_hello_tls13(&server_hello) {
            warn!(peer = %peer, "TLS 1.3 is not supported, will copy bidirectional");
            self.stats.fallback_started();
            return relay_transparent(client_rec, client_write, cover_rec, cover_write).await;
        }
        drop(server_hello);

        trace!(
            peer = %peer,
            server_random = %hex::encode(server_random),
            "client authenticated, server random extracted"
        );

        let chains = SessionChains::derive(&user.password, &server_random);
        let finished = Arc::new(AtomicBool::new(false));
        let cover_closed = Arc::new(Notify::new());

        let mut c2s = tokio::spawn(client_to_cover(
            client_rec,
            cover_write,
            chains.verify,
            finished.clone(),
            cover_closed.clone(),
        ));
        let mut s2c = tokio::spawn(cover_to_client(
            cover_rec,
            client_write,
            user.password.clone(),
            server_random,
            chains.add,
            finished.clone(),
            cover_closed.clone(),
        ));

        // Fast-fail composition: the first failure aborts the other
        // direction; a success waits for its twin to wind down.
        let (client_side, cover_side) = tokio::select! {
            first = &mut c2s => match join_relay(first) {
                Ok(client_side) => {
                    let cover_side = join_relay(s2c.await).map_err(relay_failed)?;
                    (client_side, cover_side)
                }
                Err(e) => {
                    s2c.abort();
                    return Err(relay_failed(e));
                }
            },
            first = &mut s2c => match join_relay(first) {
                Ok(cover_side) => {
                    // Only reachable once the handoff flag is set, so the
                    // client side is about to return as well.
                    let client_side = join_relay(c2s.await).map_err(relay_failed)?;
                    (client_side, cover_side)
                }
                Err(e) => {
                    c2s.abort();
                    return Err(relay_failed(e));
                }
            },
        };

        let ClientHandoff {
            reader,
            hmac_verify,
            first_frame,
        } = client_side;
        let CoverHandoff {
            writer,
            hmac_add,
        } = cover_side;

        debug!(peer = %peer, user = %user.name, "handshake relay finished");
        self.stats.tunnel_established(&user.name);

        let (read_half, residual) = reader.into_parts();
        let stream = read_half.unsplit(writer);

        let mut conn = VerifiedConn::new(stream, hmac_add, hmac_verify, None);
        conn.prepend_decoded(&first_frame);
        if !residual.is_empty() {
            conn.prepend_raw(&residual);
        }

        let info = TunnelInfo {
            peer,
            user: user.name,
        };
        self.handler.handle(conn, info).await
    }
}

fn join_relay<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    joined
        .map_err(|e| RelayError::Internal(format!("relay task failed: {e}")))?
}

fn relay_failed(err: RelayError) -> RelayError {
    debug!(error = %err, "handshake relay failed");
    err
}
