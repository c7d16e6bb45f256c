//! Server-mode TCP relay
//!
//! Per accepted connection: drop banned peers before touching the stream,
//! decrypt the destination header, dial the true destination and relay.
//! A header that decrypts to garbage is the signature of a probe (or a
//! wrong password) and gets the peer banned when auto-ban is enabled.

use crate::common::net::{configure_tcp_stream, Address};
use crate::common::{ban, Error};
use crate::config::Profile;
use crate::crypto::{Encryptor, Method};
use crate::dns::Resolver;
use crate::relay::{pipe, ShadowStream};
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Listener decrypting client tunnels and dialing their destinations
pub struct ServerRelay {
    profile: Profile,
    method: Method,
    resolver: Arc<Resolver>,
    autoban: bool,
}

impl ServerRelay {
    pub fn new(profile: Profile, method: Method, resolver: Arc<Resolver>, autoban: bool) -> Self {
        ServerRelay {
            profile,
            method,
            resolver,
            autoban,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if ban::is_banned(&peer_addr.ip()) {
                        debug!("dropping connection from banned {}", peer_addr.ip());
                        continue;
                    }
                    let relay = self.clone();
                    tokio::spawn(async move {
                        configure_tcp_stream(&stream);
                        if let Err(e) = relay.handle_connection(stream, peer_addr).await {
                            debug!("connection from {} closed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) if super::is_transient_accept_error(&e) => {
                    warn!("accept error: {}", e);
                }
                Err(e) => {
                    error!("listener failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let encryptor = Encryptor::new(self.method, &self.profile.password)?;
        let mut shadow = ShadowStream::new(stream, encryptor);

        // Partial headers keep buffering inside the ShadowStream; a peer
        // that never completes one is cut off by the idle deadline.
        let header = tokio::time::timeout(
            self.profile.timeout(),
            Address::read_from(&mut shadow),
        )
        .await
        .map_err(|_| Error::timeout("no destination header before idle timeout"))?;

        let (address, port) = match header {
            Ok(parsed) => parsed,
            Err(e) => {
                if matches!(e, Error::Protocol(_)) {
                    self.ban_peer(peer_addr);
                }
                return Err(e);
            }
        };

        debug!("{} -> {}:{}", peer_addr, address, port);

        // No protocol-level error channel exists after the header: a
        // failed dial closes the tunnel without a reply.
        let ip = address.resolve(&self.resolver).await?;
        let upstream = match TcpStream::connect(SocketAddr::new(ip, port)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("dial {}:{} failed: {}", address, port, e);
                return Ok(());
            }
        };
        configure_tcp_stream(&upstream);

        let (received, sent) = pipe(shadow, upstream, self.profile.timeout()).await?;
        debug!(
            "{} -> {}:{} done (received: {}, sent: {})",
            peer_addr, address, port, received, sent
        );
        Ok(())
    }

    fn ban_peer(&self, peer_addr: SocketAddr) {
        if self.autoban {
            warn!("banning {} after malformed header", peer_addr.ip());
            ban::ban(peer_addr.ip());
        }
    }
}
