//! Client-mode TCP relay: SOCKS5 front-end
//!
//! Per accepted connection: negotiate the SOCKS5 greeting (no-auth only),
//! read the request, and either tunnel a CONNECT through the remote server
//! or park a UDP ASSOCIATE for the lifetime of the association. The
//! destination address travels to the server as the first encrypted bytes,
//! ahead of any payload.

use crate::common::net::{configure_tcp_stream, Address};
use crate::common::socks::{
    AuthRequest, AuthResponse, Command, Request, Response, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH,
    REP_COMMAND_NOT_SUPPORTED, REP_GENERAL_FAILURE,
};
use crate::config::Profile;
use crate::crypto::{Encryptor, Method};
use crate::dns::Resolver;
use crate::relay::{pipe, ShadowStream};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// SOCKS5 listener tunneling connections through the remote server
pub struct ClientRelay {
    profile: Profile,
    method: Method,
    resolver: Arc<Resolver>,
}

impl ClientRelay {
    pub fn new(profile: Profile, method: Method, resolver: Arc<Resolver>) -> Self {
        ClientRelay {
            profile,
            method,
            resolver,
        }
    }

    /// Accept loop. Runs until the listener fails fatally; per-connection
    /// errors are logged and do not escape.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            "SOCKS5 front-end listening on {}",
            listener.local_addr()?
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
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
                    // FD exhaustion and friends: stop accepting, let the
                    // spawned connections drain on their own
                    error!("listener failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let auth_req = AuthRequest::read_from(&mut stream).await?;
        if !auth_req.supports(AUTH_NO_AUTH) {
            AuthResponse::new(AUTH_NO_ACCEPTABLE)
                .write_to(&mut stream)
                .await?;
            return Err(Error::protocol("no acceptable authentication method"));
        }
        AuthResponse::new(AUTH_NO_AUTH).write_to(&mut stream).await?;

        let request = Request::read_from(&mut stream).await?;

        match request.command {
            Command::Connect => {
                self.handle_connect(stream, peer_addr, request.address, request.port)
                    .await
            }
            Command::UdpAssociate => self.handle_udp_associate(stream, peer_addr).await,
            Command::Bind => {
                Response::failure(REP_COMMAND_NOT_SUPPORTED)
                    .write_to(&mut stream)
                    .await?;
                Err(Error::unsupported("BIND is not supported"))
            }
        }
    }

    async fn handle_connect(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        address: Address,
        port: u16,
    ) -> Result<()> {
        debug!("CONNECT {} -> {}:{}", peer_addr, address, port);

        // A zero port can never appear in a valid tunnel header; fail it
        // while the SOCKS5 failure channel still exists
        if port == 0 {
            Response::failure(REP_GENERAL_FAILURE)
                .write_to(&mut stream)
                .await?;
            return Err(Error::protocol("destination port is zero"));
        }

        // There is no failure channel once tunneling starts, so the reply
        // is a fixed success with an unspecified bind address.
        Response::success(Address::from(std::net::Ipv4Addr::UNSPECIFIED), 0)
            .write_to(&mut stream)
            .await?;

        let remote = self.dial_server().await?;
        let encryptor = Encryptor::new(self.method, &self.profile.password)?;
        let mut shadow = ShadowStream::new(remote, encryptor);

        // Destination header is the first plaintext of the tunnel
        let header = address.to_bytes(port)?;
        shadow.write_all(&header).await?;

        let (sent, received) = pipe(stream, shadow, self.profile.timeout()).await?;
        debug!(
            "CONNECT {} -> {}:{} done (sent: {}, received: {})",
            peer_addr, address, port, sent, received
        );
        Ok(())
    }

    /// The TCP connection of a UDP ASSOCIATE carries no data; it only pins
    /// the association until the client closes it.
    async fn handle_udp_associate(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        debug!("UDP ASSOCIATE from {}", peer_addr);

        let relay_addr = Address::from(self.profile.local_address.as_str());
        Response::success(relay_addr, self.profile.local_port)
            .write_to(&mut stream)
            .await?;

        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    debug!("UDP ASSOCIATE from {} released", peer_addr);
                    return Ok(());
                }
                Ok(_) => {
                    // No further TCP traffic is defined for this state
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn dial_server(&self) -> Result<TcpStream> {
        let ip = Address::from(self.profile.server.as_str())
            .resolve(&self.resolver)
            .await?;
        let addr = SocketAddr::new(ip, self.profile.server_port);

        let stream = TcpStream::connect(addr).await.map_err(|e| {
            warn!("server {} unreachable: {}", addr, e);
            Error::connection(format!("failed to connect to server {}: {}", addr, e))
        })?;
        configure_tcp_stream(&stream);
        Ok(stream)
    }
}
