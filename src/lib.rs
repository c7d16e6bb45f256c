//! ssrelay - asynchronous Shadowsocks TCP/UDP relay
//!
//! An encrypted relay that tunnels TCP streams and UDP datagrams through
//! a remote server, with a SOCKS5 front-end on the client side. Both the
//! client and the server role live in this crate; they share the wire
//! codec, the crypto pipeline and the relay plumbing.
//!
//! # Architecture
//!
//! ```text
//!                +-----------------+
//!                |  Relay (lib.rs) |
//!                +--------+--------+
//!                         |
//!         +---------------+----------------+
//!         |               |                |
//!  +------v------+  +-----v------+  +------v------+
//!  |   relay/    |  |  crypto/   |  |    dns/     |
//!  | tcp + udp   |  | registry,  |  |  memoized   |
//!  | state machs |  | encryptor  |  |  resolver   |
//!  +------+------+  +------------+  +-------------+
//!         |
//!  +------v------+
//!  |   common/   |
//!  | addr, socks |
//!  | codec, ban  |
//!  +-------------+
//! ```

pub mod common;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod relay;

pub use common::error::{Error, Result};
pub use common::Address;
pub use config::Profile;
pub use crypto::{Encryptor, Method};
pub use relay::Mode;

use crate::relay::{ClientRelay, ServerRelay, UdpRelay};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relay instance: owns the listeners and the UDP relay for one profile
pub struct Relay {
    profile: Profile,
    method: Method,
    mode: Mode,
    autoban: bool,
    resolver: Arc<dns::Resolver>,
}

impl Relay {
    /// Validate the profile and prepare a relay. Configuration errors
    /// surface here, before anything is bound.
    pub fn new(profile: Profile, mode: Mode, autoban: bool) -> Result<Self> {
        let method = profile.validate()?;

        Ok(Relay {
            profile,
            method,
            mode,
            autoban,
            resolver: Arc::new(dns::Resolver::new()),
        })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn resolver(&self) -> &Arc<dns::Resolver> {
        &self.resolver
    }

    /// Bind the TCP listener and the UDP relay, then serve until ctrl-c.
    ///
    /// Bind failures propagate out of here; per-connection failures stay
    /// inside the accept loops.
    pub async fn run(&self) -> Result<()> {
        let listen_addr = self.listen_addr().await?;

        let tcp_listener = TcpListener::bind(listen_addr).await?;
        let udp_relay = Arc::new(
            UdpRelay::bind(
                &self.profile,
                self.method,
                self.mode,
                self.resolver.clone(),
                self.autoban,
                listen_addr,
            )
            .await?,
        );

        info!(
            "relay running in {} mode with {}",
            match self.mode {
                Mode::Client => "client",
                Mode::Server => "server",
            },
            self.method.name()
        );

        let mut handles = Vec::new();

        match self.mode {
            Mode::Client => {
                let relay = Arc::new(ClientRelay::new(
                    self.profile.clone(),
                    self.method,
                    self.resolver.clone(),
                ));
                handles.push(tokio::spawn(async move {
                    if let Err(e) = relay.run(tcp_listener).await {
                        warn!("TCP relay stopped: {}", e);
                    }
                }));
            }
            Mode::Server => {
                let relay = Arc::new(ServerRelay::new(
                    self.profile.clone(),
                    self.method,
                    self.resolver.clone(),
                    self.autoban,
                ));
                handles.push(tokio::spawn(async move {
                    if let Err(e) = relay.run(tcp_listener).await {
                        warn!("TCP relay stopped: {}", e);
                    }
                }));
            }
        }

        handles.push(tokio::spawn(async move {
            if let Err(e) = udp_relay.run().await {
                warn!("UDP relay stopped: {}", e);
            }
        }));

        tokio::signal::ctrl_c().await?;
        info!("received shutdown signal");

        for handle in handles {
            handle.abort();
        }

        info!("relay stopped");
        Ok(())
    }

    /// The bind endpoint: local address in client mode, the server
    /// endpoint in server mode. Hostnames are resolved once at startup.
    async fn listen_addr(&self) -> Result<SocketAddr> {
        let (host, port) = match self.mode {
            Mode::Client => self.profile.local_host_port(),
            Mode::Server => self.profile.server_host_port(),
        };

        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            Err(_) => Address::from(host.as_str()).resolve(&self.resolver).await?,
        };
        Ok(SocketAddr::new(ip, port))
    }
}
