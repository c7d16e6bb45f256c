//! UDP relay
//!
//! One long-lived listen socket per relay. Each datagram is encrypted or
//! decrypted standalone; flows are tracked in a NAT-style association
//! cache mapping the peer endpoint (and, in client mode, the destination)
//! to an owned upstream socket plus its reader task. The cache is LRU
//! capped; evicting an entry drops the socket and aborts the reader.

use crate::common::net::Address;
use crate::common::{ban, socks};
use crate::config::Profile;
use crate::crypto::{Encryptor, Method};
use crate::dns::Resolver;
use crate::relay::Mode;
use crate::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest datagram accepted on any socket
pub const RECV_CAP: usize = 65536;

const ASSOC_CAP: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AssocKey {
    /// Server mode: one upstream socket per client endpoint
    Peer(SocketAddr),
    /// Client mode: one upstream socket per (client endpoint, destination)
    PeerDest(SocketAddr, Address, u16),
}

struct Association {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

impl Drop for Association {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

type AssocCache = Arc<Mutex<LruCache<AssocKey, Association>>>;

/// Stateless-per-packet encrypted UDP relay
pub struct UdpRelay {
    mode: Mode,
    encryptor: Arc<Encryptor>,
    resolver: Arc<Resolver>,
    autoban: bool,
    listen: Arc<UdpSocket>,
    /// Client mode: the resolved remote server endpoint
    server_addr: Option<SocketAddr>,
    cache: AssocCache,
}

impl UdpRelay {
    /// Bind the listen socket and resolve the upstream server (client mode)
    pub async fn bind(
        profile: &Profile,
        method: Method,
        mode: Mode,
        resolver: Arc<Resolver>,
        autoban: bool,
        listen_addr: SocketAddr,
    ) -> Result<Self> {
        let listen = UdpSocket::bind(listen_addr).await?;
        info!("UDP relay listening on {}", listen.local_addr()?);

        let server_addr = match mode {
            Mode::Client => {
                let ip = Address::from(profile.server.as_str())
                    .resolve(&resolver)
                    .await?;
                Some(SocketAddr::new(ip, profile.server_port))
            }
            Mode::Server => None,
        };

        Ok(UdpRelay {
            mode,
            encryptor: Arc::new(Encryptor::new(method, &profile.password)?),
            resolver,
            autoban,
            listen: Arc::new(listen),
            server_addr,
            cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(ASSOC_CAP).expect("cache capacity is non-zero"),
            ))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listen.local_addr()?)
    }

    /// Listen-socket read loop. Malformed datagrams are dropped, never
    /// answered.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; RECV_CAP];

        loop {
            let (n, peer) = match self.listen.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP recv error: {}", e);
                    continue;
                }
            };

            let result = match self.mode {
                Mode::Client => self.handle_local_datagram(&buf[..n], peer).await,
                Mode::Server => self.handle_remote_datagram(&buf[..n], peer).await,
            };

            if let Err(e) = result {
                debug!("dropping datagram from {}: {}", peer, e);
            }
        }
    }

    /// Client mode: SOCKS5-wrapped datagram from a local application
    async fn handle_local_datagram(&self, data: &[u8], peer: SocketAddr) -> Result<()> {
        if data.len() < 4 || data[0] != 0 || data[1] != 0 {
            return Err(Error::protocol("missing SOCKS5 UDP prefix"));
        }
        let (header, _header_len) = socks::UdpHeader::from_bytes(data)?;
        if header.frag != 0 {
            return Err(Error::protocol("fragmented SOCKS5 UDP is not supported"));
        }

        let server_addr = self
            .server_addr
            .ok_or_else(|| Error::connection("no server endpoint"))?;

        // Everything after the 3-byte prefix (address header + payload)
        // travels encrypted as-is.
        let ciphertext = self.encryptor.encrypt_packet(&data[3..])?;

        let key = AssocKey::PeerDest(peer, header.address.clone(), header.port);
        let socket = self.association(key, peer, server_addr).await?;
        socket.send_to(&ciphertext, server_addr).await?;
        Ok(())
    }

    /// Server mode: encrypted datagram from a remote client
    async fn handle_remote_datagram(&self, data: &[u8], peer: SocketAddr) -> Result<()> {
        if ban::is_banned(&peer.ip()) {
            return Err(Error::protocol("peer is banned"));
        }

        let plaintext = self.encryptor.decrypt_packet(data)?;
        let (address, port, consumed) = match Address::from_bytes(&plaintext) {
            Ok(parsed) => parsed,
            Err(e) => {
                if self.autoban {
                    warn!("banning {} after malformed datagram header", peer.ip());
                    ban::ban(peer.ip());
                }
                return Err(e);
            }
        };

        let ip = address.resolve(&self.resolver).await?;
        let target = SocketAddr::new(ip, port);

        let key = AssocKey::Peer(peer);
        let socket = self.association(key, peer, target).await?;
        socket.send_to(&plaintext[consumed..], target).await?;
        Ok(())
    }

    /// Look up or create the upstream socket for a flow
    async fn association(
        &self,
        key: AssocKey,
        peer: SocketAddr,
        target: SocketAddr,
    ) -> Result<Arc<UdpSocket>> {
        if let Some(assoc) = self.cache.lock().get(&key) {
            return Ok(assoc.socket.clone());
        }

        let bind_addr: SocketAddr = match target {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        let reader = spawn_upstream_reader(
            self.mode,
            socket.clone(),
            self.listen.clone(),
            self.encryptor.clone(),
            peer,
            key.clone(),
            self.cache.clone(),
        );

        let mut cache = self.cache.lock();
        cache.put(
            key,
            Association {
                socket: socket.clone(),
                reader,
            },
        );
        Ok(socket)
    }
}

/// Reader loop for one upstream socket: replies flow back to the owning
/// peer through the shared listen socket. The task unregisters itself if
/// its socket dies; eviction from the cache aborts it.
fn spawn_upstream_reader(
    mode: Mode,
    upstream: Arc<UdpSocket>,
    listen: Arc<UdpSocket>,
    encryptor: Arc<Encryptor>,
    peer: SocketAddr,
    key: AssocKey,
    cache: AssocCache,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_CAP];

        loop {
            let (n, from) = match upstream.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("upstream socket for {} closed: {}", peer, e);
                    let mut cache = cache.lock();
                    let stale = cache
                        .peek(&key)
                        .map(|assoc| Arc::ptr_eq(&assoc.socket, &upstream))
                        .unwrap_or(false);
                    if stale {
                        cache.pop(&key);
                    }
                    return;
                }
            };

            let response = match mode {
                // Decrypt the server's reply and re-wrap it for SOCKS5
                Mode::Client => match encryptor.decrypt_packet(&buf[..n]) {
                    Ok(plaintext) => match Address::from_bytes(&plaintext) {
                        Ok(_) => {
                            let mut out = Vec::with_capacity(3 + plaintext.len());
                            out.extend_from_slice(&[0x00, 0x00, 0x00]);
                            out.extend_from_slice(&plaintext);
                            out
                        }
                        Err(e) => {
                            debug!("dropping reply for {}: {}", peer, e);
                            continue;
                        }
                    },
                    Err(e) => {
                        debug!("dropping undecryptable reply for {}: {}", peer, e);
                        continue;
                    }
                },
                // Wrap the destination's reply in an address header and
                // encrypt the whole datagram
                Mode::Server => {
                    let mut plain = match Address::from(from.ip()).to_bytes(from.port()) {
                        Ok(header) => header,
                        Err(_) => continue,
                    };
                    plain.extend_from_slice(&buf[..n]);
                    match encryptor.encrypt_packet(&plain) {
                        Ok(ciphertext) => ciphertext,
                        Err(e) => {
                            debug!("encrypt failed for {}: {}", peer, e);
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = listen.send_to(&response, peer).await {
                debug!("reply to {} failed: {}", peer, e);
            }
        }
    })
}
