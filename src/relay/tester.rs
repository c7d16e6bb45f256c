//! One-shot server connectivity probe

use crate::common::net::Address;
use crate::dns::Resolver;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Probes whether a server endpoint accepts TCP connections and how long
/// the handshake takes. Used at client startup to report reachability.
pub struct AddressTester {
    host: String,
    port: u16,
}

impl AddressTester {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        AddressTester {
            host: host.into(),
            port,
        }
    }

    /// Connect under a deadline and report the elapsed time
    pub async fn ping(&self, resolver: &Resolver, deadline: Duration) -> Result<Duration> {
        let ip = Address::from(self.host.as_str()).resolve(resolver).await?;
        let addr = SocketAddr::new(ip, self.port);

        let start = Instant::now();
        let stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::timeout(format!("no answer from {} within {:?}", addr, deadline))
            })??;
        let elapsed = start.elapsed();

        drop(stream);
        Ok(elapsed)
    }
}
