//! Network address handling and the Shadowsocks wire address codec
//!
//! The Shadowsocks header carries the upstream destination as
//! `ATYP(1) || body || port(2, big-endian)` with ATYP 1 = IPv4,
//! 3 = domain (length-prefixed), 4 = IPv6. The same encoding is reused
//! by the SOCKS5 front-end.

use crate::dns::Resolver;
use crate::{Error, Result};
use socket2::SockRef;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Destination address: hostname or IP
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Parse from the wire format, returning the address, the port and the
    /// number of bytes consumed.
    ///
    /// This is the validation point for freshly decrypted bytes: a failure
    /// here on the server side marks the peer as a probe candidate.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, u16, usize)> {
        if data.is_empty() {
            return Err(Error::protocol("address header too short"));
        }

        match data[0] {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(Error::protocol("address header too short for IPv4"));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                if port == 0 {
                    return Err(Error::protocol("address header has zero port"));
                }
                Ok((Address::Ipv4(ip), port, 7))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(Error::protocol("address header too short for domain"));
                }
                let len = data[1] as usize;
                if len == 0 {
                    return Err(Error::protocol("empty domain name"));
                }
                if data.len() < 2 + len + 2 {
                    return Err(Error::protocol("address header too short for domain"));
                }
                let domain = parse_domain(&data[2..2 + len])?;
                let port = u16::from_be_bytes([data[2 + len], data[2 + len + 1]]);
                if port == 0 {
                    return Err(Error::protocol("address header has zero port"));
                }
                Ok((Address::Domain(domain), port, 4 + len))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(Error::protocol("address header too short for IPv6"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([data[17], data[18]]);
                if port == 0 {
                    return Err(Error::protocol("address header has zero port"));
                }
                Ok((Address::Ipv6(ip), port, 19))
            }
            t => Err(Error::protocol(format!("unknown address type: {}", t))),
        }
    }

    /// Incremental wire parse from an async reader. Used on the server side
    /// where decrypted bytes may arrive in arbitrarily small batches; each
    /// `read_exact` keeps buffering until the field is complete.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                if port == 0 {
                    return Err(Error::protocol("address header has zero port"));
                }
                Ok((addr, port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                if len == 0 {
                    return Err(Error::protocol("empty domain name"));
                }
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = parse_domain(&buf[..len])?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                if port == 0 {
                    return Err(Error::protocol("address header has zero port"));
                }
                Ok((Address::Domain(domain), port))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                if port == 0 {
                    return Err(Error::protocol("address header has zero port"));
                }
                Ok((addr, port))
            }
            t => Err(Error::protocol(format!("unknown address type: {}", t))),
        }
    }

    /// Append the wire form to `buf`
    pub fn write_bytes(&self, port: u16, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.is_empty() || bytes.len() > 255 {
                    return Err(Error::address(format!(
                        "domain name length {} out of range",
                        bytes.len()
                    )));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(())
    }

    /// Serialize to the wire form
    pub fn to_bytes(&self, port: u16) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.write_bytes(port, &mut buf)?;
        Ok(buf)
    }

    /// Length of the wire form
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,
            Address::Ipv6(_) => 1 + 16 + 2,
            Address::Domain(d) => 1 + 1 + d.len() + 2,
        }
    }

    /// Resolve to a single IP. IP variants return immediately; domains go
    /// through the resolver, which memoizes results.
    pub async fn resolve(&self, resolver: &Resolver) -> Result<IpAddr> {
        match self {
            Address::Ipv4(ip) => Ok(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Ok(IpAddr::V6(*ip)),
            Address::Domain(d) => resolver.resolve(d).await,
        }
    }
}

/// Domains on the wire must not carry NULs or control bytes: decrypting
/// garbage with a stream cipher produces random bytes, and this check is
/// what turns that garbage into a detectable malformed header.
fn parse_domain(bytes: &[u8]) -> Result<String> {
    if bytes.iter().any(|&b| b < 0x20 || b == 0x7F) {
        return Err(Error::protocol("domain name contains control bytes"));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::protocol(format!("invalid domain: {}", e)))
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ipv4(ip)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::Ipv6(ip)
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        // IP literals must never serialize as ATYP 3
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(host.to_string())
    }
}

impl From<String> for Address {
    fn from(host: String) -> Self {
        Address::from(host.as_str())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Ipv6(ip) => write!(f, "{}", ip),
            Address::Domain(d) => write!(f, "{}", d),
        }
    }
}
