//! SOCKS5 protocol subset for the local front-end
//!
//! Only what a Shadowsocks local needs: no-authentication negotiation,
//! CONNECT and UDP ASSOCIATE commands, and the UDP request wrapper.
//! BIND is rejected.

use super::net::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::protocol(format!("unknown SOCKS5 command: {}", value))),
        }
    }
}

/// SOCKS5 greeting (`0x05 || nmethods || methods`)
#[derive(Debug)]
pub struct AuthRequest {
    pub methods: Vec<u8>,
}

impl AuthRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "unsupported SOCKS version: {}",
                head[0]
            )));
        }

        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(AuthRequest { methods })
    }

    pub fn supports(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// SOCKS5 method selection reply
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        AuthResponse { method }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.method]).await?;
        Ok(())
    }
}

/// SOCKS5 request (`0x05 || CMD || 0x00 || ATYP || addr || port`)
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "unsupported SOCKS version: {}",
                header[0]
            )));
        }

        let command = Command::try_from(header[1])?;

        // Reserved byte (header[2]) is ignored
        let (address, port) = read_address_and_port(reader, header[3]).await?;

        Ok(Request {
            command,
            address,
            port,
        })
    }
}

/// The SOCKS5 request address reader is deliberately more lenient than the
/// Shadowsocks wire parser: UDP ASSOCIATE requests may legitimately carry
/// 0.0.0.0:0.
async fn read_address_and_port<R: AsyncRead + Unpin>(
    reader: &mut R,
    atyp: u8,
) -> Result<(Address, u16)> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            reader.read_exact(&mut buf).await?;
            let addr = Address::Ipv4(std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((addr, port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let len = len[0] as usize;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let domain = String::from_utf8(buf)
                .map_err(|e| Error::protocol(format!("invalid domain: {}", e)))?;
            Ok((Address::Domain(domain), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            reader.read_exact(&mut buf).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            let addr = Address::Ipv6(std::net::Ipv6Addr::from(ip));
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((addr, port))
        }
        t => Err(Error::protocol(format!("unknown address type: {}", t))),
    }
}

/// SOCKS5 reply
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response {
            reply: REP_SUCCEEDED,
            address,
            port,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + self.address.serialized_len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.reply, 0x00]);
        self.address.write_bytes(self.port, &mut buf)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// SOCKS5 UDP request wrapper
/// (`RSV(2) || FRAG(1) || ATYP || addr || port || payload`)
#[derive(Debug)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: Address,
    pub port: u16,
}

impl UdpHeader {
    /// Parse from a datagram, returning the header and its length
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(Error::protocol("SOCKS5 UDP header too short"));
        }

        let frag = data[2];
        let (address, port, consumed) = Address::from_bytes(&data[3..])?;

        Ok((
            UdpHeader {
                frag,
                address,
                port,
            },
            3 + consumed,
        ))
    }

    /// Serialize, including the RSV + FRAG prefix
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(3 + self.address.serialized_len());
        buf.extend_from_slice(&[0x00, 0x00, self.frag]);
        self.address.write_bytes(self.port, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(0x01).unwrap(), Command::Connect);
        assert_eq!(Command::try_from(0x03).unwrap(), Command::UdpAssociate);
        assert!(Command::try_from(0x09).is_err());
    }

    #[test]
    fn test_udp_header_roundtrip() {
        let header = UdpHeader {
            frag: 0,
            address: Address::Ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
            port: 8080,
        };

        let bytes = header.to_bytes().unwrap();
        assert_eq!(&bytes[..3], &[0x00, 0x00, 0x00]);

        let (parsed, len) = UdpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.frag, 0);
        assert_eq!(parsed.port, 8080);
        assert_eq!(len, bytes.len());
        assert!(matches!(parsed.address, Address::Ipv4(_)));
    }

    #[tokio::test]
    async fn test_auth_request() {
        let mut data = std::io::Cursor::new(vec![0x05, 0x02, 0x00, 0x02]);
        let req = AuthRequest::read_from(&mut data).await.unwrap();
        assert!(req.supports(AUTH_NO_AUTH));
        assert!(!req.supports(0x01));
    }

    #[tokio::test]
    async fn test_auth_request_bad_version() {
        let mut data = std::io::Cursor::new(vec![0x04, 0x01, 0x00]);
        assert!(AuthRequest::read_from(&mut data).await.is_err());
    }

    #[tokio::test]
    async fn test_request_connect() {
        // 05 01 00 01 C0A80101 0050
        let mut data = std::io::Cursor::new(vec![
            0x05, 0x01, 0x00, 0x01, 0xC0, 0xA8, 0x01, 0x01, 0x00, 0x50,
        ]);
        let req = Request::read_from(&mut data).await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.port, 80);
        assert_eq!(req.address, Address::from("192.168.1.1"));
    }

    #[tokio::test]
    async fn test_response_dummy_success() {
        let mut buf = Vec::new();
        Response::success(Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED), 0)
            .write_to(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
