//! End-to-end relay tests
//!
//! These spin up both relay roles on loopback and drive them with raw
//! SOCKS5 bytes, checking the full chain:
//! app -> client relay -> server relay -> destination and back.

use ssrelay::dns::Resolver;
use ssrelay::relay::{ClientRelay, ServerRelay, UdpRelay};
use ssrelay::{Address, Method, Mode, Profile};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn profile(method: &str, server_port: u16) -> Profile {
    Profile {
        server: "127.0.0.1".to_string(),
        server_port,
        local_address: "127.0.0.1".to_string(),
        local_port: 1,
        method: method.to_string(),
        password: "integration-test".to_string(),
        timeout: 5,
        ..Default::default()
    }
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Start a server relay and a client relay chained together, returning the
/// client relay's SOCKS5 endpoint.
async fn spawn_relay_chain(method: &str, autoban: bool) -> SocketAddr {
    let resolver = Arc::new(Resolver::new());
    let method_id = Method::from_name(method).unwrap();

    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_port = server_listener.local_addr().unwrap().port();
    let server_relay = Arc::new(ServerRelay::new(
        profile(method, server_port),
        method_id,
        resolver.clone(),
        autoban,
    ));
    tokio::spawn(server_relay.run(server_listener));

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    let client_relay = Arc::new(ClientRelay::new(
        profile(method, server_port),
        method_id,
        resolver,
    ));
    tokio::spawn(client_relay.run(client_listener));

    client_addr
}

async fn socks5_connect(relay: SocketAddr, dest: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(relay).await.unwrap();

    // Greeting: version 5, one method, no-auth
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // CONNECT to an IPv4 destination
    let ip = match dest {
        SocketAddr::V4(v4) => v4.ip().octets(),
        SocketAddr::V6(_) => panic!("test destinations are IPv4"),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip);
    request.extend_from_slice(&dest.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    // Fixed success reply with an unspecified bind address
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    stream
}

async fn tcp_end_to_end(method: &str) {
    let echo = spawn_tcp_echo().await;
    let relay = spawn_relay_chain(method, false).await;

    let mut stream = socks5_connect(relay, echo).await;

    let payload = b"Hello Shadowsocks, end to end!";
    stream.write_all(payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    stream.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, payload);

    // A second exchange exercises the established stream state
    stream.write_all(b"second round").await.unwrap();
    let mut received = [0u8; 12];
    stream.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"second round");
}

#[tokio::test]
async fn test_tcp_end_to_end_aead() {
    tokio::time::timeout(TEST_TIMEOUT, tcp_end_to_end("aes-256-gcm"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_tcp_end_to_end_chacha() {
    tokio::time::timeout(TEST_TIMEOUT, tcp_end_to_end("chacha20-ietf-poly1305"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_tcp_end_to_end_stream_cipher() {
    tokio::time::timeout(TEST_TIMEOUT, tcp_end_to_end("aes-256-cfb"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_tcp_end_to_end_rc4_md5() {
    tokio::time::timeout(TEST_TIMEOUT, tcp_end_to_end("rc4-md5"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_socks5_bind_rejected() {
    let relay = spawn_relay_chain("aes-256-gcm", false).await;

    let run = async {
        let mut stream = TcpStream::connect(relay).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // BIND to 0.0.0.0:0
        stream
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        // Command not supported
        assert_eq!(reply[1], 0x07);
    };
    tokio::time::timeout(TEST_TIMEOUT, run).await.unwrap();
}

async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let _ = socket.send_to(&buf[..n], from).await;
                }
                Err(_) => return,
            }
        }
    });

    addr
}

#[tokio::test]
async fn test_udp_end_to_end() {
    let run = async {
        let resolver = Arc::new(Resolver::new());
        let method = Method::from_name("aes-256-gcm").unwrap();
        let echo = spawn_udp_echo().await;

        let server_relay = Arc::new(
            UdpRelay::bind(
                &profile("aes-256-gcm", 1),
                method,
                Mode::Server,
                resolver.clone(),
                false,
                "127.0.0.1:0".parse().unwrap(),
            )
            .await
            .unwrap(),
        );
        let server_port = server_relay.local_addr().unwrap().port();
        tokio::spawn(server_relay.run());

        let client_relay = Arc::new(
            UdpRelay::bind(
                &profile("aes-256-gcm", server_port),
                method,
                Mode::Client,
                resolver,
                false,
                "127.0.0.1:0".parse().unwrap(),
            )
            .await
            .unwrap(),
        );
        let client_addr = client_relay.local_addr().unwrap();
        tokio::spawn(client_relay.run());

        // SOCKS5-wrapped datagram: RSV RSV FRAG || ATYP addr port || payload
        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = vec![0x00, 0x00, 0x00];
        datagram.extend_from_slice(
            &Address::from("127.0.0.1").to_bytes(echo.port()).unwrap(),
        );
        datagram.extend_from_slice(b"ping over udp");
        app.send_to(&datagram, client_addr).await.unwrap();

        let mut buf = vec![0u8; 65536];
        let (n, from) = app.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, client_addr);

        // Reply carries the SOCKS5 wrapper with the source address
        assert_eq!(&buf[..3], &[0x00, 0x00, 0x00]);
        let (addr, port, consumed) = Address::from_bytes(&buf[3..n]).unwrap();
        assert_eq!(addr, Address::from("127.0.0.1"));
        assert_eq!(port, echo.port());
        assert_eq!(&buf[3 + consumed..n], b"ping over udp");
    };
    tokio::time::timeout(TEST_TIMEOUT, run).await.unwrap();
}

#[tokio::test]
async fn test_server_bans_malformed_header() {
    let run = async {
        let resolver = Arc::new(Resolver::new());
        let method = Method::from_name("aes-256-cfb").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server_relay = Arc::new(ServerRelay::new(
            profile("aes-256-cfb", server_addr.port()),
            method,
            resolver,
            true,
        ));
        tokio::spawn(server_relay.run(listener));

        // The offender binds a distinct loopback source so the ban does
        // not affect other tests in this process.
        let offender_src: SocketAddr = "127.0.0.3:0".parse().unwrap();

        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(offender_src).unwrap();
        let mut stream = socket.connect(server_addr).await.unwrap();

        // Correctly encrypted bytes whose header has an invalid ATYP
        let mut enc =
            ssrelay::Encryptor::new(method, "integration-test").unwrap();
        let garbage = enc.encrypt(&[0xFF, 1, 2, 3, 4, 5, 6]).unwrap();
        stream.write_all(&garbage).await.unwrap();

        // Server closes after banning
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        drop(stream);

        // A fresh connection from the banned source is dropped before any
        // protocol handling
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(offender_src).unwrap();
        let mut stream = socket.connect(server_addr).await.unwrap();
        let mut enc =
            ssrelay::Encryptor::new(method, "integration-test").unwrap();
        let valid = enc
            .encrypt(&Address::from("127.0.0.1").to_bytes(9).unwrap())
            .unwrap();
        let _ = stream.write_all(&valid).await;

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    };
    tokio::time::timeout(TEST_TIMEOUT, run).await.unwrap();
}
