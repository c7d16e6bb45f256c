//! TCP and UDP relay implementations

pub mod client;
pub mod server;
pub mod stream;
pub mod tester;
pub mod udp;

pub use client::ClientRelay;
pub use server::ServerRelay;
pub use stream::ShadowStream;
pub use tester::AddressTester;
pub use udp::UdpRelay;

use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Which side of the tunnel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// SOCKS5 front-end, encrypts towards the server
    Client,
    /// Decrypts from clients, dials the true destination
    Server,
}

const COPY_BUF: usize = 16 * 1024;

/// Accept errors that name a single doomed connection rather than the
/// listener itself
pub(crate) fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

/// Relay bytes in both directions until either side closes, either side
/// errors, or no byte has been read from either side for `idle`.
///
/// Returns (a-to-b, b-to-a) byte counts. Backpressure is inherent: each
/// direction is a read-then-write-all loop, so a stalled writer stops its
/// reader with at most one buffer in flight.
pub async fn pipe<A, B>(a: A, b: B, idle: Duration) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let activity = Arc::new(AtomicU64::new(0));

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let up = copy_half(a_read, b_write, started, activity.clone());
    let down = copy_half(b_read, a_write, started, activity.clone());

    tokio::select! {
        result = async { tokio::try_join!(up, down) } => {
            let (sent, received) = result?;
            Ok((sent, received))
        }
        _ = idle_watchdog(started, activity, idle) => {
            Err(Error::timeout("connection idle"))
        }
    }
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    started: Instant,
    activity: Arc<AtomicU64>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Forward the EOF so the far side can drain and close
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

async fn idle_watchdog(started: Instant, activity: Arc<AtomicU64>, idle: Duration) {
    loop {
        let last = Duration::from_millis(activity.load(Ordering::Relaxed));
        let since_last = started.elapsed().saturating_sub(last);
        if since_last >= idle {
            return;
        }
        tokio::time::sleep(idle - since_last).await;
    }
}
