//! Encrypted stream adapter
//!
//! [`ShadowStream`] wraps a byte stream and an [`Encryptor`]: writes are
//! encrypted before they reach the wire, reads are decrypted after they
//! leave it. Both cipher families work through the same adapter since the
//! Encryptor owns the framing.

use crate::crypto::encryptor::MAX_PAYLOAD;
use crate::crypto::Encryptor;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const READ_CHUNK: usize = 16 * 1024;

enum WriteState {
    Ready,
    Writing {
        data: Vec<u8>,
        written: usize,
        consumed: usize,
    },
}

/// A byte stream with transparent Shadowsocks encryption
pub struct ShadowStream<S> {
    inner: S,
    encryptor: Encryptor,
    /// Decrypted plaintext not yet handed to the reader
    pending: Vec<u8>,
    pending_pos: usize,
    write_state: WriteState,
}

impl<S> ShadowStream<S> {
    pub fn new(inner: S, encryptor: Encryptor) -> Self {
        ShadowStream {
            inner,
            encryptor,
            pending: Vec::new(),
            pending_pos: 0,
            write_state: WriteState::Ready,
        }
    }

}

impl<S: AsyncRead + Unpin> AsyncRead for ShadowStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pending_pos < this.pending.len() {
                let remaining = &this.pending[this.pending_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                this.pending_pos += to_copy;
                if this.pending_pos >= this.pending.len() {
                    this.pending.clear();
                    this.pending_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        // EOF; any bytes still buffered inside the
                        // Encryptor belong to an incomplete record and are
                        // dropped with the connection.
                        return Poll::Ready(Ok(()));
                    }
                    match this.encryptor.decrypt(filled) {
                        Ok(plaintext) => {
                            if !plaintext.is_empty() {
                                this.pending = plaintext;
                                this.pending_pos = 0;
                            }
                            // Not enough ciphertext for a full record yet:
                            // keep polling the inner stream.
                        }
                        Err(e) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                e.to_string(),
                            )))
                        }
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShadowStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }

                    // Bound the ciphertext held in flight
                    let consumed = buf.len().min(MAX_PAYLOAD);
                    let data = this
                        .encryptor
                        .encrypt(&buf[..consumed])
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

                    this.write_state = WriteState::Writing {
                        data,
                        written: 0,
                        consumed,
                    };
                }
                WriteState::Writing {
                    data,
                    written,
                    consumed,
                } => {
                    while *written < data.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &data[*written..]) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::WriteZero,
                                    "write returned 0",
                                )))
                            }
                            Poll::Ready(Ok(n)) => *written += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let n = *consumed;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(n));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
