//! Stateful encryption codec
//!
//! One `Encryptor` per connection, holding both the outbound and the
//! inbound cipher context. Stream methods prepend a one-time IV per
//! direction; AEAD methods prepend a one-time salt and then frame the
//! stream into length-prefixed records:
//!
//! ```text
//! [len(2, BE) sealed || tag(16)] [payload sealed || tag(16)] ...
//! ```
//!
//! with the payload capped at 0x3FFF bytes per record and a fresh nonce
//! for every seal. The `*_packet` operations are the one-shot datagram
//! variants: fresh IV (or fresh salt and nonce zero) per datagram, no
//! record framing, and no interaction with the TCP stream state.

use bytes::{Buf, BytesMut};

use crate::crypto::cipher::{AeadCipher, Direction, StreamCipher, TableCipher};
use crate::crypto::{kdf, CipherInfo, CipherKind, Method};
use crate::{Error, Result};

/// Maximum AEAD record payload
pub const MAX_PAYLOAD: usize = 0x3FFF;

enum CipherState {
    Stream(StreamCipher),
    Aead(AeadCipher),
}

/// Stateful codec owning one encrypt and one decrypt context
pub struct Encryptor {
    method: Method,
    info: CipherInfo,
    master_key: Vec<u8>,
    /// Table method only: precomputed (encrypt, decrypt) substitution pair
    table: Option<(TableCipher, TableCipher)>,
    enc: Option<CipherState>,
    dec: Option<CipherState>,
    /// Inbound bytes not yet decryptable (partial IV, salt or record)
    dec_buf: BytesMut,
    /// AEAD: an opened record length whose payload has not arrived yet.
    /// The length record's nonce is already consumed, so it must not be
    /// opened twice.
    dec_pending_len: Option<usize>,
}

impl Encryptor {
    pub fn new(method: Method, password: &str) -> Result<Self> {
        let info = method.info();
        let master_key = kdf::evp_bytes_to_key(password.as_bytes(), info.key_len);
        let table = match info.kind {
            CipherKind::Table => Some(TableCipher::new_pair(password.as_bytes())),
            _ => None,
        };

        Ok(Encryptor {
            method,
            info,
            master_key,
            table,
            enc: None,
            dec: None,
            dec_buf: BytesMut::new(),
            dec_pending_len: None,
        })
    }

    /// Encrypt the next piece of the outbound stream. The first call emits
    /// the IV (stream) or salt (AEAD) before any ciphertext.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.info.kind {
            CipherKind::Aead => self.encrypt_aead(data),
            _ => self.encrypt_stream(data),
        }
    }

    /// Decrypt the next piece of the inbound stream. Returns whatever
    /// plaintext is complete so far; an empty result means more input is
    /// needed. AEAD tag failures and oversize records are fatal.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.info.kind {
            CipherKind::Aead => self.decrypt_aead(data),
            _ => self.decrypt_stream(data),
        }
    }

    fn encrypt_stream(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match &mut self.enc {
            Some(CipherState::Stream(cipher)) => {
                let mut out = data.to_vec();
                cipher.update(&mut out);
                Ok(out)
            }
            None => {
                let iv = kdf::random_bytes(self.info.iv_len)?;
                let mut cipher = self.new_stream_cipher(&iv, Direction::Encrypt)?;
                let mut out = Vec::with_capacity(iv.len() + data.len());
                out.extend_from_slice(&iv);
                let start = out.len();
                out.extend_from_slice(data);
                cipher.update(&mut out[start..]);
                self.enc = Some(CipherState::Stream(cipher));
                Ok(out)
            }
            Some(CipherState::Aead(_)) => Err(Error::crypto("cipher state mismatch")),
        }
    }

    fn decrypt_stream(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if let Some(CipherState::Stream(cipher)) = &mut self.dec {
            let mut out = data.to_vec();
            cipher.update(&mut out);
            return Ok(out);
        }

        // Still waiting for the peer's IV
        self.dec_buf.extend_from_slice(data);
        if self.dec_buf.len() < self.info.iv_len {
            return Ok(Vec::new());
        }

        let iv = self.dec_buf.split_to(self.info.iv_len);
        let mut cipher = self.new_stream_cipher(&iv, Direction::Decrypt)?;

        let mut out = self.dec_buf.split().to_vec();
        cipher.update(&mut out);
        self.dec = Some(CipherState::Stream(cipher));
        Ok(out)
    }

    fn encrypt_aead(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        if self.enc.is_none() {
            let salt = kdf::random_bytes(self.info.salt_len)?;
            let subkey = kdf::derive_subkey(&self.master_key, &salt, self.info.key_len)?;
            out.extend_from_slice(&salt);
            self.enc = Some(CipherState::Aead(AeadCipher::new(self.method, &subkey)?));
        }

        let cipher = match &mut self.enc {
            Some(CipherState::Aead(c)) => c,
            _ => return Err(Error::crypto("cipher state mismatch")),
        };

        for chunk in data.chunks(MAX_PAYLOAD) {
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            out.extend_from_slice(&cipher.seal(&len_bytes)?);
            out.extend_from_slice(&cipher.seal(chunk)?);
        }

        Ok(out)
    }

    fn decrypt_aead(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.dec_buf.extend_from_slice(data);

        if self.dec.is_none() {
            if self.dec_buf.len() < self.info.salt_len {
                return Ok(Vec::new());
            }
            let salt = self.dec_buf.split_to(self.info.salt_len);
            let subkey = kdf::derive_subkey(&self.master_key, &salt, self.info.key_len)?;
            self.dec = Some(CipherState::Aead(AeadCipher::new(self.method, &subkey)?));
        }

        let cipher = match &mut self.dec {
            Some(CipherState::Aead(c)) => c,
            _ => return Err(Error::crypto("cipher state mismatch")),
        };

        let tag_len = self.info.tag_len;
        let mut out = Vec::new();

        loop {
            let payload_len = match self.dec_pending_len {
                Some(len) => len,
                None => {
                    if self.dec_buf.len() < 2 + tag_len {
                        break;
                    }
                    let len_plain = cipher.open(&self.dec_buf[..2 + tag_len])?;
                    self.dec_buf.advance(2 + tag_len);

                    let len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
                    if len > MAX_PAYLOAD {
                        return Err(Error::crypto(format!(
                            "record length {} exceeds maximum {}",
                            len, MAX_PAYLOAD
                        )));
                    }
                    self.dec_pending_len = Some(len);
                    len
                }
            };

            if self.dec_buf.len() < payload_len + tag_len {
                break;
            }
            let payload = cipher.open(&self.dec_buf[..payload_len + tag_len])?;
            self.dec_buf.advance(payload_len + tag_len);
            self.dec_pending_len = None;
            out.extend_from_slice(&payload);
        }

        Ok(out)
    }

    /// Encrypt a standalone datagram: fresh IV or fresh salt, no framing
    pub fn encrypt_packet(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.info.kind {
            CipherKind::Aead => {
                let salt = kdf::random_bytes(self.info.salt_len)?;
                let subkey = kdf::derive_subkey(&self.master_key, &salt, self.info.key_len)?;
                let mut cipher = AeadCipher::new(self.method, &subkey)?;
                let mut out = Vec::with_capacity(salt.len() + data.len() + self.info.tag_len);
                out.extend_from_slice(&salt);
                out.extend_from_slice(&cipher.seal(data)?);
                Ok(out)
            }
            _ => {
                let iv = kdf::random_bytes(self.info.iv_len)?;
                let mut cipher = self.new_stream_cipher(&iv, Direction::Encrypt)?;
                let mut out = Vec::with_capacity(iv.len() + data.len());
                out.extend_from_slice(&iv);
                let start = out.len();
                out.extend_from_slice(data);
                cipher.update(&mut out[start..]);
                Ok(out)
            }
        }
    }

    /// Decrypt a standalone datagram
    pub fn decrypt_packet(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.info.kind {
            CipherKind::Aead => {
                if data.len() < self.info.salt_len + self.info.tag_len {
                    return Err(Error::crypto("datagram too short"));
                }
                let (salt, sealed) = data.split_at(self.info.salt_len);
                let subkey = kdf::derive_subkey(&self.master_key, salt, self.info.key_len)?;
                let mut cipher = AeadCipher::new(self.method, &subkey)?;
                cipher.open(sealed)
            }
            _ => {
                if data.len() < self.info.iv_len {
                    return Err(Error::crypto("datagram too short"));
                }
                let (iv, body) = data.split_at(self.info.iv_len);
                let mut cipher = self.new_stream_cipher(iv, Direction::Decrypt)?;
                let mut out = body.to_vec();
                cipher.update(&mut out);
                Ok(out)
            }
        }
    }

    fn new_stream_cipher(&self, iv: &[u8], direction: Direction) -> Result<StreamCipher> {
        if let Some((enc, dec)) = &self.table {
            let table = match direction {
                Direction::Encrypt => enc.clone(),
                Direction::Decrypt => dec.clone(),
            };
            return Ok(StreamCipher::Table(table));
        }
        StreamCipher::new(self.method, &self.master_key, iv, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_roundtrip_lengths() {
        // iv(16) + 17 bytes of ciphertext
        let mut enc = Encryptor::new(Method::Aes256Cfb, "test").unwrap();
        let mut dec = Encryptor::new(Method::Aes256Cfb, "test").unwrap();

        let ct = enc.encrypt(b"Hello Shadowsocks").unwrap();
        assert_eq!(ct.len(), 16 + 17);

        let pt = dec.decrypt(&ct).unwrap();
        assert_eq!(pt, b"Hello Shadowsocks");

        // No IV on subsequent calls
        let ct2 = enc.encrypt(b"more").unwrap();
        assert_eq!(ct2.len(), 4);
        assert_eq!(dec.decrypt(&ct2).unwrap(), b"more");
    }

    #[test]
    fn test_stream_decrypt_partial_iv() {
        let mut enc = Encryptor::new(Method::Aes256Cfb, "test").unwrap();
        let mut dec = Encryptor::new(Method::Aes256Cfb, "test").unwrap();

        let ct = enc.encrypt(b"Hello Shadowsocks").unwrap();

        // First feed is shorter than the IV: no output yet
        assert!(dec.decrypt(&ct[..10]).unwrap().is_empty());
        assert_eq!(dec.decrypt(&ct[10..]).unwrap(), b"Hello Shadowsocks");
    }

    #[test]
    fn test_aead_first_encrypt_length() {
        // salt(32) + len record(2+16) + payload record(17+16) = 83
        let mut enc = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
        let ct = enc.encrypt(b"Hello Shadowsocks").unwrap();
        assert_eq!(ct.len(), 83);

        // Subsequent records carry no salt: 2+16 + 17+16 = 51
        let ct2 = enc.encrypt(b"Hello Shadowsocks").unwrap();
        assert_eq!(ct2.len(), 51);
    }

    #[test]
    fn test_aead_roundtrip_chunk_boundaries() {
        let mut enc = Encryptor::new(Method::Aes256Gcm, "test").unwrap();

        let mut wire = enc.encrypt(b"Hello").unwrap();
        wire.extend_from_slice(&enc.encrypt(b" Bye").unwrap());

        // Any split of the concatenated stream decodes to the same bytes
        for split in [1, 33, 50, wire.len() - 1] {
            let mut dec = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
            let mut pt = dec.decrypt(&wire[..split]).unwrap();
            pt.extend_from_slice(&dec.decrypt(&wire[split..]).unwrap());
            assert_eq!(pt, b"Hello Bye");
        }
    }

    #[test]
    fn test_aead_partial_feed() {
        let mut enc = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
        let wire = enc.encrypt(b"Hello Shadowsocks").unwrap();

        let mut dec = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
        // 50 bytes covers the salt and the length record but not the payload
        assert!(dec.decrypt(&wire[..50]).unwrap().is_empty());
        assert_eq!(dec.decrypt(&wire[50..]).unwrap(), b"Hello Shadowsocks");
    }

    #[test]
    fn test_aead_large_payload_chunked() {
        let mut enc = Encryptor::new(Method::ChaCha20IetfPoly1305, "test").unwrap();
        let mut dec = Encryptor::new(Method::ChaCha20IetfPoly1305, "test").unwrap();

        let plaintext = vec![0xA5u8; MAX_PAYLOAD + 5];
        let wire = enc.encrypt(&plaintext).unwrap();
        // salt + two records
        assert_eq!(wire.len(), 32 + (2 + 16 + MAX_PAYLOAD + 16) + (2 + 16 + 5 + 16));
        assert_eq!(dec.decrypt(&wire).unwrap(), plaintext);
    }

    #[test]
    fn test_aead_tamper_is_fatal() {
        let mut enc = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
        let mut wire = enc.encrypt(b"Hello Shadowsocks").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;

        let mut dec = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
        assert!(dec.decrypt(&wire).is_err());
    }

    #[test]
    fn test_aead_oversize_length_is_fatal() {
        // Hand-craft a stream whose length record claims > 0x3FFF
        let master = kdf::evp_bytes_to_key(b"test", 32);
        let salt = [0u8; 32];
        let subkey = kdf::derive_subkey(&master, &salt, 32).unwrap();
        let mut cipher = AeadCipher::new(Method::Aes256Gcm, &subkey).unwrap();

        let mut wire = salt.to_vec();
        wire.extend_from_slice(&cipher.seal(&0x7FFFu16.to_be_bytes()).unwrap());

        let mut dec = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
        assert!(dec.decrypt(&wire).is_err());
    }

    #[test]
    fn test_packet_roundtrip_aead() {
        let enc = Encryptor::new(Method::Aes256Gcm, "test").unwrap();

        let a = enc.encrypt_packet(b"datagram one").unwrap();
        let b = enc.encrypt_packet(b"datagram one").unwrap();
        // Fresh salt per datagram
        assert_ne!(a, b);
        assert_eq!(a.len(), 32 + 12 + 16);

        assert_eq!(enc.decrypt_packet(&a).unwrap(), b"datagram one");
        assert_eq!(enc.decrypt_packet(&b).unwrap(), b"datagram one");
    }

    #[test]
    fn test_packet_roundtrip_stream() {
        let enc = Encryptor::new(Method::Aes256Cfb, "test").unwrap();

        let wire = enc.encrypt_packet(b"datagram").unwrap();
        assert_eq!(wire.len(), 16 + 8);
        assert_eq!(enc.decrypt_packet(&wire).unwrap(), b"datagram");
    }

    #[test]
    fn test_packet_independent_of_stream_state() {
        let mut enc = Encryptor::new(Method::Aes256Gcm, "test").unwrap();
        let mut dec = Encryptor::new(Method::Aes256Gcm, "test").unwrap();

        let mut wire = enc.encrypt(b"stream ").unwrap();

        // Datagram operations in between must not consume stream nonces
        let packet = enc.encrypt_packet(b"datagram").unwrap();
        assert_eq!(enc.decrypt_packet(&packet).unwrap(), b"datagram");

        wire.extend_from_slice(&enc.encrypt(b"traffic").unwrap());
        assert_eq!(dec.decrypt(&wire).unwrap(), b"stream traffic");
    }

    #[test]
    fn test_roundtrip_every_method() {
        for (name, method) in crate::crypto::METHODS {
            let mut enc = Encryptor::new(*method, "barfoo!").unwrap();
            let mut dec = Encryptor::new(*method, "barfoo!").unwrap();

            let wire = enc.encrypt(b"Hello World!").unwrap();
            assert_eq!(
                dec.decrypt(&wire).unwrap(),
                b"Hello World!",
                "round trip failed for {}",
                name
            );
        }
    }

    #[test]
    fn test_rc4_md5_roundtrip() {
        let mut enc = Encryptor::new(Method::Rc4Md5, "test").unwrap();
        let mut dec = Encryptor::new(Method::Rc4Md5, "test").unwrap();

        let wire = enc.encrypt(b"Hello Shadowsocks").unwrap();
        assert_eq!(wire.len(), 16 + 17);
        assert_eq!(dec.decrypt(&wire).unwrap(), b"Hello Shadowsocks");
    }

    #[test]
    fn test_table_roundtrip_no_iv() {
        let mut enc = Encryptor::new(Method::Table, "barfoo!").unwrap();
        let mut dec = Encryptor::new(Method::Table, "barfoo!").unwrap();

        let wire = enc.encrypt(b"Hello World!").unwrap();
        assert_eq!(wire.len(), 12);
        assert_eq!(dec.decrypt(&wire).unwrap(), b"Hello World!");
    }
}
