//! Cipher method registry and the encryption pipeline
//!
//! The registry is a static, read-only table mapping method names to their
//! parameters. Everything else in the pipeline (key derivation, primitive
//! wrappers, the stateful codec) hangs off a [`Method`] value.

pub mod cipher;
pub mod encryptor;
pub mod kdf;

pub use cipher::{AeadCipher, StreamCipher};
pub use encryptor::Encryptor;

use crate::{Error, Result};

/// Cipher construction family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// Keystream cipher; IV prepended once per direction
    Stream,
    /// Authenticated cipher; salt-derived subkey, length-prefixed records
    Aead,
    /// RC4 keyed with `MD5(master_key || iv)`; no IV input to the cipher
    Rc4Md5,
    /// Deprecated password-derived translation table; no key material
    Table,
}

/// Registry entry: per-method parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherInfo {
    pub kind: CipherKind,
    pub key_len: usize,
    /// Stream ciphers and rc4-md5 only
    pub iv_len: usize,
    /// AEAD only
    pub salt_len: usize,
    /// AEAD only
    pub nonce_len: usize,
    /// AEAD only; 16 for every supported AEAD
    pub tag_len: usize,
}

const fn stream(key_len: usize, iv_len: usize) -> CipherInfo {
    CipherInfo {
        kind: CipherKind::Stream,
        key_len,
        iv_len,
        salt_len: 0,
        nonce_len: 0,
        tag_len: 0,
    }
}

const fn aead(key_len: usize, salt_len: usize, nonce_len: usize) -> CipherInfo {
    CipherInfo {
        kind: CipherKind::Aead,
        key_len,
        iv_len: 0,
        salt_len,
        nonce_len,
        tag_len: 16,
    }
}

/// Supported cipher method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Camellia128Cfb,
    Camellia192Cfb,
    Camellia256Cfb,
    ChaCha20,
    ChaCha20Ietf,
    Salsa20,
    Rc4Md5,
    Table,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
    XChaCha20IetfPoly1305,
}

/// The registry: every supported method with its canonical name.
/// Read-only after init; lookups never mutate it.
pub static METHODS: &[(&str, Method)] = &[
    ("aes-128-cfb", Method::Aes128Cfb),
    ("aes-192-cfb", Method::Aes192Cfb),
    ("aes-256-cfb", Method::Aes256Cfb),
    ("aes-128-ctr", Method::Aes128Ctr),
    ("aes-192-ctr", Method::Aes192Ctr),
    ("aes-256-ctr", Method::Aes256Ctr),
    ("camellia-128-cfb", Method::Camellia128Cfb),
    ("camellia-192-cfb", Method::Camellia192Cfb),
    ("camellia-256-cfb", Method::Camellia256Cfb),
    ("chacha20", Method::ChaCha20),
    ("chacha20-ietf", Method::ChaCha20Ietf),
    ("salsa20", Method::Salsa20),
    ("rc4-md5", Method::Rc4Md5),
    ("table", Method::Table),
    ("aes-128-gcm", Method::Aes128Gcm),
    ("aes-192-gcm", Method::Aes192Gcm),
    ("aes-256-gcm", Method::Aes256Gcm),
    ("chacha20-ietf-poly1305", Method::ChaCha20IetfPoly1305),
    ("xchacha20-ietf-poly1305", Method::XChaCha20IetfPoly1305),
];

impl Method {
    /// Look a method up by name (case-insensitive)
    pub fn from_name(name: &str) -> Result<Self> {
        let lower = name.to_lowercase();
        METHODS
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, m)| *m)
            .ok_or_else(|| Error::config(format!("cipher method '{}' is not supported", name)))
    }

    /// Canonical method name
    pub fn name(&self) -> &'static str {
        METHODS
            .iter()
            .find(|(_, m)| m == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }

    /// Registry parameters for this method
    pub fn info(&self) -> CipherInfo {
        match self {
            Method::Aes128Cfb => stream(16, 16),
            Method::Aes192Cfb => stream(24, 16),
            Method::Aes256Cfb => stream(32, 16),
            Method::Aes128Ctr => stream(16, 16),
            Method::Aes192Ctr => stream(24, 16),
            Method::Aes256Ctr => stream(32, 16),
            Method::Camellia128Cfb => stream(16, 16),
            Method::Camellia192Cfb => stream(24, 16),
            Method::Camellia256Cfb => stream(32, 16),
            Method::ChaCha20 => stream(32, 8),
            Method::ChaCha20Ietf => stream(32, 12),
            Method::Salsa20 => stream(32, 8),
            Method::Rc4Md5 => CipherInfo {
                kind: CipherKind::Rc4Md5,
                key_len: 16,
                iv_len: 16,
                salt_len: 0,
                nonce_len: 0,
                tag_len: 0,
            },
            Method::Table => CipherInfo {
                kind: CipherKind::Table,
                key_len: 0,
                iv_len: 0,
                salt_len: 0,
                nonce_len: 0,
                tag_len: 0,
            },
            Method::Aes128Gcm => aead(16, 16, 12),
            Method::Aes192Gcm => aead(24, 24, 12),
            Method::Aes256Gcm => aead(32, 32, 12),
            Method::ChaCha20IetfPoly1305 => aead(32, 32, 12),
            Method::XChaCha20IetfPoly1305 => aead(32, 32, 24),
        }
    }

    /// Whether this method uses the AEAD record framing
    pub fn is_aead(&self) -> bool {
        self.info().kind == CipherKind::Aead
    }
}

/// Names of every supported method, in registry order
pub fn supported_methods() -> Vec<&'static str> {
    METHODS.iter().map(|(n, _)| *n).collect()
}
