//! Key derivation
//!
//! Master keys come from the password via the OpenSSL `EVP_BytesToKey`
//! construction (iterated MD5, count 1) for compatibility with every other
//! Shadowsocks implementation. AEAD per-connection subkeys come from
//! HKDF-SHA1 with the fixed info string `ss-subkey`.

use crate::{Error, Result};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Derive a master key from a password: repeatedly `MD5(prev || password)`,
/// concatenating digests, truncated to `key_len`. Deterministic.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}

/// Derive an AEAD session subkey from the master key and a salt
pub fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .map_err(|e| Error::crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(subkey)
}

/// MD5 digest, used by rc4-md5 session keys and the deprecated table method
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fill a fresh buffer of `n` bytes from the OS CSPRNG
pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    if n > 0 {
        getrandom::getrandom(&mut buf).map_err(|e| Error::crypto(e.to_string()))?;
    }
    Ok(buf)
}
