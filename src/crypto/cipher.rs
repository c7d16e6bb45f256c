//! Symmetric primitive wrappers
//!
//! Tagged sum types over the RustCrypto primitives, one variant per
//! concrete construction. [`StreamCipher`] applies a keystream in place and
//! never fails after construction; [`AeadCipher`] owns a per-direction
//! nonce counter and seals/opens one record per call.

use crate::crypto::{kdf, Method};
use crate::{Error, Result};

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use camellia::{Camellia128, Camellia192, Camellia256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, ChaCha20Legacy};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use cipher::consts::{U12, U16};
use cipher::{KeyInit, KeyIvInit, StreamCipher as _};
use ctr::Ctr128BE;
use rc4::Rc4;
use salsa20::Salsa20;

/// AES-192-GCM is not aliased by the aes-gcm crate
type Aes192Gcm = AesGcm<Aes192, U12>;

/// Which half of the duplex a cipher instance serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Stateful keystream cipher. Repeated `update` calls continue a single
/// logical stream; CFB variants keep partial-block state between calls.
pub enum StreamCipher {
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes256CfbDec(BufDecryptor<Aes256>),
    Camellia128CfbEnc(BufEncryptor<Camellia128>),
    Camellia128CfbDec(BufDecryptor<Camellia128>),
    Camellia192CfbEnc(BufEncryptor<Camellia192>),
    Camellia192CfbDec(BufDecryptor<Camellia192>),
    Camellia256CfbEnc(BufEncryptor<Camellia256>),
    Camellia256CfbDec(BufDecryptor<Camellia256>),
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    ChaCha20(Box<ChaCha20Legacy>),
    ChaCha20Ietf(Box<ChaCha20>),
    Salsa20(Box<Salsa20>),
    Rc4(Box<Rc4<U16>>),
    Table(TableCipher),
}

macro_rules! cfb_pair {
    ($enc:ident, $dec:ident, $block:ty, $key:expr, $iv:expr, $dir:expr) => {
        match $dir {
            Direction::Encrypt => BufEncryptor::<$block>::new_from_slices($key, $iv)
                .map(StreamCipher::$enc)
                .map_err(|e| Error::crypto(e.to_string())),
            Direction::Decrypt => BufDecryptor::<$block>::new_from_slices($key, $iv)
                .map(StreamCipher::$dec)
                .map_err(|e| Error::crypto(e.to_string())),
        }
    };
}

impl StreamCipher {
    /// Construct a cipher for one direction of a stream. `key` and `iv`
    /// lengths must match the registry entry for `method`.
    pub fn new(method: Method, key: &[u8], iv: &[u8], direction: Direction) -> Result<Self> {
        match method {
            Method::Aes128Cfb => cfb_pair!(Aes128CfbEnc, Aes128CfbDec, Aes128, key, iv, direction),
            Method::Aes192Cfb => cfb_pair!(Aes192CfbEnc, Aes192CfbDec, Aes192, key, iv, direction),
            Method::Aes256Cfb => cfb_pair!(Aes256CfbEnc, Aes256CfbDec, Aes256, key, iv, direction),
            Method::Camellia128Cfb => {
                cfb_pair!(Camellia128CfbEnc, Camellia128CfbDec, Camellia128, key, iv, direction)
            }
            Method::Camellia192Cfb => {
                cfb_pair!(Camellia192CfbEnc, Camellia192CfbDec, Camellia192, key, iv, direction)
            }
            Method::Camellia256Cfb => {
                cfb_pair!(Camellia256CfbEnc, Camellia256CfbDec, Camellia256, key, iv, direction)
            }
            Method::Aes128Ctr => Ctr128BE::<Aes128>::new_from_slices(key, iv)
                .map(StreamCipher::Aes128Ctr)
                .map_err(|e| Error::crypto(e.to_string())),
            Method::Aes192Ctr => Ctr128BE::<Aes192>::new_from_slices(key, iv)
                .map(StreamCipher::Aes192Ctr)
                .map_err(|e| Error::crypto(e.to_string())),
            Method::Aes256Ctr => Ctr128BE::<Aes256>::new_from_slices(key, iv)
                .map(StreamCipher::Aes256Ctr)
                .map_err(|e| Error::crypto(e.to_string())),
            Method::ChaCha20 => ChaCha20Legacy::new_from_slices(key, iv)
                .map(|c| StreamCipher::ChaCha20(Box::new(c)))
                .map_err(|e| Error::crypto(e.to_string())),
            Method::ChaCha20Ietf => ChaCha20::new_from_slices(key, iv)
                .map(|c| StreamCipher::ChaCha20Ietf(Box::new(c)))
                .map_err(|e| Error::crypto(e.to_string())),
            Method::Salsa20 => Salsa20::new_from_slices(key, iv)
                .map(|c| StreamCipher::Salsa20(Box::new(c)))
                .map_err(|e| Error::crypto(e.to_string())),
            Method::Rc4Md5 => {
                // The effective key is MD5(master_key || iv); the cipher
                // itself takes no IV.
                let mut material = Vec::with_capacity(key.len() + iv.len());
                material.extend_from_slice(key);
                material.extend_from_slice(iv);
                let session_key = kdf::md5(&material);
                let rc4 = Rc4::<U16>::new_from_slice(&session_key)
                    .map_err(|e| Error::crypto(e.to_string()))?;
                Ok(StreamCipher::Rc4(Box::new(rc4)))
            }
            Method::Table => Err(Error::crypto(
                "table cipher is built from the password, not from key material",
            )),
            _ => Err(Error::crypto(format!(
                "{} is not a stream method",
                method.name()
            ))),
        }
    }

    /// Apply the keystream in place
    pub fn update(&mut self, data: &mut [u8]) {
        match self {
            StreamCipher::Aes128CfbEnc(c) => c.encrypt(data),
            StreamCipher::Aes128CfbDec(c) => c.decrypt(data),
            StreamCipher::Aes192CfbEnc(c) => c.encrypt(data),
            StreamCipher::Aes192CfbDec(c) => c.decrypt(data),
            StreamCipher::Aes256CfbEnc(c) => c.encrypt(data),
            StreamCipher::Aes256CfbDec(c) => c.decrypt(data),
            StreamCipher::Camellia128CfbEnc(c) => c.encrypt(data),
            StreamCipher::Camellia128CfbDec(c) => c.decrypt(data),
            StreamCipher::Camellia192CfbEnc(c) => c.encrypt(data),
            StreamCipher::Camellia192CfbDec(c) => c.decrypt(data),
            StreamCipher::Camellia256CfbEnc(c) => c.encrypt(data),
            StreamCipher::Camellia256CfbDec(c) => c.decrypt(data),
            StreamCipher::Aes128Ctr(c) => c.apply_keystream(data),
            StreamCipher::Aes192Ctr(c) => c.apply_keystream(data),
            StreamCipher::Aes256Ctr(c) => c.apply_keystream(data),
            StreamCipher::ChaCha20(c) => c.apply_keystream(data),
            StreamCipher::ChaCha20Ietf(c) => c.apply_keystream(data),
            StreamCipher::Salsa20(c) => c.apply_keystream(data),
            StreamCipher::Rc4(c) => c.apply_keystream(data),
            StreamCipher::Table(t) => t.update(data),
        }
    }
}

/// Deprecated table method: a password-derived byte substitution
#[derive(Clone)]
pub struct TableCipher {
    table: [u8; 256],
}

impl TableCipher {
    /// Build the encrypt/decrypt table pair from the password
    pub fn new_pair(password: &[u8]) -> (TableCipher, TableCipher) {
        let digest = kdf::md5(password);
        let key = u64::from_le_bytes(digest[..8].try_into().unwrap_or([0u8; 8]));

        let mut enc: Vec<u8> = (0..=255u8).collect();
        for i in 1..1024u64 {
            enc.sort_by_key(|&x| key % (x as u64 + i));
        }

        let mut enc_table = [0u8; 256];
        enc_table.copy_from_slice(&enc);

        let mut dec_table = [0u8; 256];
        for (j, &v) in enc_table.iter().enumerate() {
            dec_table[v as usize] = j as u8;
        }

        (
            TableCipher { table: enc_table },
            TableCipher { table: dec_table },
        )
    }

    fn update(&self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b = self.table[*b as usize];
        }
    }
}

enum AeadCipherInner {
    Aes128Gcm(Aes128Gcm),
    Aes192Gcm(Aes192Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

/// AEAD primitive with a little-endian nonce counter.
///
/// Each seal/open consumes exactly one nonce value; the counter starts at
/// zero and never repeats within a subkey's lifetime.
pub struct AeadCipher {
    inner: AeadCipherInner,
    nonce: Vec<u8>,
}

impl AeadCipher {
    /// Construct from a per-session subkey
    pub fn new(method: Method, subkey: &[u8]) -> Result<Self> {
        let inner = match method {
            Method::Aes128Gcm => Aes128Gcm::new_from_slice(subkey)
                .map(AeadCipherInner::Aes128Gcm)
                .map_err(|e| Error::crypto(e.to_string()))?,
            Method::Aes192Gcm => Aes192Gcm::new_from_slice(subkey)
                .map(AeadCipherInner::Aes192Gcm)
                .map_err(|e| Error::crypto(e.to_string()))?,
            Method::Aes256Gcm => Aes256Gcm::new_from_slice(subkey)
                .map(AeadCipherInner::Aes256Gcm)
                .map_err(|e| Error::crypto(e.to_string()))?,
            Method::ChaCha20IetfPoly1305 => ChaCha20Poly1305::new_from_slice(subkey)
                .map(AeadCipherInner::ChaCha20Poly1305)
                .map_err(|e| Error::crypto(e.to_string()))?,
            Method::XChaCha20IetfPoly1305 => XChaCha20Poly1305::new_from_slice(subkey)
                .map(AeadCipherInner::XChaCha20Poly1305)
                .map_err(|e| Error::crypto(e.to_string()))?,
            _ => {
                return Err(Error::crypto(format!(
                    "{} is not an AEAD method",
                    method.name()
                )))
            }
        };

        Ok(AeadCipher {
            inner,
            nonce: vec![0u8; method.info().nonce_len],
        })
    }

    /// Encrypt one record; output is ciphertext with the tag appended
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = match &self.inner {
            AeadCipherInner::Aes128Gcm(c) => {
                c.encrypt(GenericArray::from_slice(&self.nonce), plaintext)
            }
            AeadCipherInner::Aes192Gcm(c) => {
                c.encrypt(GenericArray::from_slice(&self.nonce), plaintext)
            }
            AeadCipherInner::Aes256Gcm(c) => {
                c.encrypt(GenericArray::from_slice(&self.nonce), plaintext)
            }
            AeadCipherInner::ChaCha20Poly1305(c) => {
                c.encrypt(GenericArray::from_slice(&self.nonce), plaintext)
            }
            AeadCipherInner::XChaCha20Poly1305(c) => {
                c.encrypt(GenericArray::from_slice(&self.nonce), plaintext)
            }
        }
        .map_err(|_| Error::crypto("AEAD seal failed"))?;

        self.advance();
        Ok(sealed)
    }

    /// Decrypt and verify one record (ciphertext with trailing tag)
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let opened = match &self.inner {
            AeadCipherInner::Aes128Gcm(c) => {
                c.decrypt(GenericArray::from_slice(&self.nonce), ciphertext)
            }
            AeadCipherInner::Aes192Gcm(c) => {
                c.decrypt(GenericArray::from_slice(&self.nonce), ciphertext)
            }
            AeadCipherInner::Aes256Gcm(c) => {
                c.decrypt(GenericArray::from_slice(&self.nonce), ciphertext)
            }
            AeadCipherInner::ChaCha20Poly1305(c) => {
                c.decrypt(GenericArray::from_slice(&self.nonce), ciphertext)
            }
            AeadCipherInner::XChaCha20Poly1305(c) => {
                c.decrypt(GenericArray::from_slice(&self.nonce), ciphertext)
            }
        }
        .map_err(|_| Error::crypto("AEAD tag verification failed"))?;

        self.advance();
        Ok(opened)
    }

    /// Little-endian counter increment
    fn advance(&mut self) {
        for byte in self.nonce.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self) -> &[u8] {
        &self.nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::evp_bytes_to_key;

    fn roundtrip_stream(method: Method) {
        let info = method.info();
        let key = evp_bytes_to_key(b"test", info.key_len);
        let iv = vec![0x42u8; info.iv_len];

        let mut enc = StreamCipher::new(method, &key, &iv, Direction::Encrypt).unwrap();
        let mut dec = StreamCipher::new(method, &key, &iv, Direction::Decrypt).unwrap();

        let plaintext = b"Hello Shadowsocks, across multiple blocks of data!".to_vec();
        let mut data = plaintext.clone();
        enc.update(&mut data);
        assert_ne!(data, plaintext);

        // Decrypt in two pieces to exercise keystream continuity
        let (a, b) = data.split_at_mut(7);
        dec.update(a);
        dec.update(b);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_stream_roundtrip_all_methods() {
        for method in [
            Method::Aes128Cfb,
            Method::Aes192Cfb,
            Method::Aes256Cfb,
            Method::Aes128Ctr,
            Method::Aes192Ctr,
            Method::Aes256Ctr,
            Method::Camellia128Cfb,
            Method::Camellia192Cfb,
            Method::Camellia256Cfb,
            Method::ChaCha20,
            Method::ChaCha20Ietf,
            Method::Salsa20,
            Method::Rc4Md5,
        ] {
            roundtrip_stream(method);
        }
    }

    #[test]
    fn test_table_roundtrip() {
        let (enc, dec) = TableCipher::new_pair(b"barfoo!");
        let plaintext = b"Hello World!".to_vec();
        let mut data = plaintext.clone();
        enc.update(&mut data);
        assert_ne!(data, plaintext);
        dec.update(&mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_aead_roundtrip() {
        for method in [
            Method::Aes128Gcm,
            Method::Aes192Gcm,
            Method::Aes256Gcm,
            Method::ChaCha20IetfPoly1305,
            Method::XChaCha20IetfPoly1305,
        ] {
            let info = method.info();
            let subkey = vec![0x42u8; info.key_len];
            let mut enc = AeadCipher::new(method, &subkey).unwrap();
            let mut dec = AeadCipher::new(method, &subkey).unwrap();

            let sealed = enc.seal(b"hello world").unwrap();
            assert_eq!(sealed.len(), 11 + info.tag_len);
            let opened = dec.open(&sealed).unwrap();
            assert_eq!(opened, b"hello world");
        }
    }

    #[test]
    fn test_aead_nonce_advances() {
        let mut cipher = AeadCipher::new(Method::Aes256Gcm, &[0x42u8; 32]).unwrap();
        assert_eq!(cipher.nonce(), &[0u8; 12]);
        cipher.seal(b"a").unwrap();
        assert_eq!(cipher.nonce()[0], 1);
        cipher.seal(b"b").unwrap();
        assert_eq!(cipher.nonce()[0], 2);
    }

    #[test]
    fn test_aead_nonce_carry() {
        let mut cipher = AeadCipher::new(Method::Aes256Gcm, &[0x42u8; 32]).unwrap();
        for _ in 0..256 {
            cipher.seal(b"x").unwrap();
        }
        assert_eq!(&cipher.nonce()[..2], &[0, 1]);
    }

    #[test]
    fn test_aead_tamper_detected() {
        let subkey = [0x42u8; 32];
        let mut enc = AeadCipher::new(Method::Aes256Gcm, &subkey).unwrap();
        let mut dec = AeadCipher::new(Method::Aes256Gcm, &subkey).unwrap();

        let mut sealed = enc.seal(b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert!(dec.open(&sealed).is_err());
    }

    #[test]
    fn test_rc4_md5_uses_iv() {
        let key = evp_bytes_to_key(b"test", 16);
        let mut a = StreamCipher::new(Method::Rc4Md5, &key, &[1u8; 16], Direction::Encrypt).unwrap();
        let mut b = StreamCipher::new(Method::Rc4Md5, &key, &[2u8; 16], Direction::Encrypt).unwrap();

        let mut da = b"same plaintext".to_vec();
        let mut db = b"same plaintext".to_vec();
        a.update(&mut da);
        b.update(&mut db);
        assert_ne!(da, db);
    }
}
