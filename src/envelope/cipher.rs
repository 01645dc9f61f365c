//! AES-256-CFB payload encryption and zlib compression

use super::EnvelopeError;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

/// Payloads of at least this many bytes are compressed before encryption
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Compression applied to a payload before encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zlib,
}

impl Compression {
    /// Pick the compression for a payload of `size` bytes
    pub fn for_size(size: usize) -> Option<Self> {
        (size >= COMPRESSION_THRESHOLD).then_some(Compression::Zlib)
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).map_err(EnvelopeError::Compression)?;
                encoder.finish().map_err(EnvelopeError::Compression)
            }
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            Compression::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(EnvelopeError::Decompression)?;
                Ok(out)
            }
        }
    }
}

/// A 256-bit key and its IV
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKey {
    #[serde(with = "crate::base64_serde::fixed")]
    pub key: [u8; KEY_SIZE],

    #[serde(with = "crate::base64_serde::fixed")]
    pub iv: [u8; IV_SIZE],
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey").finish_non_exhaustive()
    }
}

impl SymmetricKey {
    /// Fresh random key and IV from the OS generator
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Rebuild from the 48-byte `key || iv` form used when sealing
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != KEY_SIZE + IV_SIZE {
            return Err(EnvelopeError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE + IV_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&bytes[..KEY_SIZE]);
        iv.copy_from_slice(&bytes[KEY_SIZE..]);
        Ok(Self { key, iv })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_SIZE + IV_SIZE);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.iv);
        out
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        Aes256CfbEnc::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&self.iv),
        )
        .encrypt(&mut buf);
        buf
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = ciphertext.to_vec();
        Aes256CfbDec::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&self.iv),
        )
        .decrypt(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_cipher_keeps_length() {
        let key = SymmetricKey::generate();
        let ct = key.encrypt(b"seventeen bytes!!");
        assert_eq!(ct.len(), 17);
        assert_ne!(ct, b"seventeen bytes!!");
        assert_eq!(key.decrypt(&ct), b"seventeen bytes!!");
    }

    #[test]
    fn test_fresh_keys_differ() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();
        assert_ne!(a.key, b.key);
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn test_wrong_key_garbles() {
        let key = SymmetricKey::generate();
        let other = SymmetricKey::generate();
        let ct = key.encrypt(b"attack at dawn");
        assert_ne!(other.decrypt(&ct), b"attack at dawn");
    }

    #[test]
    fn test_key_bytes_round_trip() {
        let key = SymmetricKey::generate();
        assert_eq!(SymmetricKey::from_bytes(&key.to_bytes()).unwrap(), key);
        assert!(SymmetricKey::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_compression_threshold() {
        assert_eq!(Compression::for_size(1023), None);
        assert_eq!(Compression::for_size(1024), Some(Compression::Zlib));
    }

    #[test]
    fn test_zlib_round_trip() {
        let data = vec![b'a'; 4096];
        let packed = Compression::Zlib.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(Compression::Zlib.decompress(&packed).unwrap(), data);
        assert!(Compression::Zlib.decompress(b"not zlib").is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = SymmetricKey::generate();
        assert_eq!(format!("{:?}", key), "SymmetricKey { .. }");
    }

    #[test]
    fn test_serde_uses_base64() {
        let key = SymmetricKey::generate();
        let json = serde_json::to_value(&key).unwrap();
        assert!(json["key"].is_string());
        assert!(json["iv"].is_string());
        let back: SymmetricKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }
}
