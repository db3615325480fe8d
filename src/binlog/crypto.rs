//! Record payload encryption
//!
//! A file that carries a `StartEncryption` marker has every later record
//! payload encrypted with AES-128 in counter mode. The counter block is the
//! file's random 12-byte nonce followed by a 32-bit zero, and the record at
//! file offset `off` starts at keystream byte `off`. Records never overlap
//! in the file, so no two payloads share keystream.
//! Frame headers and checksums stay in the clear; the checksum covers the
//! encrypted bytes.

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::errors::{BinlogError, BinlogResult};
use super::record::StartEncryptionPayload;

/// Scheme id written into the encryption marker
pub const SCHEME_AES128_CTR: u8 = 1;

const BLOCK_LEN: u64 = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// AES-128 key from configured key material of any accepted length
fn derive_key(material: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(material);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Source of encryption keys, looked up by version
pub trait KeyProvider: Send + Sync {
    /// Version used for newly created files
    fn current_version(&self) -> u32;

    /// Key bytes for `version`, if known
    fn key(&self, version: u32) -> Option<Vec<u8>>;
}

/// Provider holding a single configured key
#[derive(Clone)]
pub struct StaticKeyProvider {
    version: u32,
    key: Vec<u8>,
}

impl StaticKeyProvider {
    pub fn new(version: u32, key: Vec<u8>) -> Self {
        Self { version, key }
    }

    /// Build from a base64-encoded key
    pub fn from_base64(version: u32, encoded: &str) -> BinlogResult<Self> {
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| BinlogError::encryption(format!("invalid base64 key: {}", e)))?;
        if key.len() < 16 {
            return Err(BinlogError::encryption("key must be at least 16 bytes"));
        }
        Ok(Self::new(version, key))
    }
}

impl std::fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyProvider")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl KeyProvider for StaticKeyProvider {
    fn current_version(&self) -> u32 {
        self.version
    }

    fn key(&self, version: u32) -> Option<Vec<u8>> {
        (version == self.version).then(|| self.key.clone())
    }
}

/// Per-file cipher state
#[derive(Clone)]
pub struct RecordCipher {
    key: [u8; 16],
    nonce_base: [u8; 12],
    key_version: u32,
}

impl RecordCipher {
    /// Cipher for a new file with a fresh random nonce base
    pub fn for_new_file(provider: &dyn KeyProvider) -> BinlogResult<Self> {
        let key_version = provider.current_version();
        let key = provider
            .key(key_version)
            .ok_or_else(|| BinlogError::encryption(format!("no key for version {}", key_version)))?;
        let mut nonce_base = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_base);
        Ok(Self {
            key: derive_key(&key),
            nonce_base,
            key_version,
        })
    }

    /// Cipher for an existing file, from its encryption marker
    pub fn from_marker(
        provider: &dyn KeyProvider,
        marker: &StartEncryptionPayload,
    ) -> BinlogResult<Self> {
        if marker.scheme != SCHEME_AES128_CTR {
            return Err(BinlogError::encryption(format!(
                "unknown encryption scheme {}",
                marker.scheme
            )));
        }
        let key = provider.key(marker.key_version).ok_or_else(|| {
            BinlogError::encryption(format!("no key for version {}", marker.key_version))
        })?;
        Ok(Self {
            key: derive_key(&key),
            nonce_base: marker.nonce_base,
            key_version: marker.key_version,
        })
    }

    pub fn marker(&self) -> StartEncryptionPayload {
        StartEncryptionPayload {
            scheme: SCHEME_AES128_CTR,
            key_version: self.key_version,
            nonce_base: self.nonce_base,
        }
    }

    /// Encrypt or decrypt (the operation is its own inverse) a payload that
    /// belongs to the record starting at `offset`
    pub fn apply(&self, offset: u64, data: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.nonce_base);
        let counter = u128::from_be_bytes(iv).wrapping_add(u128::from(offset / BLOCK_LEN));
        let mut cipher = Aes128Ctr::new(&self.key.into(), &counter.to_be_bytes().into());
        let skip = (offset % BLOCK_LEN) as usize;
        if skip > 0 {
            let mut discard = [0u8; BLOCK_LEN as usize];
            cipher.apply_keystream(&mut discard[..skip]);
        }
        cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StaticKeyProvider {
        StaticKeyProvider::new(3, vec![7u8; 32])
    }

    #[test]
    fn test_apply_is_involution() {
        let cipher = RecordCipher::for_new_file(&provider()).unwrap();
        let original: Vec<u8> = (0..100u8).collect();
        let mut data = original.clone();
        cipher.apply(4096, &mut data);
        assert_ne!(data, original);
        cipher.apply(4096, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_offset_changes_keystream() {
        let cipher = RecordCipher::for_new_file(&provider()).unwrap();
        let mut a = vec![0u8; 40];
        let mut b = vec![0u8; 40];
        cipher.apply(100, &mut a);
        cipher.apply(101, &mut b);
        assert_ne!(a, b);
    }

    /// A payload starting mid-block sees the same keystream bytes as the
    /// matching slice of a payload starting earlier.
    #[test]
    fn test_keystream_is_addressed_by_file_offset() {
        let cipher = RecordCipher::for_new_file(&provider()).unwrap();
        let mut whole = vec![0u8; 64];
        cipher.apply(96, &mut whole);
        let mut tail = vec![0u8; 20];
        cipher.apply(96 + 21, &mut tail);
        assert_eq!(&tail[..], &whole[21..41]);
    }

    #[test]
    fn test_marker_reconstructs_cipher() {
        let p = provider();
        let cipher = RecordCipher::for_new_file(&p).unwrap();
        let marker = cipher.marker();
        assert_eq!(marker.key_version, 3);

        let restored = RecordCipher::from_marker(&p, &marker).unwrap();
        let mut data = b"payload".to_vec();
        cipher.apply(50, &mut data);
        restored.apply(50, &mut data);
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_unknown_key_version() {
        let p = provider();
        let mut marker = RecordCipher::for_new_file(&p).unwrap().marker();
        marker.key_version = 9;
        assert!(RecordCipher::from_marker(&p, &marker).is_err());
    }

    #[test]
    fn test_from_base64() {
        let encoded = BASE64.encode([1u8; 32]);
        let p = StaticKeyProvider::from_base64(1, &encoded).unwrap();
        assert_eq!(p.key(1).unwrap(), vec![1u8; 32]);
        assert!(StaticKeyProvider::from_base64(1, "not base64!").is_err());
        assert!(StaticKeyProvider::from_base64(1, &BASE64.encode([1u8; 4])).is_err());
    }
}
