//! Secret value encryption
//!
//! The secret core treats ciphertext as opaque: everything goes through the
//! [`SecretCipher`] capability handed to the services. [`AesGcmCipher`] is the
//! bundled implementation, AES-256-GCM with a fresh random nonce per value.
//! Its blob layout is `nonce (12) || ciphertext || tag (16)`.
//!
//! ## Configuration
//!
//! The key comes from [`SecretsConfig::encryption_key_base64`], a
//! base64-encoded 32-byte key. It is passed in explicitly; nothing here reads
//! process environment.

use crate::config::SecretsConfig;
use crate::errors::{KeyplaneError, Result};
use base64::Engine;
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::{debug, error, instrument};
use zeroize::Zeroizing;

/// Size of AES-256-GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of AES-256-GCM tag in bytes
const TAG_SIZE: usize = 16;

const KEY_SIZE: usize = 32;

/// Opaque encrypt/decrypt capability for secret values and comments
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>>;

    /// Encrypt a UTF-8 string
    fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt a blob that must hold UTF-8 text
    fn decrypt_to_string(&self, blob: &[u8]) -> Result<String> {
        String::from_utf8(self.decrypt(blob)?)
            .map_err(|_| KeyplaneError::encryption("Decrypted secret is not valid UTF-8"))
    }
}

/// Single-use nonce sequence for AES-GCM
struct SingleNonce {
    nonce: Option<[u8; NONCE_SIZE]>,
}

impl SingleNonce {
    fn new(nonce_bytes: [u8; NONCE_SIZE]) -> Self {
        Self { nonce: Some(nonce_bytes) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

/// AES-256-GCM cipher backed by `ring`
#[derive(Clone)]
pub struct AesGcmCipher {
    key_bytes: Arc<Zeroizing<[u8; KEY_SIZE]>>,
    key_version: String,
    rng: Arc<SystemRandom>,
}

impl AesGcmCipher {
    /// Build the cipher from configuration
    pub fn new(config: &SecretsConfig) -> Result<Self> {
        if config.encryption_key_base64.is_empty() {
            return Err(KeyplaneError::config(
                "secrets.encryption_key_base64 is not set. Generate a key with: openssl rand -base64 32",
            ));
        }

        let key_bytes = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(&config.encryption_key_base64)
                .map_err(|e| {
                    KeyplaneError::config(format!("Invalid base64 in secrets.encryption_key_base64: {}", e))
                })?,
        );

        if key_bytes.len() != KEY_SIZE {
            return Err(KeyplaneError::config(format!(
                "secrets.encryption_key_base64 must be 32 bytes (256 bits), got {} bytes",
                key_bytes.len()
            )));
        }

        let mut key_array = Zeroizing::new([0u8; KEY_SIZE]);
        key_array.copy_from_slice(&key_bytes);

        debug!(key_version = %config.key_version, "Secret cipher initialized");

        Ok(Self {
            key_bytes: Arc::new(key_array),
            key_version: config.key_version.clone(),
            rng: Arc::new(SystemRandom::new()),
        })
    }

    /// Build a cipher from raw key bytes
    pub fn from_key(key: [u8; KEY_SIZE], key_version: impl Into<String>) -> Self {
        Self {
            key_bytes: Arc::new(Zeroizing::new(key)),
            key_version: key_version.into(),
            rng: Arc::new(SystemRandom::new()),
        }
    }

    /// Get the current key version
    pub fn key_version(&self) -> &str {
        &self.key_version
    }

    fn unbound_key(&self) -> Result<UnboundKey> {
        UnboundKey::new(&AES_256_GCM, &**self.key_bytes).map_err(|_| {
            error!("Failed to create cipher key");
            KeyplaneError::encryption("Failed to create cipher key")
        })
    }
}

impl SecretCipher for AesGcmCipher {
    #[instrument(skip(self, plaintext), fields(plaintext_len = plaintext.len()))]
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            error!("Failed to generate random nonce");
            KeyplaneError::encryption("Failed to generate random nonce for encryption")
        })?;

        let mut sealing_key = aead::SealingKey::new(self.unbound_key()?, SingleNonce::new(nonce_bytes));

        let mut sealed = plaintext.to_vec();
        sealed.reserve(TAG_SIZE);
        sealing_key.seal_in_place_append_tag(Aad::empty(), &mut sealed).map_err(|_| {
            error!("Encryption failed");
            KeyplaneError::encryption("Failed to encrypt secret data")
        })?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    #[instrument(skip(self, blob), fields(blob_len = blob.len()))]
    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KeyplaneError::encryption(format!(
                "Ciphertext too short: expected at least {} bytes, got {}",
                NONCE_SIZE + TAG_SIZE,
                blob.len()
            )));
        }

        let (nonce, sealed) = blob.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        let mut opening_key = aead::OpeningKey::new(self.unbound_key()?, SingleNonce::new(nonce_bytes));

        let mut buffer = sealed.to_vec();
        let plaintext = opening_key.open_in_place(Aad::empty(), &mut buffer).map_err(|_| {
            error!("Decryption failed - possible tampering or wrong key");
            KeyplaneError::encryption("Failed to decrypt secret data - authentication failed")
        })?;

        Ok(plaintext.to_vec())
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("key_version", &self.key_version)
            .field("key_bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> AesGcmCipher {
        AesGcmCipher::from_key([0x42u8; KEY_SIZE], "test")
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let blob = cipher.encrypt(b"my-database-password").unwrap();

        assert_eq!(blob.len(), NONCE_SIZE + b"my-database-password".len() + TAG_SIZE);
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"my-database-password");
    }

    #[test]
    fn test_same_plaintext_yields_different_blobs() {
        let cipher = test_cipher();
        let first = cipher.encrypt(b"same").unwrap();
        let second = cipher.encrypt(b"same").unwrap();

        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).unwrap(), cipher.decrypt(&second).unwrap());
    }

    #[test]
    fn test_tampered_blob_fails() {
        let cipher = test_cipher();
        let mut blob = cipher.encrypt(b"sensitive").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;

        assert!(matches!(cipher.decrypt(&blob), Err(KeyplaneError::Encryption { .. })));
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = test_cipher().encrypt(b"sensitive").unwrap();
        let other = AesGcmCipher::from_key([0x07u8; KEY_SIZE], "other");
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn test_short_blob_fails() {
        assert!(test_cipher().decrypt(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_empty_plaintext_is_kept() {
        let cipher = test_cipher();
        let blob = cipher.encrypt_str("").unwrap();
        assert_eq!(blob.len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(cipher.decrypt_to_string(&blob).unwrap(), "");
    }

    #[test]
    fn test_new_from_config() {
        let config = SecretsConfig {
            encryption_key_base64: base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]),
            key_version: "v2".to_string(),
            ..Default::default()
        };
        let cipher = AesGcmCipher::new(&config).unwrap();
        assert_eq!(cipher.key_version(), "v2");

        let short = SecretsConfig {
            encryption_key_base64: base64::engine::general_purpose::STANDARD.encode([0u8; 16]),
            ..Default::default()
        };
        assert!(AesGcmCipher::new(&short).is_err());
        assert!(AesGcmCipher::new(&SecretsConfig::default()).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", test_cipher());
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("66"));
    }
}
