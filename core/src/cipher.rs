//! Pluggable at-rest encryption for copied secret files.
//!
//! The engine never holds key material; callers provision a [`Cipher`] and
//! hand it to the copier. The ciphertext contract is self-contained: given
//! the key, the bytes on disk are decryptable with no side channel.

use aes_gcm::Aes256Gcm;
use aes_gcm::Key;
use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use aes_gcm::aead::AeadCore;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;

use crate::error::Result;
use crate::error::SxnErr;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext` into a self-contained buffer.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Invert [`Cipher::encrypt`].
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Stable algorithm name recorded in change metadata.
    fn algorithm(&self) -> &'static str;
}

/// AES-256-GCM with a fresh 96-bit nonce prepended to every ciphertext.
pub struct AesGcmCipher {
    key: [u8; KEY_SIZE],
}

impl AesGcmCipher {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Generate a random 256-bit key. Intended for provisioning tooling and
    /// tests; production keys come from the caller's key-management policy.
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        key
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|e| SxnErr::Encryption {
            reason: format!("encrypt: {e}"),
        })?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(SxnErr::Encryption {
                reason: "ciphertext shorter than nonce".to_string(),
            });
        }
        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);
        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| SxnErr::Encryption {
                reason: format!("decrypt: {e}"),
            })
    }

    fn algorithm(&self) -> &'static str {
        "aes-256-gcm"
    }
}
