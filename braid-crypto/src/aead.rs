use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroize;

use crate::{Error, Result};

/// AEAD key length in bytes.
pub const KEY_SIZE: usize = 32;

/// Authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// Nonce length in bytes (96-bit, shared by both suites).
pub const NONCE_SIZE: usize = 12;

/// AEAD suite selector.
///
/// AES-256-GCM is used when both peers advertise support for it; every other
/// key runs ChaCha20-Poly1305.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Suite {
    /// AES-256-GCM with a precomputed key schedule.
    Aes256Gcm,
    /// ChaCha20-Poly1305 (IETF variant).
    #[default]
    ChaCha20Poly1305,
}

// Cipher instances precompute their key schedule at construction, so the hot
// path never touches the raw key bytes again.
#[derive(Clone)]
enum Cipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// A 32-byte key bound to one suite, with its expanded cipher state.
#[derive(Clone)]
pub struct AeadKey {
    bytes: [u8; KEY_SIZE],
    cipher: Cipher,
}

impl AeadKey {
    /// Expand `key` for `suite`.
    pub fn new(suite: Suite, key: &[u8; KEY_SIZE]) -> Self {
        let cipher = match suite {
            Suite::Aes256Gcm => Cipher::Aes(Box::new(Aes256Gcm::new(GenericArray::from_slice(key)))),
            Suite::ChaCha20Poly1305 => {
                Cipher::ChaCha(Box::new(ChaCha20Poly1305::new(GenericArray::from_slice(key))))
            }
        };
        Self { bytes: *key, cipher }
    }

    /// The suite this key was expanded for.
    pub fn suite(&self) -> Suite {
        match self.cipher {
            Cipher::Aes(_) => Suite::Aes256Gcm,
            Cipher::ChaCha(_) => Suite::ChaCha20Poly1305,
        }
    }

    /// Raw key bytes.
    pub fn bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Encrypt `buf` in place and return the detached tag.
    pub fn seal_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; TAG_SIZE]> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = match &self.cipher {
            Cipher::Aes(c) => c.encrypt_in_place_detached(nonce, aad, buf),
            Cipher::ChaCha(c) => c.encrypt_in_place_detached(nonce, aad, buf),
        }
        .map_err(|_| Error::Seal)?;
        Ok(tag.into())
    }

    /// Verify `tag` and decrypt `buf` in place.
    pub fn open_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<()> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = GenericArray::from_slice(tag);
        match &self.cipher {
            Cipher::Aes(c) => c.decrypt_in_place_detached(nonce, aad, buf, tag),
            Cipher::ChaCha(c) => c.decrypt_in_place_detached(nonce, aad, buf, tag),
        }
        .map_err(|_| Error::Open)
    }
}

impl Drop for AeadKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl core::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AeadKey").field("suite", &self.suite()).finish()
    }
}
