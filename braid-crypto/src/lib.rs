#![forbid(unsafe_code)]

//! Braid cryptography engine.
//!
//! Three layers, bottom up:
//! * [`aead`] — authenticated encryption with suite dispatch between
//!   AES-256-GCM and ChaCha20-Poly1305, detached tags, in-place operation.
//! * [`kdf`] — keyed BLAKE2b-256 derivation of directional session keys.
//! * [`keyring`] — the four concurrent key epochs (private, current, next,
//!   last) and the X25519 handshake that rotates them.

pub mod aead;
pub mod kdf;
pub mod keyring;

pub use aead::{AeadKey, Suite, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use keyring::{Epoch, Keyring, PUBLIC_SIZE};

use thiserror::Error;

/// Crate result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Cryptographic failure domain.
#[derive(Debug, Error)]
pub enum Error {
    /// Sealing failed (plaintext too large for the underlying cipher).
    #[error("aead seal failed")]
    Seal,
    /// Tag verification failed.
    #[error("aead open failed")]
    Open,
    /// A key parameter was shorter than [`KEY_SIZE`].
    #[error("key must be at least {KEY_SIZE} bytes")]
    KeyLength,
}
