use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::Blake2bMac;

use crate::aead::KEY_SIZE;

type Mac = Blake2bMac<U32>;

/// Keyed BLAKE2b-256 over `material`, keyed with the long-term secret.
///
/// The long-term key doubles as the MAC key so that derived session keys are
/// worthless to anyone who holds only the Diffie-Hellman transcript.
pub fn derive_key(key: &[u8; KEY_SIZE], material: &[u8]) -> [u8; KEY_SIZE] {
    // 32-byte keys are always within BLAKE2b's 64-byte key bound
    let mut mac = <Mac as KeyInit>::new_from_slice(key).expect("blake2b key length");
    mac.update(material);
    mac.finalize_fixed().into()
}
