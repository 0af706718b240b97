//! On-wire packet layout.
//!
//! Two packet classes share the socket:
//!
//! ```text
//! data:    | time u48 | ciphertext ...            | tag 16 |
//! control: | zero u48 | time u48 | payload 0..=66 | tag 16 |
//! ```
//!
//! The leading six zero bytes are the control sentinel; a data packet starts
//! with its (never zero) send timestamp. The timestamp is both the low bytes
//! of the AEAD nonce and the associated data, so a packet cannot be replayed
//! under a different clock reading. Control payloads are authenticated but
//! not encrypted, and the message kind is keyed by the exact wire length.

use braid_core::time::{read48, write48, U48_SIZE};
use braid_crypto::{AeadKey, NONCE_SIZE, TAG_SIZE};

use crate::errors::Result;

/// Largest datagram the engine sends or accepts.
pub const PACKET_MAX: usize = 1500;

/// Wire overhead of a data packet: timestamp plus tag.
pub const DATA_OVERHEAD: usize = U48_SIZE + TAG_SIZE;

/// Control header: sentinel plus timestamp.
pub const CTRL_HEADER: usize = 2 * U48_SIZE;

/// Control sentinel.
pub const SENTINEL: [u8; U48_SIZE] = [0u8; U48_SIZE];

/// Control message kinds, discriminated on the wire by exact packet length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ctrl {
    /// Path keep-warm probe; empty payload.
    Ping,
    /// Echo of the receiver's delay estimates: `sdt ‖ rdt ‖ rst`.
    Pong,
    /// Key exchange: local and echoed-peer public halves.
    Keyx,
    /// Local MTU announcement.
    Mtux,
    /// Backup-role advertisement.
    Bakx,
}

/// Exact wire length of each control message.
pub const PING_SIZE: usize = CTRL_HEADER + TAG_SIZE;
/// See [`PING_SIZE`].
pub const PONG_SIZE: usize = CTRL_HEADER + 3 * U48_SIZE + TAG_SIZE;
/// See [`PING_SIZE`].
pub const KEYX_SIZE: usize = CTRL_HEADER + 2 * braid_crypto::PUBLIC_SIZE + TAG_SIZE;
/// See [`PING_SIZE`].
pub const MTUX_SIZE: usize = CTRL_HEADER + U48_SIZE + TAG_SIZE;
/// See [`PING_SIZE`].
pub const BAKX_SIZE: usize = CTRL_HEADER + 1 + TAG_SIZE;

impl Ctrl {
    /// Payload length carried by this kind.
    pub const fn payload_size(self) -> usize {
        self.wire_size() - CTRL_HEADER - TAG_SIZE
    }

    /// Total packet length for this kind.
    pub const fn wire_size(self) -> usize {
        match self {
            Ctrl::Ping => PING_SIZE,
            Ctrl::Pong => PONG_SIZE,
            Ctrl::Keyx => KEYX_SIZE,
            Ctrl::Mtux => MTUX_SIZE,
            Ctrl::Bakx => BAKX_SIZE,
        }
    }

    /// Dispatch an inbound control packet by its length.
    pub fn from_wire_size(len: usize) -> Option<Self> {
        match len {
            PING_SIZE => Some(Ctrl::Ping),
            PONG_SIZE => Some(Ctrl::Pong),
            KEYX_SIZE => Some(Ctrl::Keyx),
            MTUX_SIZE => Some(Ctrl::Mtux),
            BAKX_SIZE => Some(Ctrl::Bakx),
            _ => None,
        }
    }
}

/// 96-bit nonce from a 48-bit send time: six time bytes, six zero bytes.
pub fn nonce(send_time: u64) -> [u8; NONCE_SIZE] {
    let mut out = [0u8; NONCE_SIZE];
    write48(&mut out, send_time);
    out
}

/// Encrypt `payload` into `out` as a data packet. Returns the wire length.
pub fn seal_data(send_time: u64, payload: &[u8], key: &AeadKey, out: &mut [u8]) -> Result<usize> {
    let len = U48_SIZE + payload.len() + TAG_SIZE;
    debug_assert!(len <= out.len());
    let (header, body) = out.split_at_mut(U48_SIZE);
    write48(header, send_time);
    body[..payload.len()].copy_from_slice(payload);
    let tag = key.seal_detached(&nonce(send_time), header, &mut body[..payload.len()])?;
    body[payload.len()..payload.len() + TAG_SIZE].copy_from_slice(&tag);
    Ok(len)
}

/// Try to decrypt a data packet into `out` under `key`.
///
/// Returns the plaintext length; on failure `out` holds garbage and the
/// caller retries under another epoch.
pub fn open_data(packet: &[u8], key: &AeadKey, out: &mut [u8]) -> Result<usize> {
    let body_len = packet.len() - DATA_OVERHEAD;
    let send_time = read48(packet);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&packet[U48_SIZE + body_len..]);
    out[..body_len].copy_from_slice(&packet[U48_SIZE..U48_SIZE + body_len]);
    key.open_detached(&nonce(send_time), &packet[..U48_SIZE], &mut out[..body_len], &tag)?;
    Ok(body_len)
}

/// Build an authenticated control packet into `out`. Returns the wire length.
///
/// The tag covers the sentinel, the timestamp and the payload; nothing is
/// encrypted, so path discovery works before any key negotiation.
pub fn seal_ctrl(
    kind: Ctrl,
    send_time: u64,
    payload: &[u8],
    key: &AeadKey,
    out: &mut [u8],
) -> Result<usize> {
    debug_assert_eq!(payload.len(), kind.payload_size());
    let signed = CTRL_HEADER + payload.len();
    out[..U48_SIZE].copy_from_slice(&SENTINEL);
    write48(&mut out[U48_SIZE..], send_time);
    out[CTRL_HEADER..signed].copy_from_slice(payload);
    let mut empty = [0u8; 0];
    let tag = key.seal_detached(&nonce(send_time), &out[..signed], &mut empty)?;
    out[signed..signed + TAG_SIZE].copy_from_slice(&tag);
    Ok(kind.wire_size())
}

/// Verify a control packet's tag under the long-term key.
pub fn verify_ctrl(packet: &[u8], key: &AeadKey) -> bool {
    let signed = packet.len() - TAG_SIZE;
    let send_time = read48(&packet[U48_SIZE..]);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&packet[signed..]);
    let mut empty = [0u8; 0];
    key.open_detached(&nonce(send_time), &packet[..signed], &mut empty, &tag)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_crypto::Suite;
    use proptest::prelude::*;

    fn key() -> AeadKey {
        AeadKey::new(Suite::ChaCha20Poly1305, &[11u8; braid_crypto::KEY_SIZE])
    }

    #[test]
    fn control_sizes_are_wire_exact() {
        assert_eq!(Ctrl::Ping.wire_size(), 28);
        assert_eq!(Ctrl::Pong.wire_size(), 46);
        assert_eq!(Ctrl::Keyx.wire_size(), 94);
        assert_eq!(Ctrl::Mtux.wire_size(), 34);
        assert_eq!(Ctrl::Bakx.wire_size(), 29);
    }

    #[test]
    fn size_dispatch_is_exhaustive_and_exclusive() {
        for kind in [Ctrl::Ping, Ctrl::Pong, Ctrl::Keyx, Ctrl::Mtux, Ctrl::Bakx] {
            assert_eq!(Ctrl::from_wire_size(kind.wire_size()), Some(kind));
        }
        for len in [0, 27, 30, 47, 93, 95, PACKET_MAX] {
            assert_eq!(Ctrl::from_wire_size(len), None);
        }
    }

    #[test]
    fn data_roundtrip() {
        let key = key();
        let mut packet = [0u8; PACKET_MAX];
        let len = seal_data(0x123456, b"hello", &key, &mut packet).unwrap();
        assert_eq!(len, U48_SIZE + 5 + TAG_SIZE);
        // The leading bytes are never the control sentinel.
        assert_ne!(packet[..U48_SIZE], SENTINEL);
        let mut out = [0u8; PACKET_MAX];
        let n = open_data(&packet[..len], &key, &mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
    }

    #[test]
    fn data_rejects_wrong_key() {
        let mut packet = [0u8; PACKET_MAX];
        let len = seal_data(77, b"secret", &key(), &mut packet).unwrap();
        let other = AeadKey::new(Suite::ChaCha20Poly1305, &[12u8; braid_crypto::KEY_SIZE]);
        let mut out = [0u8; PACKET_MAX];
        assert!(open_data(&packet[..len], &other, &mut out).is_err());
    }

    #[test]
    fn data_rejects_flipped_timestamp() {
        // The timestamp is the associated data: flipping it kills the tag.
        let key = key();
        let mut packet = [0u8; PACKET_MAX];
        let len = seal_data(1_000_000, b"x", &key, &mut packet).unwrap();
        packet[0] ^= 1;
        let mut out = [0u8; PACKET_MAX];
        assert!(open_data(&packet[..len], &key, &mut out).is_err());
    }

    #[test]
    fn ctrl_roundtrip_and_tamper() {
        let key = key();
        let mut packet = [0u8; PACKET_MAX];
        let payload = [1u8];
        let len = seal_ctrl(Ctrl::Bakx, 42, &payload, &key, &mut packet).unwrap();
        assert_eq!(len, BAKX_SIZE);
        assert_eq!(packet[..U48_SIZE], SENTINEL);
        assert_eq!(read48(&packet[U48_SIZE..]), 42);
        assert!(verify_ctrl(&packet[..len], &key));
        // Payload is visible on the wire but covered by the tag.
        assert_eq!(packet[CTRL_HEADER], 1);
        packet[CTRL_HEADER] = 0;
        assert!(!verify_ctrl(&packet[..len], &key));
    }

    proptest! {
        #[test]
        fn data_roundtrip_random(time in 1u64..(1 << 48), msg in proptest::collection::vec(any::<u8>(), 0..1400)) {
            let key = key();
            let mut packet = [0u8; PACKET_MAX];
            let len = seal_data(time, &msg, &key, &mut packet).unwrap();
            let mut out = [0u8; PACKET_MAX];
            let n = open_data(&packet[..len], &key, &mut out).unwrap();
            prop_assert_eq!(&out[..n], &msg[..]);
        }
    }
}
