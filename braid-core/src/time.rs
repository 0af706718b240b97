//! 48-bit microsecond timestamps.
//!
//! Every timer in the tunnel is a 48-bit count of microseconds since the Unix
//! epoch. The counter wraps roughly every 8.9 years; callers never compare
//! timestamps with `<`/`>` directly, only through [`dist`] bounded by a
//! tolerance window.

use std::time::{SystemTime, UNIX_EPOCH};

/// Size in bytes of a packed 48-bit timestamp.
pub const U48_SIZE: usize = 6;

/// Mask keeping the low 48 bits of a `u64`.
pub const U48_MASK: u64 = (1 << 48) - 1;

/// Current time as a 48-bit microsecond count.
pub fn now() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros())) & U48_MASK
}

/// Absolute difference of two timestamps.
pub fn dist(a: u64, b: u64) -> u64 {
    a.abs_diff(b)
}

/// Whether `timeout` has elapsed between `last` and `now`.
///
/// A zero `last` means the event never happened and always reads as expired,
/// so fresh state fires its first timer immediately.
pub fn expired(now: u64, last: u64, timeout: u64) -> bool {
    last == 0 || dist(now, last) >= timeout
}

/// Pack the low 48 bits of `v` into `dst` (little-endian).
pub fn write48(dst: &mut [u8], v: u64) {
    dst[..U48_SIZE].copy_from_slice(&v.to_le_bytes()[..U48_SIZE]);
}

/// Unpack a little-endian 48-bit value from `src`.
pub fn read48(src: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..U48_SIZE].copy_from_slice(&src[..U48_SIZE]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn now_fits_48_bits() {
        let t = now();
        assert!(t > 0);
        assert_eq!(t & !U48_MASK, 0);
    }

    #[test]
    fn codec_roundtrip() {
        let mut buf = [0u8; U48_SIZE];
        write48(&mut buf, 0x0000_dead_beef_cafe);
        assert_eq!(read48(&buf), 0x0000_dead_beef_cafe);
    }

    #[test]
    fn write48_truncates_high_bits() {
        let mut buf = [0u8; U48_SIZE];
        write48(&mut buf, u64::MAX);
        assert_eq!(read48(&buf), U48_MASK);
    }

    #[test]
    fn expired_treats_zero_as_never() {
        assert!(expired(123, 0, 1_000_000));
        assert!(!expired(123, 123, 1_000_000));
        assert!(expired(1_000_123, 123, 1_000_000));
    }

    #[test]
    fn dist_is_symmetric() {
        assert_eq!(dist(10, 3), 7);
        assert_eq!(dist(3, 10), 7);
        assert_eq!(dist(5, 5), 0);
    }

    proptest! {
        #[test]
        fn codec_roundtrip_random(v in 0u64..=U48_MASK) {
            let mut buf = [0u8; U48_SIZE];
            write48(&mut buf, v);
            prop_assert_eq!(read48(&buf), v);
        }
    }
}
