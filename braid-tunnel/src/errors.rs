use thiserror::Error;

/// Crate result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Engine failure domain.
///
/// Remote-induced faults (bad tags, stale timestamps, malformed datagrams)
/// never surface here; they are dropped and counted. Only host programming
/// errors and local socket failures reach the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure from the single syscall in `send`/`recv`.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid argument or configuration.
    #[error("config: {0}")]
    Config(String),
    /// Plaintext does not fit the effective MTU.
    #[error("payload of {size} bytes exceeds effective mtu {mtu}")]
    PayloadTooLarge {
        /// Rejected payload length.
        size: usize,
        /// Effective MTU at the time of the call.
        mtu: usize,
    },
    /// Cryptographic failure on a local operation.
    #[error("crypto: {0}")]
    Crypto(#[from] braid_crypto::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
