use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Smallest accepted tunnel MTU.
pub const MTU_MIN: usize = 500;

/// Largest accepted tunnel MTU, leaving room for the datagram overhead
/// within a 1500-byte wire packet.
pub const MTU_MAX: usize = 1450;

/// Engine construction parameters.
///
/// Serializable so hosts can embed it in their own configuration files; the
/// engine itself never touches the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// UDP port to bind; 0 lets the kernel pick.
    pub port: u16,
    /// Accept and originate IPv4 traffic.
    pub ipv4: bool,
    /// Accept and originate IPv6 traffic. Together with `ipv4` this binds a
    /// dual-stack socket.
    pub ipv6: bool,
    /// Advertise AES-256-GCM capability during key exchange.
    pub prefer_aes: bool,
    /// Local tunnel MTU.
    pub mtu: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port: 0,
            ipv4: true,
            ipv6: false,
            prefer_aes: false,
            mtu: MTU_MAX,
        }
    }
}

impl TunnelConfig {
    /// Reject configurations the socket layer cannot express.
    pub fn validate(&self) -> Result<()> {
        if !self.ipv4 && !self.ipv6 {
            return Err(Error::config("at least one address family must be enabled"));
        }
        if !(MTU_MIN..=MTU_MAX).contains(&self.mtu) {
            return Err(Error::config(format!(
                "mtu {} out of range {MTU_MIN}..={MTU_MAX}",
                self.mtu
            )));
        }
        Ok(())
    }
}
