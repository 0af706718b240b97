//! Per-path state and the path table.
//!
//! A path is one (local IP, remote socket address) binding. Operator-
//! configured paths are `active`; paths discovered from authenticated
//! inbound control traffic are not. The table is a plain vector so that
//! iteration order is insertion order and stays stable across ingest.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use braid_core::time;

use crate::sock::PktInfo;

/// Backup-role state of one path.
#[derive(Clone, Copy, Debug, Default)]
pub struct Backup {
    /// Locally configured backup role.
    pub local: bool,
    /// Backup role advertised by the peer.
    pub remote: bool,
    /// Last backup advertisement sent on this path.
    pub send_time: u64,
}

/// One network path between the two tunnel endpoints.
///
/// All timing fields are 48-bit microsecond timestamps or deltas; zero means
/// "never".
#[derive(Clone, Debug)]
pub struct Path {
    /// Operator-configured endpoint (as opposed to ingest-discovered).
    pub active: bool,
    /// Local IP the peer reaches us on; pins egress to the same interface.
    pub local_addr: IpAddr,
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    /// Backup-role state.
    pub bak: Backup,
    /// Last packet received on this path.
    pub recv_time: u64,
    /// Last packet sent on this path.
    pub send_time: u64,
    /// Last pong emitted on this path.
    pub pong_time: u64,
    /// Peer's last send timestamp, from the packet header.
    pub rst: u64,
    /// Local inter-arrival EWMA.
    pub rdt: u64,
    /// Peer inter-send EWMA.
    pub sdt: u64,
    /// Peer's echoed `rst` from the last pong.
    pub r_rst: u64,
    /// Peer's echoed inter-arrival EWMA.
    pub r_rdt: u64,
    /// Peer's echoed inter-send EWMA.
    pub r_sdt: u64,
    /// Pong transit delta: pong send time minus the echoed `rst`.
    pub r_dt: u64,
    /// Round-trip time measured from the last pong.
    pub rtt: u64,
    /// Scheduling credit; see the transmit loop.
    pub limit: u64,
    pub(crate) pktinfo: PktInfo,
}

impl Path {
    pub(crate) fn new(local_addr: IpAddr, remote_addr: SocketAddr) -> Self {
        Self {
            active: false,
            local_addr,
            remote_addr,
            bak: Backup::default(),
            recv_time: 0,
            send_time: 0,
            pong_time: 0,
            rst: 0,
            rdt: 0,
            sdt: 0,
            r_rst: 0,
            r_rdt: 0,
            r_sdt: 0,
            r_dt: 0,
            rtt: 0,
            limit: 0,
            pktinfo: PktInfo::new(local_addr),
        }
    }

    /// Whether this path is excluded from the primary transmit loop.
    pub fn is_backup(&self) -> bool {
        self.bak.local || self.bak.remote
    }

    /// Fold one received packet into the delay estimators.
    ///
    /// The very first packet only records its timestamps; the second seeds
    /// the EWMAs unsmoothed; every later packet smooths at 1/8.
    pub(crate) fn note_recv(&mut self, sent_time: u64, now: u64) {
        if self.recv_time != 0 {
            let rdt = time::dist(now, self.recv_time);
            self.rdt = if self.rdt != 0 { (rdt + 7 * self.rdt) / 8 } else { rdt };
            let sdt = time::dist(sent_time, self.rst);
            self.sdt = if self.sdt != 0 { (sdt + 7 * self.sdt) / 8 } else { sdt };
        }
        self.rst = sent_time;
        self.recv_time = now;
    }

    /// Fold one received pong echo into the peer-side estimates.
    pub(crate) fn note_pong(&mut self, r_sdt: u64, r_rdt: u64, r_rst: u64, sent_time: u64, now: u64) {
        self.r_sdt = r_sdt;
        self.r_rdt = r_rdt;
        self.r_rst = r_rst;
        self.r_dt = time::dist(sent_time, r_rst);
        self.rtt = time::dist(now, r_rst);
    }
}

/// Insertion-ordered path collection keyed by (local IP, remote sockaddr).
#[derive(Debug, Default)]
pub struct PathTable {
    list: Vec<Path>,
}

impl PathTable {
    pub(crate) fn new() -> Self {
        Self { list: Vec::new() }
    }

    /// Number of paths.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// All paths, in insertion order.
    pub fn as_slice(&self) -> &[Path] {
        &self.list
    }

    pub(crate) fn find(&self, local_addr: IpAddr, remote_addr: SocketAddr) -> Option<usize> {
        self.list
            .iter()
            .position(|p| p.local_addr == local_addr && p.remote_addr == remote_addr)
    }

    pub(crate) fn find_or_create(&mut self, local_addr: IpAddr, remote_addr: SocketAddr) -> usize {
        match self.find(local_addr, remote_addr) {
            Some(idx) => idx,
            None => {
                debug!(local = %local_addr, remote = %remote_addr, "new path");
                self.list.push(Path::new(local_addr, remote_addr));
                self.list.len() - 1
            }
        }
    }
}

impl std::ops::Index<usize> for PathTable {
    type Output = Path;

    fn index(&self, idx: usize) -> &Path {
        &self.list[idx]
    }
}

impl std::ops::IndexMut<usize> for PathTable {
    fn index_mut(&mut self, idx: usize) -> &mut Path {
        &mut self.list[idx]
    }
}
