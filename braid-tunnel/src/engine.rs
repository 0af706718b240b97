//! The tunnel engine.
//!
//! A [`Tunnel`] owns one UDP socket, the path table and the key epochs. It
//! is single-threaded and cooperative: `recv` and `send` each perform one
//! syscall and return, and the host drives them from a readiness loop over
//! [`AsRawFd::as_raw_fd`]. `send` also runs the control tick, so a host that
//! transmits (even empty payloads) keeps the control plane alive.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, trace, warn};

use braid_core::time::{self, read48, write48, U48_SIZE};
use braid_core::{addr, now};
use braid_crypto::keyring::EXCHANGE_SIZE;
use braid_crypto::{Epoch, Keyring};

use crate::config::TunnelConfig;
use crate::errors::{Error, Result};
use crate::path::{Path, PathTable};
use crate::sock;
use crate::wire::{self, Ctrl};

/// Minimum interval between pong emissions on one path.
const PONG_TIMEOUT: u64 = 100_000; // 100 ms

/// Key-exchange refresh interval.
const KEYX_TIMEOUT: u64 = 3_600_000_000; // 60 min

/// Default control retransmission interval and silent-path threshold.
const DEFAULT_SEND_TIMEOUT: u64 = 1_000_000; // 1 s

/// Default packet freshness window.
const DEFAULT_TIME_TOLERANCE: u64 = 600_000_000; // 10 min

/// Drop counters for remote-induced faults.
///
/// These never raise errors toward the host; they are the only trace a
/// misbehaving (or misconfigured) peer leaves.
#[derive(Clone, Copy, Debug, Default)]
pub struct TunnelStats {
    /// Data packets that failed authentication under every key epoch.
    pub decrypt_errors: u64,
    /// Packets outside the freshness window.
    pub clock_drops: u64,
    /// Packets with missing ancillary data or mismatched address families.
    pub addr_drops: u64,
    /// Control packets that failed the long-term-key tag.
    pub ctrl_auth_errors: u64,
}

#[derive(Debug)]
struct MtuState {
    local: usize,
    remote: usize,
    send_time: u64,
}

/// Multipath encrypted UDP tunnel engine.
pub struct Tunnel {
    socket: UdpSocket,
    v4: bool,
    v6: bool,
    send_timeout: u64,
    time_tolerance: u64,
    mtu: MtuState,
    paths: PathTable,
    keys: Keyring,
    stats: TunnelStats,
    // Last traffic class applied to the socket, per destination family.
    tc_cache: Option<(bool, u8)>,
}

impl Tunnel {
    /// Create an engine: bind the socket and generate a random pre-shared
    /// key. Exchange the key via [`Tunnel::key`]/[`Tunnel::set_key`] before
    /// expecting traffic to flow.
    pub fn new(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let socket = sock::bind(config.port, config.ipv4, config.ipv6)?;
        debug!(addr = %socket.local_addr()?, "tunnel socket bound");
        Ok(Self {
            socket,
            v4: config.ipv4,
            v6: config.ipv6,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            time_tolerance: DEFAULT_TIME_TOLERANCE,
            mtu: MtuState {
                local: config.mtu,
                remote: 0,
                send_time: 0,
            },
            paths: PathTable::new(),
            keys: Keyring::new(config.prefer_aes),
            stats: TunnelStats::default(),
            tc_cache: None,
        })
    }

    /// Install the pre-shared key (at least 32 bytes; extra bytes ignored).
    /// Resets every key epoch, discarding negotiated generations.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        self.keys.set_psk(key)?;
        Ok(())
    }

    /// The pre-shared key, for provisioning the peer.
    pub fn key(&self) -> [u8; braid_crypto::KEY_SIZE] {
        *self.keys.psk()
    }

    /// Install an operator-configured path toward the peer.
    ///
    /// Both addresses must be IP literals of the same family; DNS is a host
    /// concern. `backup` paths only carry traffic when every primary path is
    /// unusable.
    pub fn add_peer(&mut self, local: &str, remote: &str, port: u16, backup: bool) -> Result<()> {
        let local_ip: IpAddr = local
            .parse()
            .map_err(|_| Error::config(format!("bad local ip literal: {local}")))?;
        let remote_ip: IpAddr = remote
            .parse()
            .map_err(|_| Error::config(format!("bad remote ip literal: {remote}")))?;
        if port == 0 {
            return Err(Error::config("peer port must be non-zero"));
        }
        let local_ip = addr::unmap_ip(local_ip);
        let remote_addr = addr::unmap(SocketAddr::new(remote_ip, port));
        if !addr::same_family(local_ip, remote_addr.ip()) {
            return Err(Error::config("peer address families differ"));
        }
        if (remote_addr.is_ipv4() && !self.v4) || (remote_addr.is_ipv6() && !self.v6) {
            return Err(Error::config("peer address family is not enabled"));
        }
        let idx = self.paths.find_or_create(local_ip, remote_addr);
        let path = &mut self.paths[idx];
        path.active = true;
        path.bak.local = backup;
        Ok(())
    }

    /// Set the local tunnel MTU.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<()> {
        if !(crate::config::MTU_MIN..=crate::config::MTU_MAX).contains(&mtu) {
            return Err(Error::config(format!("mtu {mtu} out of range")));
        }
        self.mtu.local = mtu;
        Ok(())
    }

    /// Effective MTU: the smaller of the local MTU and the peer's announced
    /// one (local alone until the peer has announced).
    pub fn mtu(&self) -> usize {
        if self.mtu.remote != 0 {
            self.mtu.local.min(self.mtu.remote)
        } else {
            self.mtu.local
        }
    }

    /// Control retransmission interval and silent-path threshold.
    pub fn set_send_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::config("send timeout must be non-zero"));
        }
        self.send_timeout = timeout.as_micros() as u64;
        Ok(())
    }

    /// Packet freshness window.
    pub fn set_time_tolerance(&mut self, tolerance: Duration) -> Result<()> {
        if tolerance.is_zero() {
            return Err(Error::config("time tolerance must be non-zero"));
        }
        self.time_tolerance = tolerance.as_micros() as u64;
        Ok(())
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The path table, in insertion order.
    pub fn paths(&self) -> &[Path] {
        self.paths.as_slice()
    }

    /// Drop counters.
    pub fn stats(&self) -> TunnelStats {
        self.stats
    }

    /// Promotions of the `next` key generation since creation.
    pub fn key_epoch(&self) -> u64 {
        self.keys.epoch()
    }

    /// Receive one datagram from the socket.
    ///
    /// Returns the payload length for a data packet, `0` for control traffic
    /// and for anything dropped (stale, malformed, unauthenticated). Socket
    /// errors, including `WouldBlock` on an idle socket, surface as
    /// [`Error::Io`].
    pub fn recv(&mut self, data: &mut [u8]) -> Result<usize> {
        let mut packet = [0u8; wire::PACKET_MAX];
        let dgram = sock::recv_from(&self.socket, &mut packet)?;
        let now = now();
        let (Some(src), Some(dst)) = (dgram.src, dgram.dst) else {
            self.stats.addr_drops += 1;
            return Ok(0);
        };
        if dgram.len < wire::DATA_OVERHEAD || dgram.len > wire::PACKET_MAX {
            return Ok(0);
        }
        let packet = &packet[..dgram.len];
        let is_ctrl = packet[..U48_SIZE] == wire::SENTINEL;
        if is_ctrl && packet.len() < wire::PING_SIZE {
            return Ok(0);
        }
        let sent_time = if is_ctrl {
            read48(&packet[U48_SIZE..])
        } else {
            read48(packet)
        };
        // Freshness gates everything, including crypto work.
        if time::dist(now, sent_time) >= self.time_tolerance {
            self.stats.clock_drops += 1;
            trace!(sent_time, "dropping packet outside time tolerance");
            return Ok(0);
        }
        let src = addr::unmap(src);
        let dst = addr::unmap_ip(dst);
        if !addr::same_family(dst, src.ip()) {
            self.stats.addr_drops += 1;
            return Ok(0);
        }
        if is_ctrl {
            self.recv_ctrl(packet, sent_time, dst, src, now);
            Ok(0)
        } else {
            self.recv_data(packet, data, sent_time, dst, src, now)
        }
    }

    /// Transmit one payload, after running the control tick.
    ///
    /// An empty payload runs the tick alone; hosts use that to keep timers
    /// firing while the application is idle. Returns the payload length on
    /// transmission and `0` when no path could carry it.
    pub fn send(&mut self, data: &[u8], tc: u8) -> Result<usize> {
        let now = now();
        self.tick(now);
        if data.is_empty() {
            return Ok(0);
        }
        let mtu = self.mtu();
        if data.len() > mtu {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                mtu,
            });
        }
        let mut packet = [0u8; wire::PACKET_MAX];
        let len = wire::seal_data(now, data, self.keys.encrypt_key(), &mut packet)?;
        if self.transmit(&packet[..len], tc, now) {
            Ok(data.len())
        } else {
            Ok(0)
        }
    }

    // ---- inbound -------------------------------------------------------

    fn recv_data(
        &mut self,
        packet: &[u8],
        data: &mut [u8],
        sent_time: u64,
        dst: IpAddr,
        src: SocketAddr,
        now: u64,
    ) -> Result<usize> {
        // Data on an unknown path is dropped: paths come into existence only
        // through authenticated control traffic or operator configuration.
        let Some(idx) = self.paths.find(dst, src) else {
            trace!(remote = %src, "data packet on unknown path");
            return Ok(0);
        };
        let body_len = packet.len() - wire::DATA_OVERHEAD;
        if data.len() < body_len {
            return Err(Error::config("receive buffer smaller than payload"));
        }
        let mut hit = None;
        for epoch in Epoch::TRIALS {
            if wire::open_data(packet, self.keys.decrypt_key(epoch), data).is_ok() {
                hit = Some(epoch);
                break;
            }
        }
        let Some(epoch) = hit else {
            self.stats.decrypt_errors += 1;
            self.keys.bad_key = true;
            return Ok(0);
        };
        if epoch == Epoch::Next {
            // The peer is sending under the handshaken generation; rotate.
            self.keys.promote();
        }
        self.paths[idx].note_recv(sent_time, now);
        self.maybe_pong(idx, now);
        Ok(body_len)
    }

    fn recv_ctrl(&mut self, packet: &[u8], sent_time: u64, dst: IpAddr, src: SocketAddr, now: u64) {
        if !wire::verify_ctrl(packet, self.keys.private_key()) {
            self.stats.ctrl_auth_errors += 1;
            trace!(remote = %src, "control packet failed authentication");
            return;
        }
        let Some(kind) = Ctrl::from_wire_size(packet.len()) else {
            trace!(len = packet.len(), "unknown control size");
            return;
        };
        // Authenticated control traffic may create the path.
        let idx = self.paths.find_or_create(dst, src);
        self.paths[idx].note_recv(sent_time, now);
        let payload = &packet[wire::CTRL_HEADER..packet.len() - braid_crypto::TAG_SIZE];
        match kind {
            Ctrl::Ping => {}
            Ctrl::Pong => {
                let r_sdt = read48(payload);
                let r_rdt = read48(&payload[U48_SIZE..]);
                let r_rst = read48(&payload[2 * U48_SIZE..]);
                self.paths[idx].note_pong(r_sdt, r_rdt, r_rst, sent_time, now);
            }
            Ctrl::Keyx => {
                let mut halves = [0u8; EXCHANGE_SIZE];
                halves.copy_from_slice(payload);
                if self.keys.handle_exchange(&halves, now) {
                    self.send_keyx(idx, now);
                }
            }
            Ctrl::Mtux => {
                self.mtu.remote = read48(payload) as usize;
                debug!(mtu = self.mtu.remote, "peer announced mtu");
                if !self.paths[idx].active {
                    self.send_mtux(idx, now);
                }
            }
            Ctrl::Bakx => {
                self.paths[idx].bak.remote = payload[0] != 0;
                if !self.paths[idx].active {
                    // Accepting a peer-advertised backup role demotes this
                    // end of the path as well, and the echo advertises it.
                    self.paths[idx].bak.local = true;
                    self.send_bakx(idx, now);
                }
            }
        }
        self.maybe_pong(idx, now);
    }

    fn maybe_pong(&mut self, idx: usize, now: u64) {
        let path = &self.paths[idx];
        if !path.bak.local && time::expired(now, path.pong_time, PONG_TIMEOUT) {
            self.send_pong(idx, now);
        }
    }

    // ---- control emission ----------------------------------------------

    fn send_ctrl(&mut self, idx: usize, kind: Ctrl, payload: &[u8], now: u64) {
        let mut buf = [0u8; wire::PACKET_MAX];
        let len = match wire::seal_ctrl(kind, now, payload, self.keys.private_key(), &mut buf) {
            Ok(len) => len,
            Err(err) => {
                warn!(?kind, error = %err, "control packet seal failed");
                return;
            }
        };
        let (dest, pktinfo) = {
            let path = &self.paths[idx];
            (path.remote_addr, path.pktinfo)
        };
        match sock::send_to(&self.socket, dest, &pktinfo, &buf[..len]) {
            Ok(_) => self.paths[idx].send_time = now,
            Err(err) => trace!(?kind, peer = %dest, error = %err, "control send failed"),
        }
    }

    fn send_ping(&mut self, idx: usize, now: u64) {
        self.send_ctrl(idx, Ctrl::Ping, &[], now);
    }

    fn send_pong(&mut self, idx: usize, now: u64) {
        let mut payload = [0u8; 3 * U48_SIZE];
        {
            let path = &self.paths[idx];
            write48(&mut payload, path.sdt);
            write48(&mut payload[U48_SIZE..], path.rdt);
            write48(&mut payload[2 * U48_SIZE..], path.rst);
        }
        self.send_ctrl(idx, Ctrl::Pong, &payload, now);
        self.paths[idx].pong_time = now;
    }

    fn send_keyx(&mut self, idx: usize, now: u64) {
        let payload = self.keys.exchange_payload();
        self.send_ctrl(idx, Ctrl::Keyx, &payload, now);
        self.keys.send_time = now;
    }

    fn send_mtux(&mut self, idx: usize, now: u64) {
        let mut payload = [0u8; U48_SIZE];
        write48(&mut payload, self.mtu.local as u64);
        self.send_ctrl(idx, Ctrl::Mtux, &payload, now);
        self.mtu.send_time = now;
    }

    fn send_bakx(&mut self, idx: usize, now: u64) {
        let payload = [u8::from(self.paths[idx].bak.local)];
        self.send_ctrl(idx, Ctrl::Bakx, &payload, now);
        self.paths[idx].bak.send_time = now;
    }

    // ---- outbound ------------------------------------------------------

    /// Control phase of `send`: walk the paths in insertion order and emit
    /// whatever the timers owe.
    fn tick(&mut self, now: u64) {
        // A failed decrypt sweep emits a key exchange on every discovered
        // path in one pass; the flag clears only after the sweep.
        let kick = self.keys.bad_key && time::expired(now, self.keys.send_time, self.send_timeout);
        let mut kicked = false;
        for idx in 0..self.paths.len() {
            if !self.paths[idx].active {
                if kick {
                    self.send_keyx(idx, now);
                    kicked = true;
                }
                continue;
            }
            if time::expired(now, self.keys.send_time, self.send_timeout)
                && time::expired(now, self.keys.recv_time, KEYX_TIMEOUT)
            {
                self.send_keyx(idx, now);
                continue;
            }
            if self.mtu.remote == 0 && time::expired(now, self.mtu.send_time, self.send_timeout) {
                self.send_mtux(idx, now);
                continue;
            }
            let path = &self.paths[idx];
            if path.bak.local
                && !path.bak.remote
                && time::expired(now, path.bak.send_time, self.send_timeout)
            {
                self.send_bakx(idx, now);
                continue;
            }
            if self.paths[idx].send_time == 0 {
                self.send_ping(idx, now);
            }
        }
        if kicked {
            self.keys.bad_key = false;
        }
    }

    /// Pick the transmission path(s) for one sealed data packet.
    ///
    /// `limit` is a virtual transmit-time accumulator: it accrues in real
    /// time and is charged half an RTT per transmission, so the minimum-limit
    /// path is the one whose virtual clock frees up first. Paths that have
    /// been silent past the send timeout transmit immediately to re-warm.
    fn transmit(&mut self, packet: &[u8], tc: u8, now: u64) -> bool {
        let mut best: Option<(usize, u64)> = None;
        let mut sent = false;
        for idx in 0..self.paths.len() {
            let (is_backup, recovering, limit_new) = {
                let path = &self.paths[idx];
                let elapsed = time::dist(now, path.send_time);
                let limit_new = if path.limit > elapsed {
                    path.limit + path.rtt / 2 - elapsed
                } else {
                    path.rtt / 2
                };
                (
                    path.is_backup(),
                    time::expired(now, path.recv_time, self.send_timeout),
                    limit_new,
                )
            };
            if is_backup {
                continue;
            }
            if recovering {
                if self.transmit_on(idx, packet, tc, now) {
                    sent = true;
                }
                self.paths[idx].limit = limit_new;
                continue;
            }
            match best {
                Some((_, limit)) if limit <= limit_new => {}
                _ => best = Some((idx, limit_new)),
            }
        }
        if let Some((idx, limit_new)) = best {
            if self.transmit_on(idx, packet, tc, now) {
                sent = true;
            }
            self.paths[idx].limit = limit_new;
        }
        if !sent {
            // Last resort: the first backup path carries the packet, with no
            // scheduling charge.
            if let Some(idx) = (0..self.paths.len()).find(|&i| self.paths[i].is_backup()) {
                sent = self.transmit_on(idx, packet, tc, now);
            }
        }
        sent
    }

    fn transmit_on(&mut self, idx: usize, packet: &[u8], tc: u8, now: u64) -> bool {
        let (dest, pktinfo) = {
            let path = &self.paths[idx];
            (path.remote_addr, path.pktinfo)
        };
        self.apply_traffic_class(dest.is_ipv6(), tc);
        match sock::send_to(&self.socket, dest, &pktinfo, packet) {
            Ok(_) => {
                self.paths[idx].send_time = now;
                true
            }
            Err(err) => {
                trace!(peer = %dest, error = %err, "data send failed");
                false
            }
        }
    }

    fn apply_traffic_class(&mut self, dest_v6: bool, tc: u8) {
        if self.tc_cache == Some((dest_v6, tc)) {
            return;
        }
        match sock::set_traffic_class(self.socket.as_raw_fd(), dest_v6, tc) {
            Ok(()) => self.tc_cache = Some((dest_v6, tc)),
            Err(err) => trace!(error = %err, "traffic class update failed"),
        }
    }
}

impl AsRawFd for Tunnel {
    /// The socket descriptor, for the host's readiness loop.
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("paths", &self.paths.len())
            .field("mtu", &self.mtu)
            .field("keys", &self.keys)
            .finish()
    }
}
