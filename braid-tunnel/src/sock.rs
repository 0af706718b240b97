//! Socket layer.
//!
//! One UDP socket serves every path. Multihoming works through ancillary
//! data: inbound `recvmsg` reports which local IP a datagram was addressed
//! to, and outbound `sendmsg` pins the egress source IP with a per-path
//! precomputed `IP_PKTINFO`/`IPV6_PKTINFO` control message, so replies leave
//! through the interface the peer actually reached.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    SockaddrStorage,
};
use socket2::{Domain, Socket, Type};

/// Precomputed source-address ancillary data for one path.
#[derive(Clone, Copy)]
pub(crate) enum PktInfo {
    V4(libc::in_pktinfo),
    V6(libc::in6_pktinfo),
}

impl PktInfo {
    pub(crate) fn new(local_addr: IpAddr) -> Self {
        match local_addr {
            IpAddr::V4(ip) => PktInfo::V4(libc::in_pktinfo {
                ipi_ifindex: 0,
                ipi_spec_dst: libc::in_addr {
                    s_addr: u32::from_ne_bytes(ip.octets()),
                },
                ipi_addr: libc::in_addr { s_addr: 0 },
            }),
            IpAddr::V6(ip) => PktInfo::V6(libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr { s6_addr: ip.octets() },
                ipi6_ifindex: 0,
            }),
        }
    }
}

impl std::fmt::Debug for PktInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PktInfo::V4(_) => f.write_str("PktInfo::V4"),
            PktInfo::V6(_) => f.write_str("PktInfo::V6"),
        }
    }
}

/// One datagram as delivered by `recvmsg`.
pub(crate) struct Datagram {
    pub len: usize,
    /// Sender, when the kernel reported one.
    pub src: Option<SocketAddr>,
    /// Local destination IP from the pktinfo ancillary data, when present.
    pub dst: Option<IpAddr>,
}

/// Bind the tunnel socket: non-blocking, address reuse, pktinfo reporting,
/// don't-fragment where the platform supports it.
pub(crate) fn bind(port: u16, v4: bool, v6: bool) -> io::Result<UdpSocket> {
    let (domain, bind_addr) = if v6 {
        (
            Domain::IPV6,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        )
    } else {
        (
            Domain::IPV4,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        )
    };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    if v6 {
        socket.set_only_v6(!v4)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();

    if v4 {
        setsockopt(&socket, sockopt::Ipv4PacketInfo, &true).map_err(errno_to_io)?;
    }
    if v6 {
        setsockopt(&socket, sockopt::Ipv6RecvPacketInfo, &true).map_err(errno_to_io)?;
    }
    set_dont_fragment(socket.as_raw_fd(), v4, v6)?;
    Ok(socket)
}

/// Send one datagram, pinning the egress source IP to the path's local
/// address.
pub(crate) fn send_to(
    socket: &UdpSocket,
    dest: SocketAddr,
    pktinfo: &PktInfo,
    buf: &[u8],
) -> io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    let addr = SockaddrStorage::from(dest);
    match pktinfo {
        PktInfo::V4(pi) => sendmsg(
            socket.as_raw_fd(),
            &iov,
            &[ControlMessage::Ipv4PacketInfo(pi)],
            MsgFlags::empty(),
            Some(&addr),
        ),
        PktInfo::V6(pi) => sendmsg(
            socket.as_raw_fd(),
            &iov,
            &[ControlMessage::Ipv6PacketInfo(pi)],
            MsgFlags::empty(),
            Some(&addr),
        ),
    }
    .map_err(errno_to_io)
}

/// Receive one datagram with its source address and local destination IP.
pub(crate) fn recv_from(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!(libc::in6_pktinfo, libc::in_pktinfo);
    let msg = recvmsg::<SockaddrStorage>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(errno_to_io)?;

    let mut dst = None;
    for cmsg in msg.cmsgs() {
        match cmsg {
            ControlMessageOwned::Ipv4PacketInfo(pi) => {
                dst = Some(IpAddr::V4(Ipv4Addr::from(pi.ipi_addr.s_addr.to_ne_bytes())));
            }
            ControlMessageOwned::Ipv6PacketInfo(pi) => {
                dst = Some(IpAddr::V6(Ipv6Addr::from(pi.ipi6_addr.s6_addr)));
            }
            _ => {}
        }
    }
    Ok(Datagram {
        len: msg.bytes,
        src: msg.address.as_ref().and_then(to_socket_addr),
        dst,
    })
}

fn to_socket_addr(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(sin.ip()),
            sin.port(),
        )));
    }
    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    None
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

// nix wraps neither the path-MTU-discovery knob nor the per-send traffic
// class, so these three options go through libc directly.
#[allow(unsafe_code)]
mod sys {
    use std::io;
    use std::os::fd::RawFd;

    pub(super) fn setsockopt_int(fd: RawFd, level: i32, opt: i32, value: i32) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                opt,
                (&value as *const i32).cast(),
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Forbid kernel fragmentation of tunnel datagrams.
#[cfg(target_os = "linux")]
fn set_dont_fragment(fd: RawFd, v4: bool, v6: bool) -> io::Result<()> {
    if v4 {
        sys::setsockopt_int(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_DO,
        )?;
    }
    if v6 {
        sys::setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_DONTFRAG, 1)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_fd: RawFd, _v4: bool, _v6: bool) -> io::Result<()> {
    Ok(())
}

/// Set the traffic class applied to subsequent sends toward `dest_v6`-family
/// destinations. Callers cache the last value; re-applying is idempotent.
pub(crate) fn set_traffic_class(fd: RawFd, dest_v6: bool, tc: u8) -> io::Result<()> {
    if dest_v6 {
        sys::setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, i32::from(tc))
    } else {
        sys::setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TOS, i32::from(tc))
    }
}
