// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One UDP socket per output channel. Construction configures the socket for
//! multicast output with VLAN PCP tagging; every option failure is logged and
//! ignored so a partially configured socket keeps the daemon alive under
//! permission errors.

use nix::sys::socket::{
    self, setsockopt, sockopt, AddressFamily, SockFlag, SockProtocol, SockType,
};
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::error;

/// VLAN PCP priority for DLT traffic.
const DLT_PCP_PRIORITY: i32 = 1;

/// 64 KiB: the maximum length of a DLT message. A smaller kernel buffer can
/// fail a full-size send outright on some platforms.
const SOCKET_SNDBUF_SIZE: usize = 64 * 1024;

fn parse_ipv4(address: &str) -> Option<Ipv4Addr> {
    address.parse().ok()
}

fn sockaddr_in(address: Option<Ipv4Addr>, port: u16) -> libc::sockaddr_in {
    let ip = address.unwrap_or(Ipv4Addr::UNSPECIFIED);
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        },
        sin_zero: [0; 8],
    }
}

pub struct UdpStreamOutput {
    fd: OwnedFd,
    dst: libc::sockaddr_in,
}

impl UdpStreamOutput {
    /// Creates and configures the socket. Only socket creation itself can
    /// fail; a destination address that does not parse degrades to ANY like
    /// an unresolvable option.
    pub fn new(dst_address: &str, dst_port: u16, multicast_interface: &str) -> io::Result<Self> {
        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            SockProtocol::Udp,
        )
        .map_err(io::Error::from)?;

        if let Err(err) = setsockopt(&fd, sockopt::IpMulticastLoop, &true) {
            error!("(UDP) socket cannot enable multicast loop: {err}");
        }
        if let Err(err) = setsockopt(&fd, sockopt::ReusePort, &true) {
            error!("(UDP) socket cannot reuse port: {err}");
        }
        if let Err(err) = setsockopt(&fd, sockopt::SndBuf, &SOCKET_SNDBUF_SIZE) {
            error!("(UDP) socket cannot set buffer size: {err}");
        }
        if let Err(err) = setsockopt(&fd, sockopt::ReuseAddr, &true) {
            error!("(UDP) socket cannot reuse address: {err}");
        }

        if !multicast_interface.is_empty() {
            match parse_ipv4(multicast_interface) {
                Some(iface) => {
                    let addr = libc::in_addr {
                        s_addr: u32::from(iface).to_be(),
                    };
                    let rc = unsafe {
                        libc::setsockopt(
                            fd.as_raw_fd(),
                            libc::IPPROTO_IP,
                            libc::IP_MULTICAST_IF,
                            (&addr as *const libc::in_addr).cast(),
                            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
                        )
                    };
                    if rc == -1 {
                        error!(
                            "(UDP) socket cannot use multicast interface: {}",
                            io::Error::last_os_error()
                        );
                    }
                }
                None => {
                    error!("invalid multicast interface address: {multicast_interface}");
                }
            }
        }

        if let Err(err) = setsockopt(&fd, sockopt::Priority, &DLT_PCP_PRIORITY) {
            error!("setting PCP priority: {err}");
        }

        Ok(UdpStreamOutput {
            fd,
            dst: sockaddr_in(parse_ipv4(dst_address), dst_port),
        })
    }

    /// Binds the source endpoint; a separate step from construction. Errors
    /// are logged and returned, but the caller keeps the channel alive.
    pub fn bind(&self, src_address: &str, src_port: u16) -> io::Result<()> {
        let src = sockaddr_in(parse_ipv4(src_address), src_port);
        let rc = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                (&src as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            error!("(UDP) socket cannot bind to ({src_address}:{src_port}): {err}");
            return Err(err);
        }
        Ok(())
    }

    /// Batched send. Fills each entry's destination with the channel's
    /// endpoint and hands the whole span to `sendmmsg`. Returns the number
    /// of messages sent.
    pub fn send_batch(&self, messages: &mut [libc::mmsghdr]) -> io::Result<u32> {
        for message in messages.iter_mut() {
            message.msg_hdr.msg_name = (&self.dst as *const libc::sockaddr_in as *mut libc::c_void)
                .cast::<libc::c_void>();
            message.msg_hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            message.msg_hdr.msg_control = std::ptr::null_mut();
            message.msg_hdr.msg_controllen = 0;
        }
        let sent = unsafe {
            libc::sendmmsg(
                self.fd.as_raw_fd(),
                messages.as_mut_ptr(),
                messages.len() as libc::c_uint,
                0,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as u32)
    }

    /// One big message built from an iovec list (fragmented file-transfer
    /// payloads). Fails with `EOVERFLOW` when the iovec count exceeds what
    /// `msghdr` can express.
    pub fn send_single(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        if iov.len() > libc::c_int::MAX as usize {
            return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
        }

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = (&self.dst as *const libc::sockaddr_in as *mut libc::c_void).cast();
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len();

        let sent = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    pub fn local_port(&self) -> io::Result<u16> {
        let addr = socket::getsockname::<socket::SockaddrIn>(self.fd.as_raw_fd())
            .map_err(io::Error::from)?;
        Ok(addr.port())
    }
}
