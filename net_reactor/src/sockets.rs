// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::*;
use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, getpeername, getsockname, getsockopt, listen, recvfrom, sendto, setsockopt,
    shutdown, sockopt, AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag, SockProtocol,
    SockType, SockaddrIn, SockaddrIn6, SockaddrStorage,
};

use crate::addr::InetAddr;

pub(crate) fn create_nonblocking_tcp(family: AddressFamily) -> nix::Result<OwnedFd> {
    nix::sys::socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
}

pub(crate) fn create_nonblocking_udp(family: AddressFamily) -> nix::Result<OwnedFd> {
    nix::sys::socket::socket(
        family,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
}

pub(crate) fn bind_addr(fd: RawFd, addr: &InetAddr) -> nix::Result<()> {
    match addr.socket_addr() {
        SocketAddr::V4(v4) => bind(fd, &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => bind(fd, &SockaddrIn6::from(v6)),
    }
}

pub(crate) fn listen_on<Fd: AsFd>(fd: &Fd) -> nix::Result<()> {
    listen(fd, Backlog::MAXCONN)
}

/// Accepts one pending connection nonblockingly, close-on-exec, returning
/// the owned descriptor and the peer endpoint.
pub(crate) fn accept(fd: RawFd) -> nix::Result<(OwnedFd, InetAddr)> {
    let connfd = accept4(fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC)?;
    // SAFETY: accept4 just handed us this descriptor.
    let owned = unsafe { OwnedFd::from_raw_fd(connfd) };
    let peer = peer_addr(owned.as_raw_fd())?;
    Ok((owned, peer))
}

pub(crate) fn local_addr(fd: RawFd) -> nix::Result<InetAddr> {
    let storage = getsockname::<SockaddrStorage>(fd)?;
    InetAddr::from_storage(&storage).ok_or(Errno::EAFNOSUPPORT)
}

pub(crate) fn peer_addr(fd: RawFd) -> nix::Result<InetAddr> {
    let storage = getpeername::<SockaddrStorage>(fd)?;
    InetAddr::from_storage(&storage).ok_or(Errno::EAFNOSUPPORT)
}

pub(crate) fn shutdown_write(fd: RawFd) {
    if let Err(e) = shutdown(fd, Shutdown::Write) {
        error!("shutdown write on fd {fd}: {e}");
    }
}

/// SO_ERROR, or the errno of the getsockopt itself if even that fails.
pub(crate) fn socket_error<Fd: AsFd>(fd: &Fd) -> i32 {
    match getsockopt(fd, sockopt::SocketError) {
        Ok(err) => err,
        Err(e) => e as i32,
    }
}

pub(crate) fn set_tcp_no_delay<Fd: AsFd>(fd: &Fd, on: bool) -> nix::Result<()> {
    setsockopt(fd, sockopt::TcpNoDelay, &on)
}

pub(crate) fn set_reuse_addr<Fd: AsFd>(fd: &Fd, on: bool) -> nix::Result<()> {
    setsockopt(fd, sockopt::ReuseAddr, &on)
}

pub(crate) fn set_reuse_port<Fd: AsFd>(fd: &Fd, on: bool) -> nix::Result<()> {
    setsockopt(fd, sockopt::ReusePort, &on)
}

pub(crate) fn set_keep_alive<Fd: AsFd>(fd: &Fd, on: bool) -> nix::Result<()> {
    setsockopt(fd, sockopt::KeepAlive, &on)
}

pub(crate) fn send_to(fd: RawFd, data: &[u8], dest: &InetAddr) -> nix::Result<usize> {
    match dest.socket_addr() {
        SocketAddr::V4(v4) => sendto(fd, data, &SockaddrIn::from(v4), MsgFlags::empty()),
        SocketAddr::V6(v6) => sendto(fd, data, &SockaddrIn6::from(v6), MsgFlags::empty()),
    }
}

/// Receives one datagram; the peer address accompanies it when the kernel
/// provides one.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> nix::Result<(usize, Option<InetAddr>)> {
    let (n, storage) = recvfrom::<SockaddrStorage>(fd, buf)?;
    let peer = storage.as_ref().and_then(InetAddr::from_storage);
    Ok((n, peer))
}
