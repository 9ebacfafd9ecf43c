// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod addr;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod server;
pub mod timer;
pub mod udp;

mod acceptor;
mod poller;
mod ring;
mod sockets;
mod task_queue;

use std::fmt;

pub use addr::InetAddr;
pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::TcpConnection;
pub use event_loop::{EventLoop, LoopHandle};
pub use server::TcpServer;
pub use timer::TimerId;
pub use udp::UdpSocket;

/// The possible errors surfaced by the engine. Recoverable I/O conditions
/// (would-block writes, transient accept failures, peer closes) never appear
/// here; they are buffered, retried on the next readiness, or reported as a
/// connection state transition instead.
#[derive(Debug)]
pub enum Error {
    /// The double mapping backing a mirrored ring could not be established.
    Allocation(nix::errno::Errno),

    /// The cross-thread task queue was full; the task was dropped.
    QueueFull,

    /// A system call failed while setting up a descriptor.
    Sys(nix::errno::Errno),

    /// A std I/O operation failed (reserve descriptor, hostname lookup).
    Io(std::io::Error),

    /// An address string could not be parsed.
    Addr(std::net::AddrParseError),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Allocation(e) => write!(f, "ring allocation failed: {e}"),
            Self::QueueFull => write!(f, "pending task queue is full"),
            Self::Sys(e) => write!(f, "system call failed: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Addr(e) => write!(f, "bad address: {e}"),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Sys(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Self::Addr(e)
    }
}
