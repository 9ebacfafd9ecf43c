// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use log::*;
use nix::errno::Errno;
use nix::sys::socket::AddressFamily;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopInner};
use crate::sockets;
use crate::{Error, InetAddr};

pub type UdpReadCallback = Rc<dyn Fn(&InetAddr, &mut Buffer)>;

/// Largest possible UDP payload; one receive buffer of this size is reused
/// for every datagram.
const READ_BUF_SIZE: usize = 65536;

/// A single nonblocking datagram socket driven by the loop.
///
/// Reads are delivered through the read callback one datagram at a time;
/// `send_to` is synchronous and nonblocking, so backpressure handling is the
/// caller's business.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Rc<UdpInner>,
}

struct UdpInner {
    event_loop: Weak<LoopInner>,
    name: String,
    socket: OwnedFd,
    channel: Channel,
    read_cb: RefCell<Option<UdpReadCallback>>,
    read_buf: RefCell<Vec<u8>>,
}

impl UdpSocket {
    // Defaults to IPv4 for now.
    pub fn new(event_loop: &EventLoop, name: &str) -> Result<UdpSocket, Error> {
        let socket = sockets::create_nonblocking_udp(AddressFamily::Inet)?;
        sockets::set_reuse_addr(&socket, true)?;
        sockets::set_reuse_port(&socket, true)?;

        let loop_weak = Rc::downgrade(&event_loop.inner);
        let channel = Channel::from_loop(loop_weak.clone(), socket.as_raw_fd());
        let inner = Rc::new(UdpInner {
            event_loop: loop_weak,
            name: name.to_string(),
            socket,
            channel,
            read_cb: RefCell::new(None),
            read_buf: RefCell::new(vec![0; READ_BUF_SIZE]),
        });

        let weak = Rc::downgrade(&inner);
        inner.channel.set_read_callback(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_read();
            }
        });

        Ok(UdpSocket { inner })
    }

    pub fn set_read_callback(&self, cb: impl Fn(&InetAddr, &mut Buffer) + 'static) {
        *self.inner.read_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn bind(&self, addr: &InetAddr) -> Result<(), Error> {
        sockets::bind_addr(self.inner.socket.as_raw_fd(), addr)?;
        self.inner.channel.enable_reading();
        info!("udp socket {} bound to {addr}", self.inner.name);
        Ok(())
    }

    /// Sends one datagram; returns the number of bytes the kernel took.
    pub fn send_to(&self, data: &[u8], dest: &InetAddr) -> Result<usize, Error> {
        Ok(sockets::send_to(self.inner.socket.as_raw_fd(), data, dest)?)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.socket.as_raw_fd()
    }
}

impl UdpInner {
    fn handle_read(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
        let mut scratch = self.read_buf.borrow_mut();
        match sockets::recv_from(self.socket.as_raw_fd(), &mut scratch) {
            Ok((n, Some(peer))) => {
                trace!("udp socket {} read {n} bytes from {peer}", self.name);
                let cb = self.read_cb.borrow().clone();
                if let Some(cb) = cb {
                    let mut buf = Buffer::new();
                    buf.append(&scratch[..n]);
                    cb(&peer, &mut buf);
                }
            }
            Ok((n, None)) => warn!("udp socket {} read {n} bytes without a peer", self.name),
            Err(Errno::EAGAIN) => {}
            Err(e) => error!("recvfrom on {}: {e}", self.name),
        }
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
