// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use log::*;
use nix::errno::Errno;

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::sockets;
use crate::{Error, InetAddr};

pub(crate) type NewConnectionCallback = Box<dyn Fn(OwnedFd, InetAddr)>;

/// Owns a listening socket and hands accepted descriptors to a callback.
pub(crate) struct Acceptor {
    inner: Rc<AcceptorInner>,
}

struct AcceptorInner {
    event_loop: Weak<LoopInner>,
    socket: OwnedFd,
    channel: Channel,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
    /// Spare descriptor kept open against /dev/null so an EMFILE accept can
    /// be completed and closed instead of hot-looping on readiness.
    reserve_fd: RefCell<Option<OwnedFd>>,
}

impl Acceptor {
    pub fn new(
        event_loop: Weak<LoopInner>,
        listen_addr: &InetAddr,
        reuse_port: bool,
    ) -> Result<Acceptor, Error> {
        let socket = sockets::create_nonblocking_tcp(listen_addr.family())?;
        sockets::set_reuse_addr(&socket, true)?;
        sockets::set_reuse_port(&socket, reuse_port)?;
        sockets::bind_addr(socket.as_raw_fd(), listen_addr)?;
        let reserve_fd = open_reserve()?;

        let channel = Channel::from_loop(event_loop.clone(), socket.as_raw_fd());
        let inner = Rc::new(AcceptorInner {
            event_loop,
            socket,
            channel,
            new_connection_cb: RefCell::new(None),
            listening: Cell::new(false),
            reserve_fd: RefCell::new(Some(reserve_fd)),
        });

        let weak = Rc::downgrade(&inner);
        inner.channel.set_read_callback(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_read();
            }
        });

        Ok(Acceptor { inner })
    }

    pub fn set_new_connection_callback(&self, cb: impl Fn(OwnedFd, InetAddr) + 'static) {
        *self.inner.new_connection_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// The address the socket is actually bound to; differs from the
    /// requested one when port 0 was asked for.
    pub fn local_addr(&self) -> nix::Result<InetAddr> {
        sockets::local_addr(self.inner.socket.as_raw_fd())
    }

    pub fn listen(&self) {
        if let Some(event_loop) = self.inner.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
        self.inner.listening.set(true);
        if let Err(e) = sockets::listen_on(&self.inner.socket) {
            panic!("listen on fd {}: {e}", self.inner.socket.as_raw_fd());
        }
        self.inner.channel.enable_reading();
    }
}

impl AcceptorInner {
    fn handle_read(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
        debug_assert!(self.listening.get());
        match sockets::accept(self.socket.as_raw_fd()) {
            Ok((connfd, peer)) => {
                let cb = self.new_connection_cb.borrow();
                match &*cb {
                    Some(cb) => cb(connfd, peer),
                    // Nobody to hand the connection to; closing it is all
                    // that is left.
                    None => drop(connfd),
                }
            }
            Err(Errno::EMFILE) => {
                error!("accept: out of file descriptors");
                self.drain_one_with_reserve();
            }
            Err(Errno::EAGAIN | Errno::ECONNABORTED | Errno::EINTR | Errno::EPROTO | Errno::EPERM) => {
                // Expected transients; the next readiness retries.
            }
            Err(e) => error!("accept: {e}"),
        }
    }

    /// The descriptor table is full: close the reserve, accept the pending
    /// connection into the freed slot, close it, and re-open the reserve.
    fn drain_one_with_reserve(&self) {
        let mut reserve = self.reserve_fd.borrow_mut();
        reserve.take();
        if let Ok((connfd, _)) = sockets::accept(self.socket.as_raw_fd()) {
            drop(connfd);
        }
        match open_reserve() {
            Ok(fd) => *reserve = Some(fd),
            Err(e) => error!("re-opening reserve descriptor: {e}"),
        }
    }
}

impl Drop for AcceptorInner {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn open_reserve() -> Result<OwnedFd, Error> {
    let file = File::open("/dev/null")?;
    Ok(OwnedFd::from(file))
}
