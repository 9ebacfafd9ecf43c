// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use log::*;
use nix::errno::Errno;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::sockets;
use crate::InetAddr;

pub type ConnectionCallback = Rc<dyn Fn(&TcpConnection)>;
pub type MessageCallback = Rc<dyn Fn(&TcpConnection, &mut Buffer)>;
pub type WriteCompleteCallback = Rc<dyn Fn(&TcpConnection)>;
pub type HighWaterMarkCallback = Rc<dyn Fn(&TcpConnection, usize)>;
pub(crate) type CloseCallback = Rc<dyn Fn(&TcpConnection)>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One accepted TCP connection: its socket, channel, input/output buffers
/// and user callbacks.
///
/// The handle is reference counted and cheap to clone. Every dispatch into
/// user code holds a clone for its duration, so a connection stays alive
/// through its own close callback even after the server's registry dropped
/// it. State moves Connecting → Connected → (Disconnecting) → Disconnected,
/// only on the loop thread; the handle type is not `Send`, so cross-thread
/// senders marshal their bytes through `LoopHandle::run_in_loop` and touch
/// the connection from inside the loop.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Rc<ConnectionInner>,
}

struct ConnectionInner {
    event_loop: Weak<LoopInner>,
    name: String,
    state: Cell<State>,
    // The connection owns the descriptor; the channel only watches it.
    socket: OwnedFd,
    channel: Channel,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    high_water_cb: RefCell<Option<HighWaterMarkCallback>>,
    high_water_mark: Cell<usize>,
    close_cb: RefCell<Option<CloseCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Weak<LoopInner>,
        name: String,
        socket: OwnedFd,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> TcpConnection {
        let channel = Channel::from_loop(event_loop.clone(), socket.as_raw_fd());
        let conn = TcpConnection {
            inner: Rc::new(ConnectionInner {
                event_loop,
                name,
                state: Cell::new(State::Connecting),
                socket,
                channel,
                local_addr,
                peer_addr,
                input: RefCell::new(Buffer::new()),
                output: RefCell::new(Buffer::new()),
                connection_cb: RefCell::new(None),
                message_cb: RefCell::new(None),
                write_complete_cb: RefCell::new(None),
                high_water_cb: RefCell::new(None),
                high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
                close_cb: RefCell::new(None),
            }),
        };

        // Each trampoline upgrades to a strong handle first; that count is
        // what keeps the connection alive for the whole dispatch.
        let weak = Rc::downgrade(&conn.inner);
        conn.inner.channel.set_read_callback({
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection { inner }.handle_read();
                }
            }
        });
        conn.inner.channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection { inner }.handle_write();
                }
            }
        });
        conn.inner.channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection { inner }.handle_close();
                }
            }
        });
        conn.inner.channel.set_error_callback(move || {
            if let Some(inner) = weak.upgrade() {
                TcpConnection { inner }.handle_error();
            }
        });

        trace!(
            "connection {} created, fd {}",
            conn.inner.name,
            conn.inner.socket.as_raw_fd()
        );
        conn
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local_addr(&self) -> InetAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.inner.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.inner.state.get() == State::Connected
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnection) + 'static) {
        *self.inner.connection_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&TcpConnection, &mut Buffer) + 'static) {
        *self.inner.message_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&TcpConnection) + 'static) {
        *self.inner.write_complete_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnection, usize) + 'static,
        mark: usize,
    ) {
        *self.inner.high_water_cb.borrow_mut() = Some(Rc::new(cb));
        self.inner.high_water_mark.set(mark);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = sockets::set_tcp_no_delay(&self.inner.socket, on) {
            error!("TCP_NODELAY on {}: {e}", self.inner.name);
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = sockets::set_keep_alive(&self.inner.socket, on) {
            error!("SO_KEEPALIVE on {}: {e}", self.inner.name);
        }
    }

    /// Sends bytes on the connection. Ignored unless the connection is
    /// Connected. What the socket does not take immediately is buffered and
    /// written out as the socket becomes writable again.
    pub fn send(&self, data: &[u8]) {
        if self.inner.state.get() != State::Connected {
            return;
        }
        self.send_in_loop(data);
    }

    /// Drains `buf` and sends its contents.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.inner.state.get() != State::Connected {
            return;
        }
        let data = buf.retrieve_all_as_bytes();
        self.send_in_loop(&data);
    }

    /// Closes the write side once the output buffer drains. The connection
    /// keeps reading until the peer closes its side.
    pub fn shutdown(&self) {
        if self.inner.state.get() == State::Connected {
            self.inner.state.set(State::Disconnecting);
            self.shutdown_in_loop();
        }
    }

    /// Installed by the server; runs after the user connection callback on
    /// the close path.
    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.inner.close_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn install_callbacks(
        &self,
        connection_cb: Option<ConnectionCallback>,
        message_cb: Option<MessageCallback>,
        write_complete_cb: Option<WriteCompleteCallback>,
    ) {
        *self.inner.connection_cb.borrow_mut() = connection_cb;
        *self.inner.message_cb.borrow_mut() = message_cb;
        *self.inner.write_complete_cb.borrow_mut() = write_complete_cb;
    }

    /// First act of a fresh connection, on the loop thread: start reading
    /// and tell the user.
    pub(crate) fn connect_established(&self) {
        self.assert_loop();
        assert_eq!(self.inner.state.get(), State::Connecting);
        self.inner.state.set(State::Connected);
        self.inner.channel.enable_reading();
        self.invoke_connection_callback();
    }

    /// Last act of a dying connection, on the loop thread: tear the channel
    /// out of the poller and tell the user once more. Runs after the close
    /// path, deferred through the pending queue so the channel is not
    /// destroyed inside its own dispatch.
    pub(crate) fn connect_destroyed(&self) {
        self.assert_loop();
        if self.inner.state.get() == State::Connected {
            self.inner.state.set(State::Disconnected);
            self.inner.channel.disable_all();
            self.invoke_connection_callback();
        }
        self.inner.channel.remove();
    }

    fn handle_read(&self) {
        self.assert_loop();
        let result = self.inner.input.borrow_mut().read_fd(&self.inner.socket);
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!("connection {} read {n} bytes", self.inner.name);
                let cb = self.inner.message_cb.borrow().clone();
                if let Some(cb) = cb {
                    cb(self, &mut self.inner.input.borrow_mut());
                }
            }
            Err(e) => {
                error!("read on {}: {e}", self.inner.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.assert_loop();
        if !self.inner.channel.is_writing() {
            trace!("connection {} is down, no more writing", self.inner.name);
            return;
        }
        let result = {
            let output = self.inner.output.borrow();
            nix::unistd::write(&self.inner.socket, output.peek())
        };
        match result {
            Ok(n) => {
                let drained = {
                    let mut output = self.inner.output.borrow_mut();
                    output.retrieve(n);
                    output.is_empty()
                };
                if drained {
                    self.inner.channel.disable_writing();
                    self.queue_write_complete();
                    if self.inner.state.get() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(Errno::EAGAIN) => {}
            // Treated as transient; a fatal condition reports itself via
            // the next readiness as EPOLLERR or EPOLLHUP.
            Err(e) => debug!("write on {}: {e}", self.inner.name),
        }
    }

    fn handle_close(&self) {
        self.assert_loop();
        let state = self.inner.state.get();
        trace!("connection {} closing in state {state:?}", self.inner.name);
        assert!(state == State::Connected || state == State::Disconnecting);
        self.inner.state.set(State::Disconnected);
        self.inner.channel.disable_all();

        // This clone is what outlives the registry removal triggered below.
        let guard = self.clone();
        let cb = self.inner.connection_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(&guard);
        }
        let cb = self.inner.close_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(&self.inner.socket);
        error!(
            "connection {} SO_ERROR = {} ({})",
            self.inner.name,
            err,
            Errno::from_raw(err)
        );
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.assert_loop();
        if self.inner.state.get() == State::Disconnected {
            warn!("connection {} disconnected, dropping write", self.inner.name);
            return;
        }

        let len = data.len();
        let mut nwrote = 0usize;
        let mut remaining = len;
        let mut fault = false;

        // Nothing queued yet: try the socket directly.
        if !self.inner.channel.is_writing() && self.inner.output.borrow().is_empty() {
            match nix::unistd::write(&self.inner.socket, data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = len - n;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(Errno::EAGAIN) => {}
                Err(e) => {
                    error!("write on {}: {e}", self.inner.name);
                    if e == Errno::EPIPE || e == Errno::ECONNRESET {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = self.inner.output.borrow().readable_bytes();
            let mark = self.inner.high_water_mark.get();
            if old_len + remaining >= mark && old_len < mark {
                let cb = self.inner.high_water_cb.borrow().clone();
                if let Some(cb) = cb {
                    let conn = self.clone();
                    let queued = old_len + remaining;
                    self.queue_task(Box::new(move || cb(&conn, queued)));
                }
            }
            self.inner.output.borrow_mut().append(&data[nwrote..]);
            if !self.inner.channel.is_writing() {
                self.inner.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.assert_loop();
        if !self.inner.channel.is_writing() {
            sockets::shutdown_write(self.inner.socket.as_raw_fd());
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.inner.write_complete_cb.borrow().clone();
        if let Some(cb) = cb {
            let conn = self.clone();
            self.queue_task(Box::new(move || cb(&conn)));
        }
    }

    fn invoke_connection_callback(&self) {
        let cb = self.inner.connection_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    fn queue_task(&self, task: Box<dyn FnOnce()>) {
        if let Some(event_loop) = self.inner.event_loop.upgrade() {
            if let Err(e) = event_loop.queue_task(task) {
                error!("connection {}: {e}", self.inner.name);
            }
        }
    }

    fn assert_loop(&self) {
        if let Some(event_loop) = self.inner.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        trace!(
            "connection {} destroyed in state {:?}",
            self.name,
            self.state.get()
        );
    }
}
