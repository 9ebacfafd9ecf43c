// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use log::*;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopInner};
use crate::sockets;
use crate::{Error, InetAddr};

/// A TCP server: an acceptor wired to a registry of named connections.
///
/// Set the callbacks, then `start()`. Each accepted connection gets a unique
/// name `"<server>-<ip:port>#<n>"` and a copy of the server-level callbacks;
/// when it closes, it removes itself from the registry and its final
/// teardown is deferred through the pending queue so it never happens inside
/// the dispatch that observed the close.
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    event_loop: Weak<LoopInner>,
    name: String,
    /// The bound listen address, resolved after bind so a port-0 request
    /// names connections by the real port.
    ip_port: String,
    acceptor: Acceptor,
    connections: RefCell<HashMap<String, TcpConnection>>,
    next_conn_id: Cell<u64>,
    started: Cell<bool>,
    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
}

impl TcpServer {
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: &InetAddr,
        name: &str,
    ) -> Result<TcpServer, Error> {
        let loop_weak = Rc::downgrade(&event_loop.inner);
        let acceptor = Acceptor::new(loop_weak.clone(), listen_addr, true)?;
        let bound = acceptor.local_addr().map_err(Error::Sys)?;

        let inner = Rc::new(ServerInner {
            event_loop: loop_weak,
            name: name.to_string(),
            ip_port: bound.ip_port(),
            acceptor,
            connections: RefCell::new(HashMap::new()),
            next_conn_id: Cell::new(1),
            started: Cell::new(false),
            connection_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            write_complete_cb: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(move |socket, peer| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(socket, peer);
                }
            });

        Ok(TcpServer { inner })
    }

    /// Starts listening. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.inner.started.get() {
            return;
        }
        self.inner.started.set(true);
        info!(
            "server {} listening on {}",
            self.inner.name, self.inner.ip_port
        );
        self.inner.acceptor.listen();
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The address the listening socket is bound to.
    pub fn local_addr(&self) -> Result<InetAddr, Error> {
        self.inner.acceptor.local_addr().map_err(Error::Sys)
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
}

impl ServerInner {
    fn new_connection(self: &Rc<Self>, socket: OwnedFd, peer_addr: InetAddr) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "server {} new connection {} from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match sockets::local_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(e) => {
                error!("getsockname on new connection: {e}");
                InetAddr::new(0, false, false)
            }
        };

        let conn = TcpConnection::new(
            self.event_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );
        self.connections
            .borrow_mut()
            .insert(conn_name, conn.clone());

        conn.install_callbacks(
            self.connection_cb.borrow().clone(),
            self.message_cb.borrow().clone(),
            self.write_complete_cb.borrow().clone(),
        );

        // Weak, because the connection already holds its callbacks and the
        // registry holds the connection; a strong count here would cycle.
        let weak = Rc::downgrade(self);
        conn.set_close_callback(Rc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnection) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
        info!(
            "server {} removing connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.borrow_mut().remove(conn.name());
        debug_assert!(removed.is_some());

        // Destruction is deferred so the channel outlives the dispatch that
        // delivered the close.
        if let Some(event_loop) = self.event_loop.upgrade() {
            let conn = conn.clone();
            if let Err(e) = event_loop.queue_task(Box::new(move || conn.connect_destroyed())) {
                error!("deferring connection teardown: {e}");
            }
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
        for (_, conn) in self.connections.borrow_mut().drain() {
            conn.connect_destroyed();
        }
    }
}
