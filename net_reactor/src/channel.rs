// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use log::*;

use crate::event_loop::{EventLoop, LoopInner};

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

const HUP_EVENT: u32 = libc::EPOLLHUP as u32;
const ERR_EVENT: u32 = libc::EPOLLERR as u32;
const IN_EVENT: u32 = libc::EPOLLIN as u32;
const RDHUP_EVENT: u32 = libc::EPOLLRDHUP as u32;

/// Registration state of a channel with the poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Membership {
    New,
    Added,
    Deleted,
}

/// The per-descriptor dispatcher.
///
/// A channel never owns its descriptor; the component that opened the fd
/// does, and it keeps the channel alongside. Cloning is cheap and yields a
/// second handle to the same channel; the poller's registry and the loop's
/// active list hold such clones, which is what keeps a channel alive while
/// its events are being dispatched even if its owner drops it mid-callback.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<ChannelInner>,
}

type EventCallback = Rc<dyn Fn()>;

struct ChannelInner {
    event_loop: Weak<LoopInner>,
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    membership: Cell<Membership>,
    handling: Cell<bool>,
    read_cb: RefCell<Option<EventCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Channel {
        Self::from_loop(Rc::downgrade(&event_loop.inner), fd)
    }

    pub(crate) fn from_loop(event_loop: Weak<LoopInner>, fd: RawFd) -> Channel {
        Channel {
            inner: Rc::new(ChannelInner {
                event_loop,
                fd,
                events: Cell::new(NONE_EVENT),
                revents: Cell::new(NONE_EVENT),
                membership: Cell::new(Membership::New),
                handling: Cell::new(false),
                read_cb: RefCell::new(None),
                write_cb: RefCell::new(None),
                close_cb: RefCell::new(None),
                error_cb: RefCell::new(None),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn set_read_callback(&self, cb: impl Fn() + 'static) {
        *self.inner.read_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + 'static) {
        *self.inner.write_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + 'static) {
        *self.inner.close_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + 'static) {
        *self.inner.error_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn enable_reading(&self) {
        self.inner.events.set(self.inner.events.get() | READ_EVENT);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.events.set(self.inner.events.get() & !READ_EVENT);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.events.set(self.inner.events.get() | WRITE_EVENT);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.events.set(self.inner.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.events.set(NONE_EVENT);
        self.update();
    }

    pub fn is_reading(&self) -> bool {
        self.inner.events.get() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.inner.events.get() & WRITE_EVENT != 0
    }

    /// Unregisters the channel from its poller. The interest mask must be
    /// empty (`disable_all`) beforehand, and a channel must not remove itself
    /// from inside its own dispatch; removal paths defer through the pending
    /// queue instead.
    pub fn remove(&self) {
        debug_assert!(!self.inner.handling.get());
        if let Some(event_loop) = self.inner.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    pub(crate) fn events(&self) -> u32 {
        self.inner.events.get()
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.inner.events.get() == NONE_EVENT
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.inner.revents.set(revents);
    }

    pub(crate) fn membership(&self) -> Membership {
        self.inner.membership.get()
    }

    pub(crate) fn set_membership(&self, membership: Membership) {
        self.inner.membership.set(membership);
    }

    /// Dispatches the pending revents to the registered callbacks:
    /// close on hangup without readable data, then error, then read, then
    /// write. Each callback is cloned out of its cell first, so a callback
    /// may re-register or change the channel's interest while it runs.
    pub(crate) fn handle_event(&self) {
        self.inner.handling.set(true);
        let revents = self.inner.revents.get();
        trace!("fd {} dispatching revents {revents:#x}", self.inner.fd);

        if revents & HUP_EVENT != 0 && revents & IN_EVENT == 0 {
            Self::invoke(&self.inner.close_cb);
        }
        if revents & ERR_EVENT != 0 {
            Self::invoke(&self.inner.error_cb);
        }
        if revents & (IN_EVENT | (libc::EPOLLPRI as u32) | RDHUP_EVENT) != 0 {
            Self::invoke(&self.inner.read_cb);
        }
        if revents & WRITE_EVENT != 0 {
            Self::invoke(&self.inner.write_cb);
        }
        self.inner.handling.set(false);
    }

    fn invoke(slot: &RefCell<Option<EventCallback>>) {
        let cb = slot.borrow().clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    fn update(&self) {
        match self.inner.event_loop.upgrade() {
            Some(event_loop) => event_loop.update_channel(self),
            None => warn!(
                "fd {} interest changed after its loop was dropped",
                self.inner.fd
            ),
        }
    }
}
