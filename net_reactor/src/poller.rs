// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::*;
use nix::errno::Errno;

use crate::channel::{Channel, Membership};
use crate::Error;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Owns the epoll descriptor and the registration state of every channel.
///
/// Kernel registrations carry the fd as user data; the `channels` map turns
/// it back into the Channel on wakeup. Every fd with a non-empty interest
/// mask has exactly one kernel registration.
pub(crate) struct Poller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Channel>,
}

impl Poller {
    pub fn new() -> Result<Self, Error> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(Error::Sys(Errno::last()));
        }
        // SAFETY: epoll_create1 just handed us this descriptor.
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Poller {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    /// Blocks up to `timeout_ms` and appends every channel with pending
    /// events to `active`, with its revents set. A signal interruption
    /// returns an empty list without error.
    pub fn poll(&mut self, timeout_ms: libc::c_int, active: &mut Vec<Channel>) {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n > 0 {
            trace!("{n} events ready");
            for event in &self.events[..n as usize] {
                let fd = event.u64 as RawFd;
                // A stale kernel event may outlive its registration by one
                // poll; an fd missing from the map is skipped.
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(event.events);
                    active.push(channel.clone());
                }
            }
            if n as usize == self.events.len() {
                let ev = libc::epoll_event { events: 0, u64: 0 };
                self.events.resize(self.events.len() * 2, ev);
            }
        } else if n == 0 {
            trace!("nothing happened");
        } else {
            let errno = Errno::last();
            if errno != Errno::EINTR {
                error!("epoll_wait: {errno}");
            }
        }
    }

    /// Applies the channel's current interest mask to the kernel, keyed off
    /// its membership tag.
    pub fn update(&mut self, channel: &Channel) {
        let fd = channel.fd();
        match channel.membership() {
            Membership::New | Membership::Deleted => {
                if channel.membership() == Membership::New {
                    self.channels.insert(fd, channel.clone());
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                channel.set_membership(Membership::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            Membership::Added => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_membership(Membership::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Drops the channel's registration. The channel must have an empty
    /// interest mask by the time it is removed.
    pub fn remove(&mut self, channel: &Channel) {
        let fd = channel.fd();
        assert!(channel.is_none_event());
        let membership = channel.membership();
        assert!(membership == Membership::Added || membership == Membership::Deleted);

        let removed = self.channels.remove(&fd);
        debug_assert!(removed.is_some());

        if membership == Membership::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_membership(Membership::New);
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            let errno = Errno::last();
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl op={op} fd={fd}: {errno}");
            } else {
                // Failing to add or modify a registration leaves the loop
                // unable to honor its dispatch contract.
                panic!("epoll_ctl op={op} fd={fd}: {errno}");
            }
        }
    }
}
