// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::*;
use nix::errno::Errno;

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::Error;

pub(crate) type TimerCallback = Box<dyn FnMut() + 'static>;

/// Expirations earlier than this are clamped so the timer descriptor is
/// never armed with a zero or negative value.
const MIN_DELAY: Duration = Duration::from_micros(100);

static NEXT_SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// A pending timer: its callback, its next expiration on the monotonic
/// clock, and an optional repeat interval (`None` means one-shot).
pub(crate) struct Timer {
    callback: RefCell<TimerCallback>,
    expiration: Cell<Instant>,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub fn new(callback: TimerCallback, when: Instant, interval: Option<Duration>) -> Timer {
        Self::with_sequence(Self::alloc_sequence(), callback, when, interval)
    }

    pub fn with_sequence(
        sequence: u64,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> Timer {
        Timer {
            callback: RefCell::new(callback),
            expiration: Cell::new(when),
            interval,
            sequence,
        }
    }

    /// Sequence numbers are unique across the process lifetime; the first
    /// one handed out is 1.
    pub fn alloc_sequence() -> u64 {
        NEXT_SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }

    pub fn run(&self) {
        (self.callback.borrow_mut())();
    }

    pub fn expiration(&self) -> Instant {
        self.expiration.get()
    }

    pub fn repeats(&self) -> bool {
        self.interval.is_some()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn restart(&self, now: Instant) {
        if let Some(interval) = self.interval {
            self.expiration.set(now + interval);
        }
    }
}

/// Opaque handle to a scheduled timer, valid for cancellation from any
/// thread. Cancelling a timer that already fired (or was already cancelled)
/// is a no-op: its sequence never re-enters the active set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// All pending timers of one loop, projected onto a single timer
/// descriptor that is kept armed for the earliest expiration.
///
/// `timers` orders entries for earliest-first extraction and `active` keys
/// them by sequence for cancellation; the two hold the same timers at all
/// times outside the expiry callback. `canceling` collects cancellations
/// that arrive while the expired batch runs, so a repeating timer cancelled
/// from inside its own callback is not rearmed.
pub(crate) struct TimerQueue {
    event_loop: Weak<LoopInner>,
    timerfd: OwnedFd,
    channel: Channel,
    timers: RefCell<BTreeMap<(Instant, u64), Rc<Timer>>>,
    active: RefCell<HashMap<u64, Rc<Timer>>>,
    calling_expired: Cell<bool>,
    canceling: RefCell<HashSet<u64>>,
}

impl TimerQueue {
    pub fn new(event_loop: Weak<LoopInner>) -> Result<Rc<TimerQueue>, Error> {
        let timerfd = create_timerfd()?;
        let channel = Channel::from_loop(event_loop.clone(), timerfd.as_raw_fd());
        let queue = Rc::new(TimerQueue {
            event_loop,
            timerfd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(HashMap::new()),
            calling_expired: Cell::new(false),
            canceling: RefCell::new(HashSet::new()),
        });
        let weak = Rc::downgrade(&queue);
        queue.channel.set_read_callback(move || {
            if let Some(queue) = weak.upgrade() {
                queue.handle_expired();
            }
        });
        queue.channel.enable_reading();
        Ok(queue)
    }

    /// Schedules a timer from the loop thread and returns its handle
    /// immediately.
    pub fn add_timer(
        &self,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Rc::new(Timer::new(callback, when, interval));
        let id = TimerId(timer.sequence());
        self.add_timer_in_loop(timer);
        id
    }

    pub fn add_timer_in_loop(&self, timer: Rc<Timer>) {
        self.assert_loop();
        let when = timer.expiration();
        if self.insert(timer) {
            self.rearm(when);
        }
    }

    /// Cancels the timer if it is still pending. If its callback is running
    /// right now, the timer cannot be un-fired; only its rearming is
    /// suppressed. A stale handle does nothing.
    pub fn cancel(&self, id: TimerId) {
        self.assert_loop();
        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
        if let Some(timer) = self.active.borrow_mut().remove(&id.0) {
            let removed = self
                .timers
                .borrow_mut()
                .remove(&(timer.expiration(), timer.sequence()));
            debug_assert!(removed.is_some());
        } else if self.calling_expired.get() {
            self.canceling.borrow_mut().insert(id.0);
        }
    }

    /// The timer descriptor's read callback: drain the descriptor, pull out
    /// everything due, run the callbacks, then rearm repeaters and the
    /// descriptor itself.
    fn handle_expired(&self) {
        self.assert_loop();
        let now = Instant::now();
        self.drain_timerfd();

        let expired = self.take_expired(now);

        self.calling_expired.set(true);
        self.canceling.borrow_mut().clear();
        for timer in &expired {
            timer.run();
        }
        self.calling_expired.set(false);

        self.restart_expired(expired, now);
    }

    /// Removes and returns every timer due at or before `now`, in
    /// expiration order, keeping both sets in step.
    fn take_expired(&self, now: Instant) -> Vec<Rc<Timer>> {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        let pending = timers.split_off(&(now, u64::MAX));
        let expired: Vec<Rc<Timer>> =
            std::mem::replace(&mut *timers, pending).into_values().collect();
        for timer in &expired {
            let removed = active.remove(&timer.sequence());
            debug_assert!(removed.is_some());
        }
        expired
    }

    fn restart_expired(&self, expired: Vec<Rc<Timer>>, now: Instant) {
        for timer in expired {
            if timer.repeats() && !self.canceling.borrow().contains(&timer.sequence()) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        let next = self.timers.borrow().keys().next().map(|(when, _)| *when);
        if let Some(when) = next {
            self.rearm(when);
        }
    }

    /// Inserts into both sets; true if the new timer became the earliest.
    fn insert(&self, timer: Rc<Timer>) -> bool {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        debug_assert_eq!(timers.len(), active.len());

        let when = timer.expiration();
        let earliest_changed = match timers.keys().next() {
            Some((first, _)) => when < *first,
            None => true,
        };
        let prev = timers.insert((when, timer.sequence()), timer.clone());
        debug_assert!(prev.is_none());
        let prev = active.insert(timer.sequence(), timer);
        debug_assert!(prev.is_none());
        earliest_changed
    }

    fn rearm(&self, when: Instant) {
        reset_timerfd(self.timerfd.as_raw_fd(), when);
    }

    fn drain_timerfd(&self) {
        let mut buf = [0u8; 8];
        match nix::unistd::read(&self.timerfd, &mut buf) {
            Ok(8) => trace!("timerfd fired {} time(s)", u64::from_ne_bytes(buf)),
            Ok(n) => error!("timerfd read returned {n} bytes instead of 8"),
            Err(e) => warn!("timerfd read: {e}"),
        }
    }

    /// Detaches the timer channel from the poller; called when the owning
    /// loop shuts down.
    pub fn shutdown(&self) {
        self.channel.disable_all();
        self.channel.remove();
    }

    fn assert_loop(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
    }
}

fn create_timerfd() -> Result<OwnedFd, Error> {
    let raw = unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    };
    if raw < 0 {
        return Err(Error::Sys(Errno::last()));
    }
    // SAFETY: timerfd_create just handed us this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// One-shot arms the descriptor for `when`, clamped to a small positive
/// delay if `when` already passed.
fn reset_timerfd(fd: RawFd, when: Instant) {
    let delay = when
        .saturating_duration_since(Instant::now())
        .max(MIN_DELAY);
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    if unsafe { libc::timerfd_settime(fd, 0, &new_value, std::ptr::null_mut()) } != 0 {
        error!("timerfd_settime: {}", Errno::last());
    }
}
