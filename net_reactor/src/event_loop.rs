// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::{OnceCell, RefCell};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::*;
use nix::errno::Errno;

use crate::channel::Channel;
use crate::poller::Poller;
use crate::task_queue::{Task, TaskQueue};
use crate::timer::{Timer, TimerCallback, TimerId, TimerQueue};
use crate::Error;

const POLL_TIMEOUT_MS: libc::c_int = 10_000;

/// Order of the pending task ring: 64 KiB, 1024 slots.
const PENDING_QUEUE_ORDER: u32 = 16;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<LoopInner>>> = const { RefCell::new(None) };
}

static IGNORE_SIGPIPE: Once = Once::new();

/// State shared between the loop and the components it drives. Everything in
/// here is confined to the loop thread except the pieces the `Send` handle
/// also carries (quit flag, task queue, wakeup descriptor, draining flag).
pub(crate) struct LoopInner {
    thread: ThreadId,
    quit: Arc<AtomicBool>,
    poller: RefCell<Poller>,
    pending: Arc<TaskQueue>,
    draining: Arc<AtomicBool>,
    wakeup_fd: Arc<OwnedFd>,
    timers: OnceCell<Rc<TimerQueue>>,
}

impl LoopInner {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop method called from thread {:?}, but the loop belongs to {:?}",
                thread::current().id(),
                self.thread
            );
        }
    }

    pub fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update(channel);
    }

    pub fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove(channel);
    }

    /// Enqueues a task for the next drain pass. Wakes the loop when the
    /// caller is off-thread, or when the loop is currently draining (a task
    /// enqueued during the drain might otherwise wait out a full poll).
    pub fn queue_task(&self, task: Task) -> Result<(), Error> {
        self.pending.push(task)?;
        if !self.is_in_loop_thread() || self.draining.load(Ordering::Acquire) {
            wake(&self.wakeup_fd);
        }
        Ok(())
    }

    pub fn timer_queue(&self) -> &Rc<TimerQueue> {
        self.timers
            .get()
            .expect("timer queue exists for the lifetime of the loop")
    }

    /// The loop registered on the current thread, if any.
    pub fn current() -> Option<Rc<LoopInner>> {
        CURRENT_LOOP.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    fn drain_pending(&self) {
        self.draining.store(true, Ordering::Release);
        while let Some(task) = self.pending.pop() {
            task();
        }
        self.draining.store(false, Ordering::Release);
    }
}

/// A single-threaded reactor: one epoll descriptor, one timer descriptor,
/// one wakeup descriptor and one pending-task queue, all driven by the
/// thread that constructed the loop.
///
/// The loop itself is deliberately not `Send`: holding one proves the caller
/// is on the loop thread, which is what makes the non-`Send` callback
/// surface below sound. Foreign threads interact through [`LoopHandle`].
pub struct EventLoop {
    pub(crate) inner: Rc<LoopInner>,
    wakeup_channel: Channel,
}

impl EventLoop {
    /// Creates the loop on the calling thread. At most one loop may exist
    /// per thread; a second construction panics.
    pub fn new() -> Result<EventLoop, Error> {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            // A peer closing mid-write must surface as EPIPE, not kill the
            // process.
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });

        let wakeup_fd = Arc::new(create_eventfd()?);
        let inner = Rc::new(LoopInner {
            thread: thread::current().id(),
            quit: Arc::new(AtomicBool::new(false)),
            poller: RefCell::new(Poller::new()?),
            pending: Arc::new(TaskQueue::new(PENDING_QUEUE_ORDER)?),
            draining: Arc::new(AtomicBool::new(false)),
            wakeup_fd: wakeup_fd.clone(),
            timers: OnceCell::new(),
        });

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.as_ref().and_then(Weak::upgrade).is_some() {
                panic!(
                    "another event loop already exists in thread {:?}",
                    thread::current().id()
                );
            }
            *current = Some(Rc::downgrade(&inner));
        });
        debug!("event loop created in thread {:?}", inner.thread);

        let wakeup_channel = Channel::from_loop(Rc::downgrade(&inner), wakeup_fd.as_raw_fd());
        let read_fd = wakeup_fd.clone();
        wakeup_channel.set_read_callback(move || drain_wakeup(&read_fd));
        wakeup_channel.enable_reading();

        let timers = TimerQueue::new(Rc::downgrade(&inner))?;
        if inner.timers.set(timers).is_err() {
            unreachable!("timer queue is set once, here");
        }

        Ok(EventLoop {
            inner,
            wakeup_channel,
        })
    }

    /// Runs the dispatch loop until [`quit`](Self::quit) is observed: poll
    /// up to 10 seconds, dispatch every ready channel, then drain the
    /// pending task queue.
    pub fn run(&mut self) {
        self.inner.assert_in_loop_thread();
        self.inner.quit.store(false, Ordering::Release);
        trace!("event loop starts looping");

        let mut active: Vec<Channel> = Vec::new();
        while !self.inner.quit.load(Ordering::Acquire) {
            active.clear();
            self.inner
                .poller
                .borrow_mut()
                .poll(POLL_TIMEOUT_MS, &mut active);
            for channel in &active {
                channel.handle_event();
            }
            self.inner.drain_pending();
        }

        trace!("event loop stops looping");
    }

    /// Asks the loop to exit at the end of the current iteration. Callable
    /// from callbacks running on the loop thread; foreign threads use
    /// [`LoopHandle::quit`], which also interrupts a poll in progress.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::Release);
    }

    /// Defers a task to the end of the current (or next) loop iteration.
    /// Unlike the handle's variant this accepts non-`Send` tasks: the queue
    /// is drained by this same thread.
    pub fn queue_in_loop(&self, task: impl FnOnce() + 'static) -> Result<(), Error> {
        self.inner.queue_task(Box::new(task))
    }

    /// A `Send + Clone` handle for posting work and timers from other
    /// threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            thread: self.inner.thread,
            queue: self.inner.pending.clone(),
            wakeup_fd: self.inner.wakeup_fd.clone(),
            quit: self.inner.quit.clone(),
            draining: self.inner.draining.clone(),
        }
    }

    /// Runs `callback` at `when`.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + 'static) -> TimerId {
        self.inner
            .timer_queue()
            .add_timer(Box::new(callback), when, None)
    }

    /// Runs `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Runs `callback` every `interval`, first in one `interval` from now.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + 'static) -> TimerId {
        assert!(interval > Duration::ZERO);
        self.inner
            .timer_queue()
            .add_timer(Box::new(callback), Instant::now() + interval, Some(interval))
    }

    /// Cancels a pending timer; stale handles are ignored.
    pub fn cancel(&self, id: TimerId) {
        self.inner.timer_queue().cancel(id);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(
            "event loop of thread {:?} destructs in thread {:?}",
            self.inner.thread,
            thread::current().id()
        );
        if let Some(timers) = self.inner.timers.get() {
            timers.shutdown();
        }
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        CURRENT_LOOP.with(|current| current.borrow_mut().take());
    }
}

/// The thread-safe face of a loop. All methods may be called from any
/// thread; tasks and timer callbacks crossing threads must be `Send`.
#[derive(Clone)]
pub struct LoopHandle {
    thread: ThreadId,
    queue: Arc<TaskQueue>,
    wakeup_fd: Arc<OwnedFd>,
    quit: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Runs `task` synchronously when called on the loop thread, otherwise
    /// queues it and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        if self.is_in_loop_thread() {
            task();
            Ok(())
        } else {
            self.queue_in_loop(task)
        }
    }

    /// Queues `task` for the loop's next drain pass. Fails with
    /// [`Error::QueueFull`] when the pending ring is out of slots; the task
    /// is dropped.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.queue.push(Box::new(task))?;
        if !self.is_in_loop_thread() || self.draining.load(Ordering::Acquire) {
            wake(&self.wakeup_fd);
        }
        Ok(())
    }

    /// Asks the loop to exit; unblocks an in-progress poll when called from
    /// another thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            wake(&self.wakeup_fd);
        }
    }

    pub fn run_at(
        &self,
        when: Instant,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId, Error> {
        self.schedule(when, None, Box::new(callback))
    }

    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId, Error> {
        self.schedule(Instant::now() + delay, None, Box::new(callback))
    }

    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId, Error> {
        assert!(interval > Duration::ZERO);
        self.schedule(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    /// Cancels a timer: synchronously on the loop thread, else by posting
    /// the cancellation to the loop. A cancel posted from off-thread takes
    /// effect once the loop observes the wakeup.
    pub fn cancel(&self, id: TimerId) -> Result<(), Error> {
        if self.is_in_loop_thread() {
            if let Some(inner) = LoopInner::current() {
                inner.timer_queue().cancel(id);
            }
            Ok(())
        } else {
            self.queue_in_loop(move || {
                if let Some(inner) = LoopInner::current() {
                    inner.timer_queue().cancel(id);
                }
            })
        }
    }

    /// The sequence is allocated here so the caller gets its `TimerId`
    /// immediately; the timer object itself materializes in the loop
    /// thread.
    fn schedule(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut() + Send + 'static>,
    ) -> Result<TimerId, Error> {
        let sequence = Timer::alloc_sequence();
        if self.is_in_loop_thread() {
            if let Some(inner) = LoopInner::current() {
                let callback: TimerCallback = callback;
                inner
                    .timer_queue()
                    .add_timer_in_loop(Rc::new(Timer::with_sequence(
                        sequence, callback, when, interval,
                    )));
            }
        } else {
            self.queue_in_loop(move || {
                if let Some(inner) = LoopInner::current() {
                    let callback: TimerCallback = callback;
                    inner
                        .timer_queue()
                        .add_timer_in_loop(Rc::new(Timer::with_sequence(
                            sequence, callback, when, interval,
                        )));
                }
            })?;
        }
        Ok(TimerId(sequence))
    }
}

fn create_eventfd() -> Result<OwnedFd, Error> {
    let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if raw < 0 {
        return Err(Error::Sys(Errno::last()));
    }
    // SAFETY: eventfd just handed us this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Makes the wakeup descriptor read-ready. Safe to call from any thread;
/// the kernel serializes and coalesces concurrent writes.
fn wake(fd: &OwnedFd) {
    let one = 1u64.to_ne_bytes();
    match nix::unistd::write(fd, &one) {
        Ok(8) => {}
        Ok(n) => error!("wakeup write wrote {n} bytes instead of 8"),
        Err(e) => error!("wakeup write: {e}"),
    }
}

fn drain_wakeup(fd: &OwnedFd) {
    let mut buf = [0u8; 8];
    match nix::unistd::read(fd, &mut buf) {
        Ok(8) => {}
        Ok(n) => error!("wakeup read returned {n} bytes instead of 8"),
        Err(e) => warn!("wakeup read: {e}"),
    }
}
