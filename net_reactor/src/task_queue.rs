// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use crate::ring::MirroredRing;
use crate::Error;

/// A deferred piece of work posted to the loop.
pub(crate) type Task = Box<dyn FnOnce() + 'static>;

const SLOT_SIZE: u32 = 64;

/// One queue slot: the owning task pointer, the commit word a producer
/// publishes with release ordering, and padding out to a cache line so
/// neighbouring producers do not share one.
#[repr(C)]
struct Slot {
    task: MaybeUninit<*mut (dyn FnOnce() + 'static)>,
    committed: std::sync::atomic::AtomicU32,
    _pad: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE as usize);

/// Lock-free multi-producer/single-consumer queue of fixed-size slots over a
/// mirrored ring, so a slot is always contiguous regardless of the wrap
/// point.
///
/// Producers `push` from any thread; only the loop thread may `pop`. A
/// consumer that observes a non-zero commit word also observes every prior
/// write to that slot by the committing producer.
pub(crate) struct TaskQueue {
    ring: MirroredRing,
}

// SAFETY: slots are handed between threads only through the reserve/commit/
// peek/consume protocol below. The queue accepts non-Send closures, which is
// sound only because the crate's public surface restricts producers on
// foreign threads to Send closures (LoopHandle) while non-Send closures can
// enter solely from the consuming thread itself (EventLoop::queue_in_loop).
unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub fn new(order: u32) -> Result<Self, Error> {
        Ok(TaskQueue {
            ring: MirroredRing::new(order)?,
        })
    }

    /// Reserves a slot, stores the task and commits it. Fails with
    /// `Error::QueueFull` without blocking when the ring has no room; the
    /// task is dropped in that case.
    pub fn push(&self, task: Task) -> Result<(), Error> {
        let slot = match self.reserve() {
            Some(slot) => slot,
            None => return Err(Error::QueueFull),
        };
        let raw = Box::into_raw(task);
        // SAFETY: reserve() moved `tail` past this slot, so no other producer
        // will touch it, and the consumer ignores it until the commit word is
        // published below.
        unsafe {
            (*slot).task = MaybeUninit::new(raw);
            fence(Ordering::Release);
            (*slot).committed.store(1, Ordering::Release);
        }
        Ok(())
    }

    /// Takes the oldest committed task, or `None` if the queue is empty or
    /// the producer owning the head slot has not committed yet.
    ///
    /// Only the loop thread calls this.
    pub fn pop(&self) -> Option<Task> {
        let head = self.ring.head().load(Ordering::Relaxed);
        if head == self.ring.tail().load(Ordering::Acquire) {
            return None;
        }
        let slot = self.ring.slot_ptr(head) as *mut Slot;
        // SAFETY: head never passes tail, so this slot was reserved by some
        // producer; the acquire load below decides whether its contents are
        // published yet.
        unsafe {
            if (*slot).committed.load(Ordering::Acquire) == 0 {
                return None;
            }
            let task = Box::from_raw((*slot).task.assume_init());
            // Zero the slot before releasing it so the commit word reads 0
            // for the next producer round.
            ptr::write_bytes(slot.cast::<u8>(), 0, SLOT_SIZE as usize);
            fence(Ordering::Release);
            self.ring.head().fetch_add(SLOT_SIZE, Ordering::Relaxed);
            Some(task)
        }
    }

    fn reserve(&self) -> Option<*mut Slot> {
        let size = self.ring.size();
        loop {
            let head = self.ring.head().load(Ordering::Relaxed);
            let tail = self.ring.tail().load(Ordering::Relaxed);
            if tail.wrapping_sub(head) > size - SLOT_SIZE {
                return None;
            }
            if self
                .ring
                .tail()
                .compare_exchange_weak(
                    tail,
                    tail.wrapping_add(SLOT_SIZE),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(self.ring.slot_ptr(tail) as *mut Slot);
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Release any tasks still queued so their captures are not leaked.
        while let Some(task) = self.pop() {
            drop(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn exactly_full_rejects_then_recovers() {
        // Order 12 = 4096 bytes = 64 slots.
        let queue = TaskQueue::new(12).unwrap();
        for _ in 0..64 {
            queue.push(Box::new(|| {})).unwrap();
        }
        assert!(matches!(queue.push(Box::new(|| {})), Err(Error::QueueFull)));

        queue.pop().unwrap()();
        queue.push(Box::new(|| {})).unwrap();
    }

    #[test]
    fn single_producer_tasks_pop_in_order() {
        let queue = TaskQueue::new(12).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..10u32 {
            let seen = seen.clone();
            queue.push(Box::new(move || seen.borrow_mut().push(i))).unwrap();
        }
        while let Some(task) = queue.pop() {
            task();
        }
        assert_eq!(*seen.borrow(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn multi_producer_handoff() {
        let queue = Arc::new(TaskQueue::new(12).unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        const PER_THREAD: u32 = 200;

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        loop {
                            let counter = counter.clone();
                            let task: Task =
                                Box::new(move || {
                                    counter.fetch_add(1, Ordering::Relaxed);
                                });
                            match queue.push(task) {
                                Ok(()) => break,
                                Err(_) => std::thread::yield_now(),
                            }
                        }
                    }
                })
            })
            .collect();

        let mut ran = 0;
        while ran < 4 * PER_THREAD {
            match queue.pop() {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4 * PER_THREAD);
    }
}
