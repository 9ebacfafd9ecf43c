// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use net_reactor::EventLoop;

#[test]
fn one_shot_fires_once_and_periodic_keeps_firing() {
    let mut event_loop = EventLoop::new().unwrap();
    let once = Rc::new(Cell::new(0u32));
    let every = Rc::new(Cell::new(0u32));

    {
        let once = once.clone();
        event_loop.run_after(Duration::from_millis(50), move || {
            once.set(once.get() + 1);
        });
    }
    {
        let every = every.clone();
        event_loop.run_every(Duration::from_millis(20), move || {
            every.set(every.get() + 1);
        });
    }

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(150), move || handle.quit());

    let started = Instant::now();
    event_loop.run();
    assert!(started.elapsed() >= Duration::from_millis(150));

    assert_eq!(once.get(), 1);
    // Roughly 150 ms / 20 ms firings; generous bounds for slow machines.
    assert!(
        (3..=8).contains(&every.get()),
        "periodic timer fired {} times",
        every.get()
    );
}

#[test]
fn cancel_before_firing_is_a_noop() {
    let mut event_loop = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(false));

    let id = {
        let fired = fired.clone();
        event_loop.run_after(Duration::from_millis(100), move || fired.set(true))
    };

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(20), move || {
        handle.cancel(id).unwrap();
    });

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(150), move || handle.quit());

    event_loop.run();
    assert!(!fired.get());

    // Cancelling again after the loop processed everything stays a no-op.
    event_loop.cancel(id);
}

#[test]
fn repeating_timer_cancelling_itself_runs_exactly_three_times() {
    let mut event_loop = EventLoop::new().unwrap();
    let count = Rc::new(Cell::new(0u32));
    let own_id = Rc::new(Cell::new(None));

    let handle = event_loop.handle();
    let id = {
        let count = count.clone();
        let own_id = own_id.clone();
        event_loop.run_every(Duration::from_millis(10), move || {
            count.set(count.get() + 1);
            if count.get() == 3 {
                // Synchronous on the loop thread: the cancellation lands
                // while this very callback is running.
                handle.cancel(own_id.get().unwrap()).unwrap();
            }
        })
    };
    own_id.set(Some(id));

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(200), move || handle.quit());

    event_loop.run();
    assert_eq!(count.get(), 3);
}

#[test]
fn zero_delay_timer_runs_on_a_later_iteration() {
    let mut event_loop = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(false));

    {
        let fired = fired.clone();
        event_loop.run_after(Duration::ZERO, move || fired.set(true));
    }
    // Nothing has polled yet, so nothing can have fired yet.
    assert!(!fired.get());

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(50), move || handle.quit());

    event_loop.run();
    assert!(fired.get());
}
