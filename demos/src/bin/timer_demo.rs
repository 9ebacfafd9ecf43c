// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use log::*;

use net_reactor::EventLoop;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut event_loop = EventLoop::new()?;

    // Runs once, 2.5 seconds from now.
    event_loop.run_after(Duration::from_millis(2500), || {
        info!("run_after 2.5s: this runs once");
    });

    // Runs every second until cancelled below.
    let every = event_loop.run_every(Duration::from_secs(1), || {
        info!("run_every 1s: this runs every second");
    });

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(5500), move || {
        info!("cancelling the periodic timer");
        if let Err(e) = handle.cancel(every) {
            warn!("cancel failed: {e}");
        }
    });

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_secs(10), move || {
        info!("quitting");
        handle.quit();
    });

    info!("timers armed, entering the loop");
    event_loop.run();
    info!("loop finished");

    Ok(())
}
