// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;
use log::*;

use net_reactor::{EventLoop, InetAddr, UdpSocket};

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value_t = 7001)]
    port: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let mut event_loop = EventLoop::new()?;
    let socket = UdpSocket::new(&event_loop, "udp-echo")?;

    let responder = socket.clone();
    socket.set_read_callback(move |peer, buf| {
        let data = buf.retrieve_all_as_bytes();
        info!("echoing {} bytes to {peer}", data.len());
        if let Err(e) = responder.send_to(&data, peer) {
            warn!("send_to {peer}: {e}");
        }
    });

    socket.bind(&InetAddr::new(args.port, false, false))?;
    event_loop.run();

    Ok(())
}
