// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;
use log::*;

use net_reactor::{EventLoop, InetAddr, TcpServer};

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value_t = 7000)]
    port: u16,

    /// Bind to the loopback interface only.
    #[arg(long)]
    local: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let mut event_loop = EventLoop::new()?;
    let listen_addr = InetAddr::new(args.port, args.local, false);
    let server = TcpServer::new(&event_loop, &listen_addr, "echo")?;

    server.set_connection_callback(|conn| {
        if conn.connected() {
            info!("{} up, peer {}", conn.name(), conn.peer_addr());
        } else {
            info!("{} down", conn.name());
        }
    });
    server.set_message_callback(|conn, buf| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });

    server.start();
    event_loop.run();

    Ok(())
}
