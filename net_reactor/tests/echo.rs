// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Duration;

use net_reactor::{EventLoop, InetAddr, TcpServer};

#[test]
fn tcp_echo_round_trip_and_close_notification() {
    let mut event_loop = EventLoop::new().unwrap();
    let listen_addr = InetAddr::new(0, true, false);
    let server = TcpServer::new(&event_loop, &listen_addr, "echo").unwrap();

    let connected = Rc::new(Cell::new(false));
    let disconnected = Rc::new(Cell::new(false));
    {
        let connected = connected.clone();
        let disconnected = disconnected.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                connected.set(true);
            } else {
                disconnected.set(true);
            }
        });
    }
    server.set_message_callback(|conn, buf| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });

    server.start();
    let port = server.local_addr().unwrap().port();
    assert_ne!(port, 0);

    let handle = event_loop.handle();
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"hello").unwrap();

        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"hello");

        drop(stream);
        // Give the loop a moment to observe the close before stopping it.
        std::thread::sleep(Duration::from_millis(100));
        handle.quit();
    });

    event_loop.run();
    client.join().unwrap();

    assert!(connected.get());
    assert!(disconnected.get());
}

#[test]
fn two_sends_arrive_in_order() {
    let mut event_loop = EventLoop::new().unwrap();
    let listen_addr = InetAddr::new(0, true, false);
    let server = TcpServer::new(&event_loop, &listen_addr, "order").unwrap();

    // Reply to any message with two separate sends.
    server.set_message_callback(|conn, buf| {
        buf.retrieve_all();
        conn.send(b"first,");
        conn.send(b"second");
    });

    server.start();
    let port = server.local_addr().unwrap().port();

    let handle = event_loop.handle();
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"go").unwrap();

        let mut reply = [0u8; 12];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"first,second");

        handle.quit();
    });

    event_loop.run();
    client.join().unwrap();
}

#[test]
fn write_complete_fires_after_a_large_send_drains() {
    let mut event_loop = EventLoop::new().unwrap();
    let listen_addr = InetAddr::new(0, true, false);
    let server = TcpServer::new(&event_loop, &listen_addr, "bulk").unwrap();

    // Large enough that the kernel cannot take it in one write, so part of
    // it must ride the output buffer and the writable-readiness path.
    const PAYLOAD: usize = 8 * 1024 * 1024;
    const HIGH_WATER: usize = 1024 * 1024;

    let completions = Rc::new(Cell::new(0u32));
    {
        let completions = completions.clone();
        server.set_write_complete_callback(move |_conn| {
            completions.set(completions.get() + 1);
        });
    }
    let high_water_hits = Rc::new(Cell::new(0u32));
    {
        let high_water_hits = high_water_hits.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let high_water_hits = high_water_hits.clone();
                conn.set_high_water_mark_callback(
                    move |_conn, queued| {
                        assert!(queued >= HIGH_WATER);
                        high_water_hits.set(high_water_hits.get() + 1);
                    },
                    HIGH_WATER,
                );
            }
        });
    }
    let sent = Rc::new(Cell::new(false));
    server.set_message_callback(move |conn, buf| {
        buf.retrieve_all();
        if !sent.get() {
            sent.set(true);
            conn.send(&vec![0x42u8; PAYLOAD]);
        }
    });

    server.start();
    let port = server.local_addr().unwrap().port();

    let handle = event_loop.handle();
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"pull").unwrap();

        // The socket send buffer cannot hold the payload, so the server has
        // to park the rest in its output buffer and finish from the
        // writable-readiness handler while this loop drains.
        let mut total = 0usize;
        let mut chunk = vec![0u8; 64 * 1024];
        while total < PAYLOAD {
            let n = stream.read(&mut chunk).unwrap();
            assert_ne!(n, 0, "server closed early");
            total += n;
        }
        assert_eq!(total, PAYLOAD);

        std::thread::sleep(Duration::from_millis(100));
        handle.quit();
    });

    event_loop.run();
    client.join().unwrap();

    assert_eq!(completions.get(), 1);
    // The output buffer crossed the mark from below exactly once.
    assert_eq!(high_water_hits.get(), 1);
}

#[test]
fn shutdown_half_closes_once_the_output_drains() {
    let mut event_loop = EventLoop::new().unwrap();
    let listen_addr = InetAddr::new(0, true, false);
    let server = TcpServer::new(&event_loop, &listen_addr, "shutdown").unwrap();

    const PAYLOAD: usize = 2 * 1024 * 1024;

    // Push a payload and immediately shut down the write side; the FIN must
    // still arrive after every byte.
    server.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(&vec![0x17u8; PAYLOAD]);
            conn.shutdown();
        }
    });

    server.start();
    let port = server.local_addr().unwrap().port();

    let handle = event_loop.handle();
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let mut total = 0usize;
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, PAYLOAD);

        drop(stream);
        std::thread::sleep(Duration::from_millis(100));
        handle.quit();
    });

    event_loop.run();
    client.join().unwrap();
}
