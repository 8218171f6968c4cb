//! An echo server and its client on one stack.
//!
//! Runs the network loop over a loopback device, so the client's segments arrive at the server
//! and the other way around. The server answers every message with the same bytes, the client
//! sends one message, prints the echo and closes.
use std::io::{stdout, Write};
use std::net;
use std::thread;
use structopt::StructOpt;

use uptcp::{Config as StackConfig, Stack};
use uptcp::nic::loopback::Loopback;
use uptcp::time::Instant;
use uptcp::wire::{Ipv4Address, SocketAddr};

fn main() {
    let Config {
        host,
        port,
        message,
    } = Config::from_args();

    let host = Ipv4Address::from(host.octets());
    let mut config = StackConfig::default();
    config.local_addr = host;
    let (stack, mut endpoint) = Stack::new(config);
    let addr = SocketAddr::new(host, port);

    let network = {
        let stack = stack.clone();
        thread::spawn(move || {
            let mut nic = Loopback::new(64);
            while !stack.is_shutdown() {
                endpoint.poll(Instant::now(), &mut nic).unwrap();
                thread::yield_now();
            }
        })
    };

    let listener = stack.socket().unwrap();
    stack.bind(listener, addr).unwrap();
    stack.listen(listener, 0).unwrap();

    let server = {
        let stack = stack.clone();
        thread::spawn(move || {
            let (sock, peer) = stack.accept(listener).unwrap();
            let mut buf = vec![0; 1 << 12];
            loop {
                let len = stack.recv(sock, &mut buf).unwrap();
                if len == 0 {
                    break;
                }
                let mut sent = 0;
                while sent < len {
                    sent += stack.send(sock, &buf[sent..len]).unwrap();
                }
            }
            stack.close(sock).unwrap();
            peer
        })
    };

    let client = stack.socket().unwrap();
    stack.connect(client, addr)
        .unwrap_or_else(|err| panic!("Couldn't connect to {}: {}", addr, err));

    let message = message.into_bytes();
    let mut sent = 0;
    while sent < message.len() {
        sent += stack.send(client, &message[sent..]).unwrap();
    }

    let mut echo = Vec::new();
    let mut buf = vec![0; 1 << 12];
    while echo.len() < message.len() {
        match stack.recv(client, &mut buf).unwrap() {
            0 => break,
            len => echo.extend_from_slice(&buf[..len]),
        }
    }
    stack.close(client).unwrap();

    let peer = server.join().unwrap();
    stack.close(listener).unwrap();
    stack.shutdown();
    network.join().unwrap();

    let out = stdout();
    let mut out = out.lock();
    writeln!(out, "{} echoed {} bytes to {}", addr, echo.len(), peer).unwrap();
    out.write_all(&echo).unwrap();
    writeln!(out).unwrap();
}

#[derive(StructOpt)]
struct Config {
    #[structopt(long = "host", default_value = "10.0.0.1")]
    host: net::Ipv4Addr,
    #[structopt(long = "port", default_value = "7")]
    port: u16,
    message: String,
}
