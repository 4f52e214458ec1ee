// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A TCP echo server, one coroutine per connection, demonstrating
//! `coflow::main_scheduler().run(..)` as a program's entry point.
//!
//! ```text
//! cargo run --example echo_server -- --port 7000
//! ```

use std::io::{Read, Write};

use clap::{App, Arg};
use coflow::net::{TcpListener, TcpStream};

fn handle(mut stream: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

fn main() {
    env_logger::init();

    let matches = App::new("echo_server")
        .about("coflow echo server demo")
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .default_value("7000"),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap().parse().expect("invalid port");
    let addr = format!("127.0.0.1:{}", port).parse().unwrap();

    coflow::main_scheduler().run(move || {
        let listener = TcpListener::bind(&addr).expect("failed to bind");
        log::info!("listening on {}", listener.local_addr().unwrap());

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("accepted {}", peer);
                    coflow::go(move || handle(stream));
                }
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                }
            }
        }
    });
}
