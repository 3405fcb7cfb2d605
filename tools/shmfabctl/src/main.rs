// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! shmfabctl - drive a running fabric server from the command line.
//!
//! ```bash
//! shmfabctl add 3 4              # blocking, prints 7
//! shmfabctl mul 6 7              # prints the request id
//! shmfabctl mul 6 7 --wait       # polls until the product arrives
//! shmfabctl concat hello world --wait
//! shmfabctl search abcdef cd --wait
//! shmfabctl result 42            # one poll for request id 42
//! ```

use clap::{Parser, Subcommand};
use shmfab::{ClientError, ClientSession, Reply, ReplyPayload, RequestId, Status};
use std::thread;
use std::time::{Duration, Instant};

/// How long `--wait` keeps polling before giving up.
const WAIT_DEADLINE: Duration = Duration::from_secs(30);

/// Fabric command-line client
#[derive(Parser, Debug)]
#[command(name = "shmfabctl")]
#[command(about = "Submit requests to a running shmfab server")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Add two integers (blocking)
    Add { a: i32, b: i32 },

    /// Subtract b from a (blocking)
    Sub { a: i32, b: i32 },

    /// Multiply two integers (asynchronous)
    Mul {
        a: i32,
        b: i32,
        /// Poll until the result arrives instead of printing the id
        #[arg(long)]
        wait: bool,
    },

    /// Divide a by b (asynchronous)
    Div {
        a: i32,
        b: i32,
        #[arg(long)]
        wait: bool,
    },

    /// Concatenate two strings of 1..=16 bytes (asynchronous)
    Concat {
        s1: String,
        s2: String,
        #[arg(long)]
        wait: bool,
    },

    /// Find needle in haystack (asynchronous)
    Search {
        haystack: String,
        needle: String,
        #[arg(long)]
        wait: bool,
    },

    /// Poll once for the result of a previously issued request id
    Result { id: u64 },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), ClientError> {
    let mut client = ClientSession::connect_default()?;

    match cmd {
        Cmd::Add { a, b } => println!("{}", client.add(a, b)?),
        Cmd::Sub { a, b } => println!("{}", client.subtract(a, b)?),
        Cmd::Mul { a, b, wait } => {
            let id = client.multiply(a, b)?;
            finish_async(&mut client, id, wait)?;
        }
        Cmd::Div { a, b, wait } => {
            let id = client.divide(a, b)?;
            finish_async(&mut client, id, wait)?;
        }
        Cmd::Concat { s1, s2, wait } => {
            let id = client.concat(&s1, &s2)?;
            finish_async(&mut client, id, wait)?;
        }
        Cmd::Search {
            haystack,
            needle,
            wait,
        } => {
            let id = client.search(&haystack, &needle)?;
            finish_async(&mut client, id, wait)?;
        }
        Cmd::Result { id } => match client.poll(RequestId(id))? {
            Some(reply) => print_reply(&reply),
            None => println!("request {id} is still in flight"),
        },
    }

    Ok(())
}

fn finish_async(client: &mut ClientSession, id: RequestId, wait: bool) -> Result<(), ClientError> {
    if !wait {
        println!("request id: {id}");
        return Ok(());
    }

    let start = Instant::now();
    loop {
        match client.poll(id)? {
            Some(reply) => {
                print_reply(&reply);
                return Ok(());
            }
            None if start.elapsed() < WAIT_DEADLINE => thread::sleep(Duration::from_millis(200)),
            None => {
                eprintln!("request {id} did not complete within {WAIT_DEADLINE:?}");
                std::process::exit(1);
            }
        }
    }
}

fn print_reply(reply: &Reply) {
    match (&reply.payload, reply.status) {
        (ReplyPayload::Number(value), Status::Ok) => println!("{value}"),
        (ReplyPayload::Text(text), Status::Ok) => println!("{text}"),
        (ReplyPayload::Position(position), Status::Ok) => println!("{position}"),
        (ReplyPayload::Position(position), Status::NotFound) => {
            println!("{position} (not found)")
        }
        (_, status) => println!("request failed: {status}"),
    }
}
