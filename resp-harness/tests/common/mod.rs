//! Scripted single-connection RESP server for integration tests.

#![allow(dead_code)]

pub mod store;

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use resp_harness::Response;
use resp_harness::resp::read_response;

/// One step of the server's script, played in order on the accepted connection.
pub enum Step {
    /// Read one command, then write these bytes.
    Reply(Vec<u8>),
    /// Write these bytes without waiting for a command.
    Push(Vec<u8>),
    Pause(Duration),
}

pub fn reply(bytes: &[u8]) -> Step {
    Step::Reply(bytes.to_vec())
}

pub fn push(bytes: &[u8]) -> Step {
    Step::Push(bytes.to_vec())
}

pub struct FakeServer {
    addr: SocketAddr,
    handle: JoinHandle<Result<Vec<Response>>>,
}

impl FakeServer {
    /// Binds an ephemeral port and serves exactly one connection.
    /// The connection is closed once the script runs out.
    pub fn start(steps: Vec<Step>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().context("accept")?;
            play(stream, steps)
        });
        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the script to finish and returns the commands it received.
    pub fn finish(self) -> Result<Vec<Response>> {
        self.handle
            .join()
            .map_err(|_| anyhow!("fake server thread panicked"))?
    }
}

fn play(stream: TcpStream, steps: Vec<Step>) -> Result<Vec<Response>> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut received = Vec::new();
    for step in steps {
        match step {
            Step::Reply(bytes) => {
                received.push(read_response(&mut reader).context("reading command")?);
                writer.write_all(&bytes)?;
            }
            Step::Push(bytes) => writer.write_all(&bytes)?,
            Step::Pause(duration) => thread::sleep(duration),
        }
    }
    Ok(received)
}

/// Arguments of a received command as text.
pub fn args_of(command: &Response) -> Vec<String> {
    command
        .as_array()
        .unwrap_or_default()
        .iter()
        .map(|arg| arg.as_text().unwrap_or_default())
        .collect()
}

/// A port nothing is listening on (bound once, then released).
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
