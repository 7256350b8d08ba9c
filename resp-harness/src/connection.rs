//! One TCP connection to one server.
//!
//! A [`Connection`] supports two disciplines:
//!
//! - [`Connection::request`]: encode a command, write it, read exactly one reply
//! - [`Connection::read_frame`]: read one reply that arrived without a request
//!   (pub/sub pushes)
//!
//! Both take `&mut self`, so a connection never has two readers at once. Each
//! logical actor (the scenario driver, every subscriber) opens its own.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::resp::{Response, encode_command, parse_command_line, read_response};

pub struct Connection {
    peer: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Tracked for reporting only; the codec does not enforce it.
    authenticated: bool,
}

impl Connection {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(addr, timeout)?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            peer,
            reader: BufReader::new(stream),
            writer,
            authenticated: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Bounds every subsequent read. `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        // The reader and writer share one socket, so the option applies to both.
        self.writer.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Sends a command and reads exactly one reply.
    ///
    /// An `Error` reply is returned as `Ok(Response::Error(..))`; only framing
    /// and transport failures are `Err`.
    pub fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Response> {
        if args.is_empty() {
            return Err(HarnessError::Protocol(
                "refusing to issue an empty command".to_string(),
            ));
        }
        debug!(peer = %self.peer, command = %display_args(args), "sending command");
        self.writer.write_all(&encode_command(args))?;
        self.writer.flush()?;
        let reply = read_response(&mut self.reader)?;
        debug!(peer = %self.peer, reply = %reply, "received reply");
        Ok(reply)
    }

    /// Convenience for whitespace-separated commands such as `"LRANGE list1 0 -1"`.
    pub fn request_line(&mut self, line: &str) -> Result<Response> {
        self.request(&parse_command_line(line))
    }

    /// Reads one pushed frame without sending anything first.
    pub fn read_frame(&mut self) -> Result<Response> {
        let frame = read_response(&mut self.reader)?;
        debug!(peer = %self.peer, frame = %frame, "received push frame");
        Ok(frame)
    }

    /// Issues `AUTH <password>`; the connection counts as authenticated unless
    /// the server answers with an error.
    pub fn authenticate(&mut self, password: &str) -> Result<Response> {
        let reply = self.request(&["AUTH", password])?;
        self.authenticated = !reply.is_error();
        Ok(reply)
    }
}

/// Joins arguments for logs and reports. Control characters are escaped.
pub fn display_args<A: AsRef<[u8]>>(args: &[A]) -> String {
    args.iter()
        .map(|arg| String::from_utf8_lossy(arg.as_ref()).escape_debug().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
