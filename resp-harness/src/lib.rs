//! Black-box conformance and replication harness for RESP key-value servers.
//!
//! The harness does not implement a store. It launches one master and two
//! replicas of the server under test as child processes, drives them over
//! the wire protocol, and reports what each node returned.
//!
//! # Architecture
//!
//! Everything runs on plain threads with blocking sockets:
//!
//! - **Main thread**: the scenario driver, one request/response connection per node
//! - **Listener threads**: one per pub/sub subscription, each with its own connection,
//!   handing its result back over a one-shot crossbeam channel
//! - **Relay threads**: two per launched server, forwarding stdout/stderr into the log
//!
//! No connection is ever read by two threads, so nothing needs a lock.
//!
//! # Modules
//!
//! - [`resp`]: command encoding and reply decoding
//! - [`connection`]: one blocking TCP connection to one server
//! - [`process`]: launching, readiness probing and shutdown of server processes
//! - [`subscriber`]: concurrent pub/sub listeners
//! - [`expect`]: expected replies and recorded checks
//! - [`report`]: per-phase outcomes, rendered as text or JSON
//! - [`scenario`]: the phase sequence from startup to teardown
//! - [`cli`]: command-line configuration
//! - [`error`]: the typed error shared by the layers above

pub mod cli;
pub mod connection;
pub mod error;
pub mod expect;
pub mod process;
pub mod report;
pub mod resp;
pub mod scenario;
pub mod subscriber;

pub use connection::Connection;
pub use error::{HarnessError, Result};
pub use resp::Response;
