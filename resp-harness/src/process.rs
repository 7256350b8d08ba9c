//! Launching, probing, and stopping server processes.
//!
//! Each launched server gets two relay threads that forward its stdout and
//! stderr into the log line by line, so a full pipe can never stall it. The
//! relays are detached and end on their own when the pipe closes.
//!
//! [`Cluster`] owns every instance started during a run and stops all of them
//! on [`Cluster::shutdown`], or on drop if that was never reached.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};

/// Interval between TCP connect attempts while waiting for a server.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bound on a single connect attempt during the readiness probe.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between exit checks while waiting out the shutdown grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Master,
    Replica,
    /// A replica started after the master already holds data.
    LateReplica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Master => "master",
            Role::Replica => "replica",
            Role::LateReplica => "late-replica",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Liveness {
    /// Spawned, not yet accepting connections.
    Starting,
    /// Accepted a TCP connection.
    Ready,
    /// Exited on its own before we stopped it.
    Exited,
    /// Stopped by the harness.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ShutdownOutcome {
    /// Exited within the grace period after the stop signal.
    Graceful,
    /// Had to be killed unconditionally.
    Forced,
    AlreadyExited,
    Failed { reason: String },
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownOutcome::Graceful => f.write_str("graceful"),
            ShutdownOutcome::Forced => f.write_str("forced"),
            ShutdownOutcome::AlreadyExited => f.write_str("already-exited"),
            ShutdownOutcome::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub port: u16,
    pub role: Role,
    #[serde(flatten)]
    pub outcome: ShutdownOutcome,
}

/// How to start the server under test: a program plus leading arguments
/// (for example `dotnet` and the path to the server assembly).
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
}

impl ServerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Starts one server with `args` appended after the prefix arguments.
    ///
    /// The child gets its own process group so terminal interrupts aimed at
    /// the harness do not reach it, and so stop signals reach anything it forks.
    pub fn launch(&self, port: u16, role: Role, args: Vec<String>) -> Result<ServerInstance> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = command.spawn().map_err(|source| HarnessError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;

        if let Err(err) = spawn_relays(&mut child, port) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }

        info!(port, %role, pid = child.id(), "launched server");
        Ok(ServerInstance {
            port,
            role,
            args,
            child,
            liveness: Liveness::Starting,
        })
    }
}

fn spawn_relays(child: &mut Child, port: u16) -> io::Result<()> {
    if let Some(stdout) = child.stdout.take() {
        spawn_relay(stdout, port, "stdout")?;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_relay(stderr, port, "stderr")?;
    }
    Ok(())
}

fn spawn_relay<R>(source: R, port: u16, stream: &'static str) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("relay-{port}-{stream}"))
        .spawn(move || {
            for line in BufReader::new(source).split(b'\n') {
                match line {
                    Ok(line) => {
                        let text = String::from_utf8_lossy(&line);
                        info!(target: "server", port, stream, "{}", text.trim_end());
                    }
                    Err(err) => {
                        debug!(port, stream, error = %err, "relay stopped");
                        break;
                    }
                }
            }
        })
        .map(|_| ())
}

/// A running (or finished) server process.
pub struct ServerInstance {
    port: u16,
    role: Role,
    args: Vec<String>,
    child: Child,
    liveness: Liveness,
}

impl ServerInstance {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn mark_ready(&mut self) {
        self.liveness = Liveness::Ready;
    }

    /// Reaps the child if it has exited; returns its exit description.
    pub fn check_exited(&mut self) -> Result<Option<String>> {
        match self.child.try_wait()? {
            Some(status) => {
                if self.liveness != Liveness::Stopped {
                    self.liveness = Liveness::Exited;
                }
                Ok(Some(status.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Sends the graceful stop signal, waits up to `grace`, then kills.
    pub fn shutdown(&mut self, grace: Duration) -> Result<ShutdownOutcome> {
        if self.check_exited()?.is_some() {
            return Ok(ShutdownOutcome::AlreadyExited);
        }

        if let Err(err) = self.request_stop() {
            warn!(port = self.port, error = %err, "failed to signal server, killing");
            return self.force_kill();
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                self.liveness = Liveness::Stopped;
                info!(port = self.port, "server stopped");
                return Ok(ShutdownOutcome::Graceful);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        warn!(port = self.port, ?grace, "server ignored stop signal, killing");
        self.force_kill()
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM)?;
        Ok(())
    }

    // Without a console-control API there is no softer stop to send.
    #[cfg(not(unix))]
    fn request_stop(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn force_kill(&mut self) -> Result<ShutdownOutcome> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            let _ = killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
        }
        if let Err(err) = self.child.kill() {
            // InvalidInput means the child was already reaped.
            if err.kind() != io::ErrorKind::InvalidInput {
                debug!(port = self.port, error = %err, "kill after group kill failed");
            }
        }
        self.child.wait()?;
        self.liveness = Liveness::Stopped;
        Ok(ShutdownOutcome::Forced)
    }
}

/// Polls a bare TCP connect until it succeeds or `timeout` elapses.
///
/// This only proves the port accepts connections; the application behind it
/// may still be initializing.
pub fn wait_ready(host: &str, port: u16, timeout: Duration) -> Result<()> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let deadline = Instant::now() + timeout;
    loop {
        for addr in &addrs {
            if TcpStream::connect_timeout(addr, CONNECT_ATTEMPT_TIMEOUT).is_ok() {
                debug!(%addr, "server accepting connections");
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(HarnessError::Timeout(format!(
                "server not available on {host}:{port} after {timeout:?}"
            )));
        }
        thread::sleep(READY_POLL_INTERVAL);
    }
}

/// Owner of every server launched during one run.
pub struct Cluster {
    server: ServerCommand,
    host: String,
    shutdown_grace: Duration,
    instances: Vec<ServerInstance>,
}

impl Cluster {
    pub fn new(server: ServerCommand, host: impl Into<String>, shutdown_grace: Duration) -> Self {
        Self {
            server,
            host: host.into(),
            shutdown_grace,
            instances: Vec::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn instances(&self) -> &[ServerInstance] {
        &self.instances
    }

    pub fn launch(
        &mut self,
        port: u16,
        role: Role,
        args: Vec<String>,
    ) -> Result<&mut ServerInstance> {
        let instance = self.server.launch(port, role, args)?;
        self.instances.push(instance);
        let last = self.instances.len() - 1;
        Ok(&mut self.instances[last])
    }

    /// Waits for the instance on `port` to accept connections.
    ///
    /// A server that exits while we wait is reported as such instead of as a
    /// plain timeout.
    pub fn wait_ready(&mut self, port: u16, timeout: Duration) -> Result<()> {
        let host = self.host.clone();
        let instance = self
            .instances
            .iter_mut()
            .find(|instance| instance.port == port)
            .ok_or_else(|| {
                HarnessError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no server launched on port {port}"),
                ))
            })?;

        match wait_ready(&host, port, timeout) {
            Ok(()) => {
                instance.mark_ready();
                Ok(())
            }
            Err(err) => match instance.check_exited()? {
                Some(status) => Err(HarnessError::Timeout(format!(
                    "server on port {port} exited before accepting connections ({status})"
                ))),
                None => Err(err),
            },
        }
    }

    /// Stops every instance, in launch order. Failures are reported per
    /// instance and never stop the remaining ones from being shut down.
    pub fn shutdown(&mut self) -> Vec<ShutdownReport> {
        let grace = self.shutdown_grace;
        self.instances
            .drain(..)
            .map(|mut instance| {
                let outcome = instance
                    .shutdown(grace)
                    .unwrap_or_else(|err| ShutdownOutcome::Failed {
                        reason: err.to_string(),
                    });
                ShutdownReport {
                    port: instance.port,
                    role: instance.role,
                    outcome,
                }
            })
            .collect()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !self.instances.is_empty() {
            warn!(
                count = self.instances.len(),
                "cluster dropped with live servers, stopping them"
            );
            let _ = self.shutdown();
        }
    }
}
