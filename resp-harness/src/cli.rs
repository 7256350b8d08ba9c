use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::process::ServerCommand;
use crate::scenario::{ScenarioConfig, SyncMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Program that starts one server instance (e.g. `dotnet`).
    #[arg(long)]
    pub server: PathBuf,

    /// Argument placed before the per-node arguments (e.g. the server dll). Repeatable.
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    pub server_args: Vec<String>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 6379)]
    pub master_port: u16,

    #[arg(long, default_value_t = 6380)]
    pub replica_port: u16,

    /// Port of the replica started after the master holds data.
    #[arg(long, default_value_t = 6381)]
    pub late_replica_port: u16,

    /// Credential every node is started with.
    #[arg(long, default_value = "your_password")]
    pub password: String,

    /// How long each node may take to accept TCP connections.
    #[arg(long, default_value_t = 5000)]
    pub ready_timeout_ms: u64,

    /// Pause after readiness before the first protocol traffic.
    #[arg(long, default_value_t = 1000)]
    pub startup_settle_ms: u64,

    #[arg(long, default_value_t = 1500)]
    pub propagation_window_ms: u64,

    #[arg(long, default_value_t = 4000)]
    pub late_join_window_ms: u64,

    /// Read timeout for pub/sub listeners.
    #[arg(long, default_value_t = 3000)]
    pub listener_timeout_ms: u64,

    /// Read timeout for ordinary commands.
    #[arg(long, default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// How long a server may take to exit after the stop signal before it is killed.
    #[arg(long, default_value_t = 5000)]
    pub shutdown_grace_ms: u64,

    /// Delay between re-reads while waiting for a replica to converge.
    #[arg(long, default_value_t = 100)]
    pub poll_interval_ms: u64,

    #[arg(long, value_enum, default_value_t = SyncArg::Poll)]
    pub sync: SyncArg,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    pub format: Format,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncArg {
    /// Re-read until the replica matches or the window closes.
    Poll,
    /// Sleep the full window, then read once.
    Fixed,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

impl Cli {
    pub fn scenario_config(&self) -> ScenarioConfig {
        let server = ServerCommand::new(self.server.clone())
            .with_prefix_args(self.server_args.iter().cloned());
        ScenarioConfig {
            server,
            host: self.host.clone(),
            master_port: self.master_port,
            replica_port: self.replica_port,
            late_replica_port: self.late_replica_port,
            password: self.password.clone(),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            startup_settle: Duration::from_millis(self.startup_settle_ms),
            propagation_window: Duration::from_millis(self.propagation_window_ms),
            late_join_window: Duration::from_millis(self.late_join_window_ms),
            listener_timeout: Duration::from_millis(self.listener_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            sync: match self.sync {
                SyncArg::Poll => SyncMode::Poll,
                SyncArg::Fixed => SyncMode::Fixed,
            },
        }
    }
}
