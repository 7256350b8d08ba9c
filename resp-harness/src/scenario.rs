//! The scripted replication run.
//!
//! Phases run in order, each a precondition for the next:
//!
//! 1. **startup**: launch master and replica, wait for TCP reachability, settle
//! 2. **auth-gate**: a write before `AUTH` must fail, the same write after must succeed
//! 3. **populate**: strings, streams, lists, a sorted set and pub/sub on the
//!    master, then a snapshot of the master's visible state
//! 4. **propagation**: the running replica must converge to the snapshot
//! 5. **late-join**: a replica started now must catch up to the same snapshot
//!
//! Mismatches are recorded and the run continues. A hard error (framing,
//! lost connection, launch or readiness failure) aborts the current phase and
//! skips the rest. Teardown of every launched server happens regardless.

use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info};

use crate::connection::{Connection, display_args};
use crate::expect::{Check, Expect};
use crate::process::{Cluster, Role, ServerCommand};
use crate::report::{Phase, PhaseRecorder, PhaseReport, Report};
use crate::resp::{Response, parse_command_line};
use crate::subscriber::{
    JoinOutcome, SubscriberConfig, SubscriberHandle, SubscriptionMode, spawn_subscriber,
};

const NEWS_CHANNEL: &str = "news.sports";
const NEWS_PATTERN: &str = "news.*";

/// A value containing protocol delimiters, to prove arguments are length-prefixed.
const BINARY_VALUE: &[u8] = b"line1\r\n$5\r\n*2\r\n:1\r\n\x00end";

/// Read commands whose master replies the replicas must reproduce.
const SNAPSHOT_PROBES: &[&str] = &[
    "GET early_key",
    "GET key",
    "GET binary_key",
    "XRANGE mystream - +",
    "LRANGE list1 0 -1",
    "LRANGE otherlist 0 -1",
    "LRANGE list2 0 -1",
    "ZRANGE leaderboard 0 -1",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Re-issue each replica read until it matches or the window closes.
    Poll,
    /// Sleep the whole window once, then read each key once.
    Fixed,
}

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub server: ServerCommand,
    pub host: String,
    pub master_port: u16,
    pub replica_port: u16,
    pub late_replica_port: u16,
    pub password: String,
    pub ready_timeout: Duration,
    pub startup_settle: Duration,
    pub propagation_window: Duration,
    pub late_join_window: Duration,
    pub listener_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
    pub sync: SyncMode,
}

impl ScenarioConfig {
    pub fn new(server: ServerCommand) -> Self {
        Self {
            server,
            host: "127.0.0.1".to_string(),
            master_port: 6379,
            replica_port: 6380,
            late_replica_port: 6381,
            password: "your_password".to_string(),
            ready_timeout: Duration::from_secs(5),
            startup_settle: Duration::from_millis(1000),
            propagation_window: Duration::from_millis(1500),
            late_join_window: Duration::from_secs(4),
            listener_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            sync: SyncMode::Poll,
        }
    }

    /// Startup arguments for one node: port, persistence file and credential,
    /// plus the master address for replicas.
    pub fn node_args(&self, port: u16, role: Role) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            port.to_string(),
            "--dbfilename".to_string(),
            format!("dump{port}.rdb"),
        ];
        if role != Role::Master {
            args.push("--replicaof".to_string());
            args.push(format!("{} {}", self.host, self.master_port));
        }
        args.push("--authpass".to_string());
        args.push(self.password.clone());
        args
    }

    fn resolve(&self, port: u16) -> Result<SocketAddr> {
        (self.host.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("resolving {}:{port}", self.host))?
            .next()
            .ok_or_else(|| anyhow!("{}:{port} resolved to no address", self.host))
    }
}

/// Re-issues `args` until the reply satisfies `expect` or `deadline` passes.
///
/// Always issues at least once. Returns the last reply and the number of
/// attempts; a reply that never matched is returned as-is for reporting.
pub fn poll_until<A: AsRef<[u8]>>(
    conn: &mut Connection,
    args: &[A],
    expect: &Expect,
    deadline: Instant,
    interval: Duration,
) -> crate::error::Result<(Response, u32)> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let reply = conn.request(args)?;
        let now = Instant::now();
        if expect.matches(&reply) || now >= deadline {
            return Ok((reply, attempts));
        }
        thread::sleep(interval.min(deadline - now));
    }
}

/// A request/response connection to one node, recording a check per command.
struct Node {
    name: String,
    conn: Connection,
}

impl Node {
    fn connect(config: &ScenarioConfig, port: u16, role: Role) -> Result<Self> {
        let addr = config.resolve(port)?;
        let conn = Connection::connect_timeout(&addr, config.request_timeout)
            .with_context(|| format!("connecting to {role} at {addr}"))?;
        conn.set_read_timeout(Some(config.request_timeout))?;
        Ok(Self {
            name: role.to_string(),
            conn,
        })
    }

    fn check<A: AsRef<[u8]>>(
        &mut self,
        recorder: &mut PhaseRecorder,
        args: &[A],
        expect: Expect,
    ) -> Result<Response> {
        let command = display_args(args);
        debug!(node = %self.name, %command, "issuing command");
        let reply = self
            .conn
            .request(args)
            .with_context(|| format!("{command} on {}", self.name))?;
        recorder.record(Check::new(&self.name, command, &expect, &reply));
        Ok(reply)
    }

    fn check_line(
        &mut self,
        recorder: &mut PhaseRecorder,
        line: &str,
        expect: Expect,
    ) -> Result<Response> {
        self.check(recorder, &parse_command_line(line), expect)
    }

    fn authenticate(&mut self, recorder: &mut PhaseRecorder, password: &str) -> Result<()> {
        let reply = self
            .conn
            .authenticate(password)
            .with_context(|| format!("AUTH on {}", self.name))?;
        recorder.record(Check::new(&self.name, "AUTH ***".to_string(), &Expect::Ok, &reply));
        if !self.conn.is_authenticated() {
            recorder.note(format!("{} rejected the credential", self.name));
        }
        Ok(())
    }

    fn converge(
        &mut self,
        recorder: &mut PhaseRecorder,
        probe: &Probe,
        deadline: Instant,
        interval: Duration,
    ) -> Result<()> {
        let (reply, attempts) =
            poll_until(&mut self.conn, &probe.args, &probe.expect, deadline, interval)
                .with_context(|| format!("{} on {}", probe.line, self.name))?;
        recorder.record(
            Check::new(&self.name, probe.line.clone(), &probe.expect, &reply)
                .with_attempts(attempts),
        );
        Ok(())
    }
}

/// One read command and the master's reply to it.
#[derive(Debug, Clone)]
struct Probe {
    line: String,
    args: Vec<String>,
    expect: Expect,
}

impl Probe {
    fn from_master(line: &str, reply: Response) -> Self {
        let args = parse_command_line(line);
        let expect = if args.first().is_some_and(|verb| verb.eq_ignore_ascii_case("XRANGE")) {
            Expect::SameStream(reply)
        } else {
            Expect::Exact(reply)
        };
        Self {
            line: line.to_string(),
            args,
            expect,
        }
    }
}

/// Master writes and their expected replies, in issue order.
fn population_script() -> Vec<(&'static str, Expect)> {
    vec![
        ("SET early_key early_value", Expect::Ok),
        ("GET early_key", Expect::bulk("early_value")),
        ("GET never_written", Expect::Nil),
        ("XADD mystream * field1 value1", Expect::NotError),
        ("XADD mystream * field2 value2", Expect::NotError),
        ("XADD mystream * field3 value3", Expect::NotError),
        (
            "XRANGE mystream - +",
            Expect::StreamFields(vec![
                vec!["field1".into(), "value1".into()],
                vec!["field2".into(), "value2".into()],
                vec!["field3".into(), "value3".into()],
            ]),
        ),
        ("LPUSH list1 a", Expect::Integer(1)),
        ("LPUSH list1 b", Expect::Integer(2)),
        ("LPUSH list1 c", Expect::Integer(3)),
        ("RPUSH list1 d", Expect::Integer(4)),
        ("RPUSH list1 e", Expect::Integer(5)),
        ("RPUSH list1 f", Expect::Integer(6)),
        ("LRANGE list1 0 -1", Expect::list(["c", "b", "a", "d", "e", "f"])),
        ("LPOP list1", Expect::bulk("c")),
        ("RPOP list1", Expect::bulk("f")),
        ("LRANGE list1 0 -1", Expect::list(["b", "a", "d", "e"])),
        // A second key, to show list operations stay isolated per key.
        ("LPUSH otherlist x", Expect::Integer(1)),
        ("RPUSH otherlist y", Expect::Integer(2)),
        ("LPUSH otherlist z", Expect::Integer(3)),
        ("LRANGE otherlist 0 -1", Expect::list(["z", "x", "y"])),
        ("LPOP otherlist", Expect::bulk("z")),
        ("LPOP otherlist", Expect::bulk("x")),
        ("LPOP otherlist", Expect::bulk("y")),
        ("LPOP otherlist", Expect::Nil),
        ("LLEN list1", Expect::Integer(4)),
        ("LLEN otherlist", Expect::Integer(0)),
        ("LLEN nonexistent", Expect::Integer(0)),
        ("LPUSH list2 a", Expect::Integer(1)),
        ("LPUSH list2 b", Expect::Integer(2)),
        ("LPUSH list2 a", Expect::Integer(3)),
        ("LPUSH list2 c", Expect::Integer(4)),
        ("LPUSH list2 a", Expect::Integer(5)),
        ("LRANGE list2 0 -1", Expect::list(["a", "c", "a", "b", "a"])),
        ("LREM list2 2 a", Expect::Integer(2)),
        ("LRANGE list2 0 -1", Expect::list(["c", "b", "a"])),
        ("LREM list2 0 a", Expect::Integer(1)),
        ("LRANGE list2 0 -1", Expect::list(["c", "b"])),
        ("RPUSH list2 a", Expect::Integer(3)),
        ("RPUSH list2 a", Expect::Integer(4)),
        ("LPUSH list2 a", Expect::Integer(5)),
        ("LREM list2 -2 a", Expect::Integer(2)),
        ("LRANGE list2 0 -1", Expect::list(["a", "c", "b"])),
        ("ZADD leaderboard 1 alice 2 bob", Expect::Integer(2)),
        ("ZSCORE leaderboard bob", Expect::bulk("2")),
        ("ZRANGE leaderboard 0 -1", Expect::list(["alice", "bob"])),
    ]
}

struct Scenario<'a> {
    config: &'a ScenarioConfig,
    master: Option<Node>,
    snapshot: Vec<Probe>,
}

/// Runs every phase and tears the cluster down. Never panics on server
/// misbehavior; everything observed ends up in the returned [`Report`].
pub fn run(config: &ScenarioConfig) -> Report {
    let mut cluster = Cluster::new(config.server.clone(), &config.host, config.shutdown_grace);
    let mut scenario = Scenario {
        config,
        master: None,
        snapshot: Vec::new(),
    };
    let mut report = Report::default();

    let mut phases = Phase::SEQUENCE.into_iter();
    for phase in phases.by_ref() {
        info!(phase = phase.name(), "phase started");
        let mut recorder = PhaseRecorder::new(phase);
        match scenario.run_phase(&mut cluster, &mut recorder) {
            Ok(()) => {
                let phase_report = recorder.finish();
                info!(phase = phase.name(), status = ?phase_report.status, "phase finished");
                report.push(phase_report);
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(phase = phase.name(), error = %message, "phase aborted");
                report.push(recorder.abort(message));
                break;
            }
        }
    }
    for phase in phases {
        report.push(PhaseReport::skipped(phase));
    }

    drop(scenario);
    info!(phase = Phase::Teardown.name(), "stopping servers");
    report.record_teardown(cluster.shutdown());
    report
}

impl Scenario<'_> {
    fn run_phase(&mut self, cluster: &mut Cluster, recorder: &mut PhaseRecorder) -> Result<()> {
        match recorder.phase() {
            Phase::Startup => self.startup(cluster, recorder),
            Phase::AuthGate => self.auth_gate(recorder),
            Phase::Populate => self.populate(recorder),
            Phase::Propagation => self.propagation(recorder),
            Phase::LateJoin => self.late_join(cluster, recorder),
            Phase::Teardown => Ok(()),
        }
    }

    fn startup(&mut self, cluster: &mut Cluster, recorder: &mut PhaseRecorder) -> Result<()> {
        let config = self.config;
        let nodes = [
            (config.master_port, Role::Master),
            (config.replica_port, Role::Replica),
        ];
        for (port, role) in nodes {
            let instance = cluster
                .launch(port, role, config.node_args(port, role))
                .with_context(|| format!("launching {role} on port {port}"))?;
            recorder.note(format!("launched {role} on port {port} (pid {})", instance.pid()));
        }
        for (port, role) in nodes {
            self.await_node(cluster, recorder, port, role)?;
        }
        thread::sleep(config.startup_settle);
        Ok(())
    }

    fn await_node(
        &self,
        cluster: &mut Cluster,
        recorder: &mut PhaseRecorder,
        port: u16,
        role: Role,
    ) -> Result<()> {
        cluster
            .wait_ready(port, self.config.ready_timeout)
            .with_context(|| format!("waiting for {role} on port {port}"))?;
        recorder.record(Check::observation(
            &role.to_string(),
            format!("connect {}:{port}", self.config.host),
            "accepting connections",
            "accepting connections",
            true,
        ));
        Ok(())
    }

    fn auth_gate(&mut self, recorder: &mut PhaseRecorder) -> Result<()> {
        let config = self.config;
        let mut master = Node::connect(config, config.master_port, Role::Master)?;
        master.check_line(recorder, "SET key early_value", Expect::Error)?;
        master.authenticate(recorder, &config.password)?;
        // The rejected write must have left no trace.
        master.check_line(recorder, "GET key", Expect::Nil)?;
        master.check_line(recorder, "SET key early_value", Expect::Ok)?;
        self.master = Some(master);
        Ok(())
    }

    fn populate(&mut self, recorder: &mut PhaseRecorder) -> Result<()> {
        let mut master = self
            .master
            .take()
            .ok_or_else(|| anyhow!("no authenticated master connection"))?;

        for (line, expect) in population_script() {
            master.check_line(recorder, line, expect)?;
        }
        master.check(recorder, &[&b"SET"[..], &b"binary_key"[..], BINARY_VALUE], Expect::Ok)?;
        master.check(recorder, &["GET", "binary_key"], Expect::bulk(BINARY_VALUE))?;

        self.publish_and_listen(&mut master, recorder)?;

        self.snapshot.clear();
        for line in SNAPSHOT_PROBES {
            let reply = master.check_line(recorder, line, Expect::NotError)?;
            self.snapshot.push(Probe::from_master(line, reply));
        }
        recorder.note(format!("recorded {} master snapshot probes", self.snapshot.len()));
        Ok(())
    }

    /// Two listeners on the master (exact channel and pattern) must each see
    /// what is published while they are subscribed.
    fn publish_and_listen(&self, master: &mut Node, recorder: &mut PhaseRecorder) -> Result<()> {
        let config = self.config;
        let addr = config.resolve(config.master_port)?;
        let listener = |mode| {
            SubscriberConfig::new(addr, mode, config.listener_timeout)
                .with_password(config.password.as_str())
        };

        let channel = spawn_subscriber(listener(SubscriptionMode::Channel(NEWS_CHANNEL.into())))
            .context("spawning channel listener")?;
        let pattern = spawn_subscriber(listener(SubscriptionMode::Pattern(NEWS_PATTERN.into())))
            .context("spawning pattern listener")?;

        for handle in [&channel, &pattern] {
            if !handle.wait_subscribed(config.listener_timeout) {
                recorder.record(Check::observation(
                    &master.name,
                    handle.label(),
                    "subscription confirmed",
                    "no confirmation before timeout",
                    false,
                ));
            }
        }

        master.check_line(recorder, "PUBLISH news.sports hello", Expect::NotError)?;
        master.check_line(recorder, "PUBLISH news.weather sunny", Expect::NotError)?;

        let join_timeout = config.listener_timeout * 2;
        record_listener(recorder, &master.name, channel, join_timeout, &["news.sports: hello"]);
        record_listener(
            recorder,
            &master.name,
            pattern,
            join_timeout,
            &["news.* -> news.sports: hello", "news.* -> news.weather: sunny"],
        );
        Ok(())
    }

    fn propagation(&mut self, recorder: &mut PhaseRecorder) -> Result<()> {
        let config = self.config;
        if config.sync == SyncMode::Fixed {
            thread::sleep(config.propagation_window);
        }
        let mut replica = Node::connect(config, config.replica_port, Role::Replica)?;
        self.verify_replica(&mut replica, recorder, config.propagation_window)
    }

    fn late_join(&mut self, cluster: &mut Cluster, recorder: &mut PhaseRecorder) -> Result<()> {
        let config = self.config;
        let port = config.late_replica_port;
        let role = Role::LateReplica;
        let instance = cluster
            .launch(port, role, config.node_args(port, role))
            .with_context(|| format!("launching {role} on port {port}"))?;
        recorder.note(format!("launched {role} on port {port} (pid {})", instance.pid()));
        self.await_node(cluster, recorder, port, role)?;

        let settle = match config.sync {
            SyncMode::Fixed => config.late_join_window,
            SyncMode::Poll => config.startup_settle,
        };
        thread::sleep(settle);

        let mut late = Node::connect(config, port, role)?;
        self.verify_replica(&mut late, recorder, config.late_join_window)?;
        late.check_line(recorder, "GET none", Expect::Nil)?;
        Ok(())
    }

    /// The replica must enforce the credential on its own, then serve every
    /// snapshot probe with the master's reply.
    fn verify_replica(
        &self,
        replica: &mut Node,
        recorder: &mut PhaseRecorder,
        window: Duration,
    ) -> Result<()> {
        let config = self.config;
        replica.check_line(recorder, "GET early_key", Expect::Error)?;
        replica.authenticate(recorder, &config.password)?;

        let deadline = match config.sync {
            SyncMode::Poll => Instant::now() + window,
            SyncMode::Fixed => Instant::now(),
        };
        for probe in &self.snapshot {
            replica.converge(recorder, probe, deadline, config.poll_interval)?;
        }
        Ok(())
    }
}

fn record_listener(
    recorder: &mut PhaseRecorder,
    node: &str,
    handle: SubscriberHandle,
    timeout: Duration,
    expected: &[&str],
) {
    let label = handle.label().to_string();
    let expected = expected.join(", ");
    let (observed, passed) = match handle.join(timeout) {
        JoinOutcome::Finished(result) => {
            if result.timed_out {
                recorder.note(format!("{label}: read timed out before the frame budget was used"));
            }
            let observed = result
                .messages()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let passed = observed == expected;
            (observed, passed)
        }
        JoinOutcome::Failed(err) => (format!("listener failed: {err}"), false),
        JoinOutcome::StillRunning => ("listener still running at join timeout".to_string(), false),
        JoinOutcome::Panicked => ("listener exited without a result".to_string(), false),
    };
    recorder.record(Check::observation(node, label, expected, observed, passed));
}
