//! Concurrent pub/sub listeners.
//!
//! A listener runs on its own thread with its own [`Connection`]:
//!
//! 1. Connect, authenticate, and subscribe (by channel or pattern)
//! 2. Signal the orchestrator that the subscription is live
//! 3. Read a bounded number of push frames; a read timeout ends this early
//!    and counts as "no message", not as a failure
//! 4. Unsubscribe and hand the collected [`SubscriptionResult`] back
//!
//! The result travels over a one-shot channel and is only observable through
//! [`SubscriberHandle::join`], so the listener is the only writer and the
//! orchestrator reads it only after the listener is done.

use std::fmt;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{HarnessError, Result};
use crate::resp::Response;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMode {
    Channel(String),
    Pattern(String),
}

impl SubscriptionMode {
    fn subscribe_verb(&self) -> &'static str {
        match self {
            SubscriptionMode::Channel(_) => "SUBSCRIBE",
            SubscriptionMode::Pattern(_) => "PSUBSCRIBE",
        }
    }

    fn unsubscribe_verb(&self) -> &'static str {
        match self {
            SubscriptionMode::Channel(_) => "UNSUBSCRIBE",
            SubscriptionMode::Pattern(_) => "PUNSUBSCRIBE",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            SubscriptionMode::Channel(name) | SubscriptionMode::Pattern(name) => name,
        }
    }

    /// Pattern listeners read more frames so they also see pattern-match metadata.
    pub fn default_frame_budget(&self) -> usize {
        match self {
            SubscriptionMode::Channel(_) => 1,
            SubscriptionMode::Pattern(_) => 2,
        }
    }

    fn label(&self) -> String {
        format!("{} {}", self.subscribe_verb(), self.target())
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub addr: SocketAddr,
    pub password: Option<String>,
    pub mode: SubscriptionMode,
    pub max_frames: usize,
    pub read_timeout: Duration,
}

impl SubscriberConfig {
    pub fn new(addr: SocketAddr, mode: SubscriptionMode, read_timeout: Duration) -> Self {
        Self {
            addr,
            password: None,
            max_frames: mode.default_frame_budget(),
            mode,
            read_timeout,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }
}

/// Everything a listener observed, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionResult {
    pub auth_reply: Option<Response>,
    pub confirmation: Option<Response>,
    pub frames: Vec<Response>,
    /// The frame budget was not exhausted because a read timed out.
    pub timed_out: bool,
    pub unsubscribe_reply: Option<Response>,
}

impl SubscriptionResult {
    /// Published messages (`message` and `pmessage` frames) among the received frames.
    pub fn messages(&self) -> Vec<PushMessage> {
        self.frames
            .iter()
            .filter_map(PushMessage::from_frame)
            .filter(|push| matches!(push.kind, PushKind::Message | PushKind::PMessage))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Message,
    PMessage,
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Other(String),
}

impl PushKind {
    fn parse(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "message" => PushKind::Message,
            "pmessage" => PushKind::PMessage,
            "subscribe" => PushKind::Subscribe,
            "unsubscribe" => PushKind::Unsubscribe,
            "psubscribe" => PushKind::PSubscribe,
            "punsubscribe" => PushKind::PUnsubscribe,
            other => PushKind::Other(other.to_string()),
        }
    }
}

/// A pub/sub frame split into its parts.
///
/// `message` frames are `[kind, channel, payload]`; `pmessage` frames carry
/// the matching pattern first: `[kind, pattern, channel, payload]`.
/// Subscription confirmations put the subscription count in `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub kind: PushKind,
    pub pattern: Option<String>,
    pub channel: String,
    pub payload: Response,
}

impl PushMessage {
    pub fn from_frame(frame: &Response) -> Option<Self> {
        let items = frame.as_array()?;
        let kind = PushKind::parse(&items.first()?.as_text()?);
        match items {
            [_, pattern, channel, payload] if kind == PushKind::PMessage => Some(Self {
                pattern: Some(pattern.as_text()?),
                channel: channel.as_text()?,
                payload: payload.clone(),
                kind,
            }),
            [_, channel, payload] if kind != PushKind::PMessage => Some(Self {
                pattern: None,
                channel: channel.as_text()?,
                payload: payload.clone(),
                kind,
            }),
            _ => None,
        }
    }

    pub fn payload_text(&self) -> Option<String> {
        self.payload.as_text()
    }
}

/// `channel: payload`, prefixed with `pattern -> ` for pattern matches.
impl fmt::Display for PushMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pattern) = &self.pattern {
            write!(f, "{pattern} -> ")?;
        }
        match self.payload_text() {
            Some(text) => write!(f, "{}: {}", self.channel, text),
            None => write!(f, "{}: {}", self.channel, self.payload),
        }
    }
}

/// How a listener ended, as seen from [`SubscriberHandle::join`].
#[derive(Debug)]
pub enum JoinOutcome {
    Finished(SubscriptionResult),
    Failed(HarnessError),
    /// Still blocked when the join timeout elapsed. The listener is left to
    /// finish on its own read timeout.
    StillRunning,
    /// The listener thread died without reporting.
    Panicked,
}

pub struct SubscriberHandle {
    label: String,
    subscribed_rx: Receiver<()>,
    done_rx: Receiver<Result<SubscriptionResult>>,
}

impl SubscriberHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Blocks until the subscription is confirmed. Returns `false` if the
    /// listener failed first or `timeout` elapsed.
    pub fn wait_subscribed(&self, timeout: Duration) -> bool {
        self.subscribed_rx.recv_timeout(timeout).is_ok()
    }

    /// Waits up to `timeout` for the listener to finish and takes its result.
    pub fn join(self, timeout: Duration) -> JoinOutcome {
        match self.done_rx.recv_timeout(timeout) {
            Ok(Ok(result)) => JoinOutcome::Finished(result),
            Ok(Err(err)) => JoinOutcome::Failed(err),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    listener = %self.label,
                    ?timeout,
                    "listener still running after join timeout"
                );
                JoinOutcome::StillRunning
            }
            Err(RecvTimeoutError::Disconnected) => JoinOutcome::Panicked,
        }
    }
}

/// Starts a listener thread.
pub fn spawn_subscriber(config: SubscriberConfig) -> Result<SubscriberHandle> {
    let label = config.mode.label();
    let (subscribed_tx, subscribed_rx) = bounded(1);
    let (done_tx, done_rx) = bounded(1);

    let thread_label = label.clone();
    thread::Builder::new()
        .name(format!("subscriber-{}", config.mode.target()))
        .spawn(move || {
            let outcome = run_listener(&config, &subscribed_tx);
            match &outcome {
                Ok(result) => info!(
                    listener = %thread_label,
                    frames = result.frames.len(),
                    timed_out = result.timed_out,
                    "listener finished"
                ),
                Err(err) => warn!(listener = %thread_label, error = %err, "listener failed"),
            }
            // The orchestrator may have stopped waiting; nobody to tell then.
            let _ = done_tx.send(outcome);
        })?;

    Ok(SubscriberHandle {
        label,
        subscribed_rx,
        done_rx,
    })
}

fn run_listener(
    config: &SubscriberConfig,
    subscribed_tx: &Sender<()>,
) -> Result<SubscriptionResult> {
    let mode = &config.mode;
    let mut conn = Connection::connect_timeout(&config.addr, config.read_timeout)?;
    conn.set_read_timeout(Some(config.read_timeout))?;

    let mut result = SubscriptionResult::default();
    if let Some(password) = &config.password {
        result.auth_reply = Some(conn.authenticate(password)?);
    }

    let confirmation = conn.request(&[mode.subscribe_verb(), mode.target()])?;
    let subscribed = !confirmation.is_error();
    result.confirmation = Some(confirmation);
    if !subscribed {
        return Ok(result);
    }
    let _ = subscribed_tx.send(());

    for _ in 0..config.max_frames {
        match conn.read_frame() {
            Ok(frame) => result.frames.push(frame),
            Err(err) if err.is_timeout() => {
                debug!(subscription = mode.target(), "no further frames before read timeout");
                result.timed_out = true;
                break;
            }
            Err(err) => return Err(err),
        }
    }

    match conn.request(&[mode.unsubscribe_verb(), mode.target()]) {
        Ok(reply) => result.unsubscribe_reply = Some(reply),
        Err(err) if err.is_timeout() => {
            debug!(subscription = mode.target(), "unsubscribe went unanswered");
        }
        Err(err) => return Err(err),
    }
    Ok(result)
}
