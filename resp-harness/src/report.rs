//! Per-phase outcomes of a scenario run.

use std::fmt::Write as _;

use serde::Serialize;

use crate::expect::Check;
use crate::process::{ShutdownOutcome, ShutdownReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Startup,
    AuthGate,
    Populate,
    Propagation,
    LateJoin,
    Teardown,
}

impl Phase {
    /// Phases before teardown, in execution order.
    pub const SEQUENCE: [Phase; 5] = [
        Phase::Startup,
        Phase::AuthGate,
        Phase::Populate,
        Phase::Propagation,
        Phase::LateJoin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Startup => "startup",
            Phase::AuthGate => "auth-gate",
            Phase::Populate => "populate",
            Phase::Propagation => "propagation",
            Phase::LateJoin => "late-join",
            Phase::Teardown => "teardown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PhaseStatus {
    Passed,
    /// Ran to completion with at least one failed check.
    Failed,
    /// Stopped by a hard error; later phases were skipped.
    Aborted { error: String },
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    #[serde(flatten)]
    pub status: PhaseStatus,
    pub checks: Vec<Check>,
    pub notes: Vec<String>,
}

impl PhaseReport {
    pub fn skipped(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped,
            checks: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

/// Collects checks and notes while a phase runs.
#[derive(Debug)]
pub struct PhaseRecorder {
    phase: Phase,
    checks: Vec<Check>,
    notes: Vec<String>,
}

impl PhaseRecorder {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            checks: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn record(&mut self, check: Check) {
        if check.passed {
            tracing::info!(
                phase = self.phase.name(),
                node = %check.node,
                command = %check.command,
                "check passed"
            );
        } else {
            tracing::warn!(
                phase = self.phase.name(),
                node = %check.node,
                command = %check.command,
                expected = %check.expected,
                observed = %check.observed,
                "check failed"
            );
        }
        self.checks.push(check);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        tracing::info!(phase = self.phase.name(), "{note}");
        self.notes.push(note);
    }

    pub fn finish(self) -> PhaseReport {
        let status = if self.checks.iter().all(|check| check.passed) {
            PhaseStatus::Passed
        } else {
            PhaseStatus::Failed
        };
        self.into_report(status)
    }

    /// Keeps the checks gathered before the hard error.
    pub fn abort(self, error: impl Into<String>) -> PhaseReport {
        self.into_report(PhaseStatus::Aborted {
            error: error.into(),
        })
    }

    fn into_report(self, status: PhaseStatus) -> PhaseReport {
        PhaseReport {
            phase: self.phase,
            status,
            checks: self.checks,
            notes: self.notes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub phases: Vec<PhaseReport>,
    pub shutdown: Vec<ShutdownReport>,
}

impl Report {
    pub fn push(&mut self, phase: PhaseReport) {
        self.phases.push(phase);
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|report| report.phase == phase)
    }

    /// Every phase passed, teardown included.
    pub fn success(&self) -> bool {
        !self.phases.is_empty()
            && self
                .phases
                .iter()
                .all(|phase| phase.status == PhaseStatus::Passed)
    }

    /// Records instance shutdowns as the teardown phase.
    pub fn record_teardown(&mut self, shutdown: Vec<ShutdownReport>) {
        let mut recorder = PhaseRecorder::new(Phase::Teardown);
        for report in &shutdown {
            let passed = !matches!(report.outcome, ShutdownOutcome::Failed { .. });
            recorder.record(Check::observation(
                &format!("{}:{}", report.role, report.port),
                "shutdown",
                "stopped",
                report.outcome.to_string(),
                passed,
            ));
        }
        self.push(recorder.finish());
        self.shutdown = shutdown;
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for phase in &self.phases {
            let status = match &phase.status {
                PhaseStatus::Passed => "PASSED".to_string(),
                PhaseStatus::Failed => "FAILED".to_string(),
                PhaseStatus::Aborted { error } => format!("ABORTED ({error})"),
                PhaseStatus::Skipped => "SKIPPED".to_string(),
            };
            let passed = phase.checks.iter().filter(|check| check.passed).count();
            let _ = writeln!(
                out,
                "[{}] {} - {}/{} checks passed",
                phase.phase.name(),
                status,
                passed,
                phase.checks.len()
            );
            for note in &phase.notes {
                let _ = writeln!(out, "    note: {note}");
            }
            for check in phase.failed_checks() {
                let _ = writeln!(out, "    mismatch on {}: {}", check.node, check.command);
                let _ = writeln!(out, "      expected: {}", indent(&check.expected));
                let _ = writeln!(out, "      observed: {}", indent(&check.observed));
            }
        }
        let verdict = if self.success() { "PASSED" } else { "FAILED" };
        let _ = write!(out, "overall: {verdict}");
        out
    }
}

fn indent(text: &str) -> String {
    text.replace('\n', "\n                ")
}
