//! Append-only audit log.
//!
//! One JSON object per line. Every authorization produces exactly one
//! `authorization` line; approval resolutions and quarantine releases get
//! their own event types. Callers only ever see a verdict and deny reason;
//! triggered flags are recorded here and nowhere else.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::accelerator::EvaluationPath;
use crate::descriptor::CommandId;
use crate::engine::{DenyReason, Verdict};
use crate::risk::{RiskLevel, TriggeredFlags};

/// Audit event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// Outcome of one authorization request.
    Authorization,
    /// An approver resolved a pending request.
    ApprovalResolved,
    /// An administrator released a quarantined caller.
    QuarantineReleased,
}

/// Body of an `authorization` event.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRecord {
    /// Who asked.
    pub caller_id: String,
    /// What they asked to run.
    pub command_hash: CommandId,
    /// Final verdict (`allow`, `deny`, `quarantine`).
    #[serde(serialize_with = "verdict_name")]
    pub verdict: Verdict,
    /// Reason code for denials.
    pub deny_reason: Option<DenyReason>,
    /// Evaluated risk, when the command was evaluated.
    pub risk_level: Option<RiskLevel>,
    /// Which evaluator answered.
    pub evaluation_path: EvaluationPath,
    /// End-to-end latency in microseconds.
    pub latency_us: u64,
    /// Contributors to the risk level.
    pub triggered_flags: TriggeredFlags,
    /// Allowed but worth a second look.
    pub flagged: bool,
    /// Approval token, when the request went through the approval queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<Uuid>,
}

/// Body of an `approval_resolved` event.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRecord {
    /// Resolved token.
    pub token: Uuid,
    /// Who asked.
    pub caller_id: String,
    /// What they asked to run.
    pub command_hash: CommandId,
    /// Approver's decision.
    pub approved: bool,
    /// Who decided.
    pub resolved_by: String,
}

/// Body of a `quarantine_released` event.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseRecord {
    /// Released caller.
    pub caller_id: String,
    /// Who released it.
    pub released_by: String,
    /// Quarantine verdicts during the closed episode.
    pub strikes: u32,
    /// Highest risk seen during the episode.
    pub risk_level: RiskLevel,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    timestamp: DateTime<Utc>,
    event: AuditEvent,
    #[serde(flatten)]
    body: &'a T,
}

/// Audit logger writing JSON lines to an append-only sink.
pub struct AuditLogger {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}

impl AuditLogger {
    /// Append to the file at `path`, creating it and its directory if needed.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Log to an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Logger that discards everything.
    pub fn discard() -> Self {
        Self::from_writer(Box::new(std::io::sink()))
    }

    /// Record one authorization outcome.
    pub fn record_authorization(&self, record: &AuthorizationRecord) -> anyhow::Result<()> {
        self.write_entry(AuditEvent::Authorization, record)
    }

    /// Record an approver's decision.
    pub fn record_approval(&self, record: &ApprovalRecord) -> anyhow::Result<()> {
        self.write_entry(AuditEvent::ApprovalResolved, record)
    }

    /// Record a quarantine release.
    pub fn record_release(&self, record: &ReleaseRecord) -> anyhow::Result<()> {
        self.write_entry(AuditEvent::QuarantineReleased, record)
    }

    fn write_entry<T: Serialize>(&self, event: AuditEvent, body: &T) -> anyhow::Result<()> {
        let entry = Envelope {
            timestamp: Utc::now(),
            event,
            body,
        };
        let line = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

fn verdict_name<S: serde::Serializer>(verdict: &Verdict, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(verdict.as_str())
}
