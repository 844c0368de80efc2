//! Enforcement gateway: the boundary a host calls before permitting an
//! operation.
//!
//! Flow per request: quarantine check, decision, enforcement, one audit
//! line. Every failure inside the gateway turns into a denial; nothing
//! escapes as an error or a panic.

use std::sync::Arc;

use anyhow::Context;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::accelerator::{EvaluationPath, SoftwareAccelerator};
use crate::approval::{
    ApprovalError, ApprovalOutcome, ApprovalQueue, ApprovalRequest, PendingApproval,
};
use crate::audit::{ApprovalRecord, AuditLogger, AuthorizationRecord, ReleaseRecord};
use crate::config::GuardConfig;
use crate::descriptor::CommandId;
use crate::engine::{Decision, DecisionEngine, DenyReason, Verdict};
use crate::quarantine::{
    QuarantineError, QuarantineRecord, QuarantineStore, SqliteQuarantineStore,
};
use crate::registry::CapabilityRegistry;
use crate::risk::{Caller, InvocationContext, RiskEvaluator, RiskLevel, TriggeredFlags};

/// Result of a deferred authorization.
#[derive(Debug)]
pub enum Authorization {
    /// Final verdict, already audited.
    Decided(Verdict),
    /// Waiting for an approver.
    Pending(PendingAuthorization),
}

impl Authorization {
    /// Final verdict, waiting for the approver if needed.
    pub async fn resolve(self) -> Verdict {
        match self {
            Self::Decided(verdict) => verdict,
            Self::Pending(pending) => pending.wait().await,
        }
    }
}

/// Shared entry point for every authorization.
pub struct EnforcementGateway {
    engine: DecisionEngine,
    quarantine: Arc<dyn QuarantineStore>,
    approvals: Arc<ApprovalQueue>,
    audit: Arc<AuditLogger>,
    fail_open: Vec<RiskLevel>,
}

impl std::fmt::Debug for EnforcementGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcementGateway")
            .field("engine", &self.engine)
            .field("approvals", &self.approvals)
            .field("fail_open", &self.fail_open)
            .finish_non_exhaustive()
    }
}

impl EnforcementGateway {
    /// Gateway with fail-closed approval timeouts.
    pub fn new(
        engine: DecisionEngine,
        quarantine: Arc<dyn QuarantineStore>,
        approvals: Arc<ApprovalQueue>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            engine,
            quarantine,
            approvals,
            audit,
            fail_open: Vec::new(),
        }
    }

    /// Assemble the production stack described by `config`: registry (with
    /// the descriptor database, if any), evaluator, optional software
    /// accelerator, SQLite quarantine store, approval queue and audit log.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured file cannot be opened.
    pub async fn from_config(config: &GuardConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(CapabilityRegistry::new(config.registry.cache_capacity));
        if let Some(db) = &config.registry.descriptor_db {
            let report = registry.load_database(db)?;
            if !report.failures.is_empty() {
                warn!(
                    path = %db.display(),
                    rejected = report.failures.len(),
                    "descriptor database contains rejected records"
                );
            }
        }

        let evaluator = Arc::new(RiskEvaluator::new(Arc::new(config.policy.risk.clone())));
        let mut engine = DecisionEngine::new(
            registry,
            Arc::clone(&evaluator),
            config.policy.verdicts,
        );
        if config.accelerator.enabled {
            engine = engine.with_accelerator(
                Arc::new(SoftwareAccelerator::new(evaluator)),
                config.accelerator.timeout(),
            );
        }

        let quarantine_db = config.paths.quarantine_db()?;
        let quarantine = SqliteQuarantineStore::open(&quarantine_db).await?;

        let audit_log = config.paths.audit_log()?;
        let audit = AuditLogger::new(&audit_log)
            .with_context(|| format!("failed to open audit log {}", audit_log.display()))?;

        Ok(Self::new(
            engine,
            Arc::new(quarantine),
            Arc::new(ApprovalQueue::new(config.approval.timeout())),
            Arc::new(audit),
        )
        .with_fail_open(&config.policy.fail_open))
    }

    /// Allow requests at these risk levels when their approval times out.
    #[must_use]
    pub fn with_fail_open(mut self, levels: &[RiskLevel]) -> Self {
        for level in levels {
            warn!(risk = %level, "approval timeouts at this risk level will allow the request");
        }
        self.fail_open = levels.to_vec();
        self
    }

    /// Decision engine in use.
    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Approval queue, for approver integrations.
    pub fn approvals(&self) -> &Arc<ApprovalQueue> {
        &self.approvals
    }

    /// Quarantine store in use.
    pub fn quarantine(&self) -> &Arc<dyn QuarantineStore> {
        &self.quarantine
    }

    /// Authorize and wait for any approval.
    pub async fn authorize(
        &self,
        command: impl Into<CommandId>,
        args: &[String],
        caller: &Caller,
    ) -> Verdict {
        self.authorize_deferred(command, args, caller)
            .await
            .resolve()
            .await
    }

    /// Authorize, returning a pending handle instead of waiting for approval.
    pub async fn authorize_deferred(
        &self,
        command: impl Into<CommandId>,
        args: &[String],
        caller: &Caller,
    ) -> Authorization {
        let ctx = InvocationContext::new(caller.clone(), command.into(), args.to_vec());
        self.authorize_invocation(ctx).await
    }

    /// Authorize a fully built context.
    pub async fn authorize_invocation(&self, ctx: InvocationContext) -> Authorization {
        let started = Instant::now();

        match self.quarantine.get(&ctx.caller.id).await {
            Ok(None) => {}
            Ok(Some(record)) => {
                info!(
                    caller = %ctx.caller.id,
                    command_hash = %ctx.command,
                    strikes = record.strikes,
                    "quarantined caller denied"
                );
                return self.decided(
                    &ctx,
                    Verdict::Deny(DenyReason::Quarantined),
                    &short_circuit(EvaluationPath::QuarantineShortCircuit),
                    started,
                );
            }
            Err(error) => {
                warn!(caller = %ctx.caller.id, error = %error, "quarantine lookup failed");
                return self.decided(
                    &ctx,
                    Verdict::Deny(DenyReason::EvaluationFailed),
                    &short_circuit(EvaluationPath::Unresolved),
                    started,
                );
            }
        }

        let decision = self.engine.decide(&ctx).await;

        match decision.verdict {
            Verdict::Allow | Verdict::Deny(_) => {
                self.decided(&ctx, decision.verdict, &decision, started)
            }
            Verdict::Quarantine => {
                let verdict = self.enter_quarantine(&ctx, &decision).await;
                self.decided(&ctx, verdict, &decision, started)
            }
            Verdict::RequireApproval => {
                let risk = decision.risk.unwrap_or(RiskLevel::Critical);
                let approval = self
                    .approvals
                    .submit(&ctx.caller.id, ctx.command, &ctx.args, risk);
                let mut draft = audit_record(&ctx, Verdict::RequireApproval, &decision, started);
                draft.approval_token = Some(approval.token());
                Authorization::Pending(PendingAuthorization {
                    approval: Some(approval),
                    draft,
                    started,
                    fail_open: self.fail_open.contains(&risk),
                    quarantine: Arc::clone(&self.quarantine),
                    audit: Arc::clone(&self.audit),
                    finished: false,
                })
            }
        }
    }

    /// Release an active quarantine.
    pub async fn release(
        &self,
        caller_id: &str,
        released_by: &str,
    ) -> Result<QuarantineRecord, QuarantineError> {
        let record = self.quarantine.release(caller_id, released_by).await?;
        info!(
            caller = %caller_id,
            released_by = %released_by,
            strikes = record.strikes,
            "caller released from quarantine"
        );
        let audited = self.audit.record_release(&ReleaseRecord {
            caller_id: record.caller_id.clone(),
            released_by: released_by.to_owned(),
            strikes: record.strikes,
            risk_level: record.risk_level,
        });
        if let Err(error) = audited {
            warn!(error = %error, "failed to write audit record");
        }
        Ok(record)
    }

    /// Deliver an approver's decision for a pending request.
    pub fn resolve_approval(
        &self,
        token: Uuid,
        approved: bool,
        resolved_by: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = self.approvals.resolve(token, approved)?;
        let audited = self.audit.record_approval(&ApprovalRecord {
            token,
            caller_id: request.caller_id.clone(),
            command_hash: request.command,
            approved,
            resolved_by: resolved_by.to_owned(),
        });
        if let Err(error) = audited {
            warn!(error = %error, "failed to write audit record");
        }
        Ok(request)
    }

    /// Withdraw every pending approval, e.g. on shutdown.
    pub fn shutdown(&self) -> usize {
        self.approvals.cancel_all()
    }

    async fn enter_quarantine(&self, ctx: &InvocationContext, decision: &Decision) -> Verdict {
        let risk = decision.risk.unwrap_or(RiskLevel::Critical);
        let reason = format!("{risk} risk invoking {}", ctx.command);
        match self.quarantine.upsert(&ctx.caller.id, &reason, risk).await {
            Ok(record) => {
                info!(
                    caller = %ctx.caller.id,
                    command_hash = %ctx.command,
                    risk = %record.risk_level,
                    strikes = record.strikes,
                    "caller quarantined"
                );
                Verdict::Quarantine
            }
            Err(error) => {
                warn!(caller = %ctx.caller.id, error = %error, "failed to persist quarantine");
                Verdict::Deny(DenyReason::EvaluationFailed)
            }
        }
    }

    fn decided(
        &self,
        ctx: &InvocationContext,
        verdict: Verdict,
        decision: &Decision,
        started: Instant,
    ) -> Authorization {
        write_audit(&self.audit, &audit_record(ctx, verdict, decision, started));
        Authorization::Decided(verdict)
    }
}

/// A request held for approval.
///
/// Exactly one audit line is written for it: when [`wait`](Self::wait)
/// returns, or when the handle is dropped first (as `approval_cancelled`).
/// A caller quarantined while the request waited is denied even if the
/// approver said yes.
pub struct PendingAuthorization {
    approval: Option<PendingApproval>,
    draft: AuthorizationRecord,
    started: Instant,
    fail_open: bool,
    quarantine: Arc<dyn QuarantineStore>,
    audit: Arc<AuditLogger>,
    finished: bool,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("approval", &self.approval)
            .field("draft", &self.draft)
            .field("fail_open", &self.fail_open)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl PendingAuthorization {
    /// Token an approver resolves.
    pub fn token(&self) -> Option<Uuid> {
        self.approval.as_ref().map(PendingApproval::token)
    }

    /// Risk level that triggered the approval.
    pub fn risk(&self) -> Option<RiskLevel> {
        self.draft.risk_level
    }

    /// Wait for the approver and return the final verdict.
    pub async fn wait(mut self) -> Verdict {
        let Some(approval) = self.approval.take() else {
            return self.finish(Verdict::Deny(DenyReason::EvaluationFailed));
        };
        let verdict = match approval.wait().await {
            ApprovalOutcome::Approved => Verdict::Allow,
            ApprovalOutcome::Denied => Verdict::Deny(DenyReason::ApprovalDenied),
            ApprovalOutcome::Cancelled => Verdict::Deny(DenyReason::ApprovalCancelled),
            ApprovalOutcome::TimedOut if self.fail_open => {
                warn!(
                    caller = %self.draft.caller_id,
                    command_hash = %self.draft.command_hash,
                    "approval timed out, allowing under fail-open policy"
                );
                Verdict::Allow
            }
            ApprovalOutcome::TimedOut => Verdict::Deny(DenyReason::ApprovalTimeout),
        };
        let verdict = if verdict.is_allow() {
            self.recheck_quarantine().await
        } else {
            verdict
        };
        self.finish(verdict)
    }

    async fn recheck_quarantine(&self) -> Verdict {
        let caller = &self.draft.caller_id;
        match self.quarantine.get(caller).await {
            Ok(None) => Verdict::Allow,
            Ok(Some(record)) => {
                info!(
                    caller = %caller,
                    command_hash = %self.draft.command_hash,
                    strikes = record.strikes,
                    "caller quarantined while awaiting approval"
                );
                Verdict::Deny(DenyReason::Quarantined)
            }
            Err(error) => {
                warn!(caller = %caller, error = %error, "quarantine lookup failed");
                Verdict::Deny(DenyReason::EvaluationFailed)
            }
        }
    }

    fn finish(&mut self, verdict: Verdict) -> Verdict {
        self.finished = true;
        self.draft.verdict = verdict;
        self.draft.deny_reason = verdict.deny_reason();
        self.draft.latency_us = micros(self.started);
        write_audit(&self.audit, &self.draft);
        verdict
    }
}

impl Drop for PendingAuthorization {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Verdict::Deny(DenyReason::ApprovalCancelled));
        }
    }
}

fn short_circuit(path: EvaluationPath) -> Decision {
    Decision {
        verdict: Verdict::Deny(DenyReason::EvaluationFailed),
        risk: None,
        triggered: TriggeredFlags::default(),
        path,
        flagged: false,
        latency: std::time::Duration::ZERO,
    }
}

fn audit_record(
    ctx: &InvocationContext,
    verdict: Verdict,
    decision: &Decision,
    started: Instant,
) -> AuthorizationRecord {
    AuthorizationRecord {
        caller_id: ctx.caller.id.clone(),
        command_hash: ctx.command,
        verdict,
        deny_reason: verdict.deny_reason(),
        risk_level: decision.risk,
        evaluation_path: decision.path,
        latency_us: micros(started),
        triggered_flags: decision.triggered,
        flagged: decision.flagged && verdict.is_allow(),
        approval_token: None,
    }
}

fn micros(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn write_audit(audit: &AuditLogger, record: &AuthorizationRecord) {
    if let Err(error) = audit.record_authorization(record) {
        warn!(
            caller = %record.caller_id,
            command_hash = %record.command_hash,
            error = %error,
            "failed to write audit record"
        );
    }
}
