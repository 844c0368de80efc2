//! Decision engine: risk level plus policy to a verdict.
//!
//! Owns accelerator dispatch. The accelerator is tried first under a hard
//! deadline; anything other than a timely answer falls back to the
//! in-process evaluator. Both paths feed the same verdict table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::accelerator::{Accelerator, EvaluationPath};
use crate::descriptor::{CommandId, Descriptor, RegistryEntry};
use crate::registry::{CapabilityRegistry, RegistryError};
use crate::risk::{Evaluation, InvocationContext, RiskEvaluator, RiskLevel, TriggeredFlags};

/// Default accelerator deadline.
pub const DEFAULT_ACCELERATOR_TIMEOUT: Duration = Duration::from_micros(500);

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Why a request was denied.
///
/// The first three mean "policy said no"; the rest mean "the system could
/// not reach a confident decision".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The verdict table maps this risk level to deny.
    Policy,
    /// The caller is quarantined.
    Quarantined,
    /// An approver rejected the request.
    ApprovalDenied,
    /// No descriptor is registered for the command.
    UnknownCommand,
    /// An internal failure prevented evaluation.
    EvaluationFailed,
    /// No approval decision arrived in time.
    ApprovalTimeout,
    /// The pending approval was cancelled.
    ApprovalCancelled,
}

impl DenyReason {
    /// True for denials decided by policy rather than by system failure.
    pub fn is_policy_decision(self) -> bool {
        matches!(
            self,
            Self::Policy | Self::Quarantined | Self::ApprovalDenied
        )
    }

    /// Code as written to the audit log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Quarantined => "quarantined",
            Self::ApprovalDenied => "approval_denied",
            Self::UnknownCommand => "unknown_command",
            Self::EvaluationFailed => "evaluation_failed",
            Self::ApprovalTimeout => "approval_timeout",
            Self::ApprovalCancelled => "approval_cancelled",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforcement action for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    /// Let the operation proceed.
    Allow,
    /// Refuse the operation.
    Deny(DenyReason),
    /// Refuse the operation and quarantine the caller.
    Quarantine,
    /// Hold the operation until an approver decides.
    RequireApproval,
}

impl Verdict {
    /// True only for [`Verdict::Allow`].
    pub fn is_allow(self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Deny reason, if this is a denial.
    pub fn deny_reason(self) -> Option<DenyReason> {
        match self {
            Self::Deny(reason) => Some(reason),
            _ => None,
        }
    }

    /// Name as written to the audit log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny(_) => "deny",
            Self::Quarantine => "quarantine",
            Self::RequireApproval => "require_approval",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deny(reason) => write!(f, "deny ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict policy
// ---------------------------------------------------------------------------

/// Configurable action for a risk level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictAction {
    /// Allow silently.
    Allow,
    /// Allow, marking the audit record as flagged.
    AllowFlagged,
    /// Deny with [`DenyReason::Policy`].
    Deny,
    /// Hold for approval.
    RequireApproval,
    /// Deny and quarantine the caller.
    Quarantine,
}

/// Risk level to action table (`[policy.verdicts]` in config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictPolicy {
    /// Action for [`RiskLevel::Safe`].
    pub safe: VerdictAction,
    /// Action for [`RiskLevel::Low`].
    pub low: VerdictAction,
    /// Action for [`RiskLevel::Medium`].
    pub medium: VerdictAction,
    /// Action for [`RiskLevel::High`].
    pub high: VerdictAction,
    /// Action for [`RiskLevel::Critical`].
    pub critical: VerdictAction,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self {
            safe: VerdictAction::Allow,
            low: VerdictAction::Allow,
            medium: VerdictAction::AllowFlagged,
            high: VerdictAction::RequireApproval,
            critical: VerdictAction::Quarantine,
        }
    }
}

impl VerdictPolicy {
    /// Action configured for `risk`.
    pub fn action(&self, risk: RiskLevel) -> VerdictAction {
        match risk {
            RiskLevel::Safe => self.safe,
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }

    /// Verdict and audit flag for `risk`.
    pub fn verdict(&self, risk: RiskLevel) -> (Verdict, bool) {
        match self.action(risk) {
            VerdictAction::Allow => (Verdict::Allow, false),
            VerdictAction::AllowFlagged => (Verdict::Allow, true),
            VerdictAction::Deny => (Verdict::Deny(DenyReason::Policy), false),
            VerdictAction::RequireApproval => (Verdict::RequireApproval, false),
            VerdictAction::Quarantine => (Verdict::Quarantine, false),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Outcome of [`DecisionEngine::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Enforcement action.
    pub verdict: Verdict,
    /// Risk level, when the command was evaluated.
    pub risk: Option<RiskLevel>,
    /// Contributors to the risk level. Audit-only.
    pub triggered: TriggeredFlags,
    /// Which evaluator answered.
    pub path: EvaluationPath,
    /// Allowed but worth a second look.
    pub flagged: bool,
    /// Time spent deciding.
    pub latency: Duration,
}

/// Maps invocation contexts to decisions.
pub struct DecisionEngine {
    registry: Arc<CapabilityRegistry>,
    evaluator: Arc<RiskEvaluator>,
    accelerator: Option<Arc<dyn Accelerator>>,
    verdicts: VerdictPolicy,
    accelerator_timeout: Duration,
}

impl fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("registry", &self.registry)
            .field("accelerator", &self.accelerator.as_ref().map(|a| a.name()))
            .field("verdicts", &self.verdicts)
            .field("accelerator_timeout", &self.accelerator_timeout)
            .finish()
    }
}

impl DecisionEngine {
    /// Engine with no accelerator.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        evaluator: Arc<RiskEvaluator>,
        verdicts: VerdictPolicy,
    ) -> Self {
        Self {
            registry,
            evaluator,
            accelerator: None,
            verdicts,
            accelerator_timeout: DEFAULT_ACCELERATOR_TIMEOUT,
        }
    }

    /// Try `accelerator` first, giving it at most `timeout`.
    #[must_use]
    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>, timeout: Duration) -> Self {
        self.accelerator = Some(accelerator);
        self.accelerator_timeout = timeout;
        self
    }

    /// Registry consulted for descriptors.
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Verdict table in use.
    pub fn verdicts(&self) -> &VerdictPolicy {
        &self.verdicts
    }

    /// Retire a command: remove its descriptor and forget its cached
    /// baseline. Later requests for it are denied as unknown.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the command is not registered.
    pub fn retire(&self, command: impl Into<CommandId>) -> Result<RegistryEntry, RegistryError> {
        let command = command.into();
        let entry = self.registry.remove(command)?;
        self.evaluator.invalidate(command);
        Ok(entry)
    }

    /// Decide one request. Unknown commands are denied.
    pub async fn decide(&self, ctx: &InvocationContext) -> Decision {
        let started = Instant::now();

        let Some(descriptor) = self.registry.lookup(ctx.command) else {
            debug!(command_hash = %ctx.command, caller = %ctx.caller.id, "unknown command");
            return Decision {
                verdict: Verdict::Deny(DenyReason::UnknownCommand),
                risk: None,
                triggered: TriggeredFlags::default(),
                path: EvaluationPath::Unresolved,
                flagged: false,
                latency: started.elapsed(),
            };
        };

        let (evaluation, path) = match self.accelerated(&descriptor, ctx).await {
            Some(evaluation) => (evaluation, EvaluationPath::Accelerator),
            None => (
                self.evaluator.evaluate(&descriptor, ctx),
                EvaluationPath::Software,
            ),
        };

        let (verdict, flagged) = self.verdicts.verdict(evaluation.risk);
        Decision {
            verdict,
            risk: Some(evaluation.risk),
            triggered: evaluation.triggered,
            path,
            flagged,
            latency: started.elapsed(),
        }
    }

    /// Run the accelerator on its own task so that a panic or a hang costs
    /// only the fallback, never the request.
    async fn accelerated(
        &self,
        descriptor: &Descriptor,
        ctx: &InvocationContext,
    ) -> Option<Evaluation> {
        let accelerator = Arc::clone(self.accelerator.as_ref()?);
        let timeout = self.accelerator_timeout;
        let descriptor = *descriptor;
        let owned_ctx = ctx.clone();

        let mut task = tokio::spawn(async move {
            accelerator
                .try_evaluate(&descriptor, &owned_ctx, timeout)
                .await
        });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Some(evaluation))) => Some(evaluation),
            Ok(Ok(None)) => {
                debug!(command_hash = %ctx.command, "accelerator unavailable, using software path");
                None
            }
            Ok(Err(error)) => {
                warn!(command_hash = %ctx.command, error = %error, "accelerator task failed");
                None
            }
            Err(_) => {
                task.abort();
                debug!(
                    command_hash = %ctx.command,
                    timeout_us = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX),
                    "accelerator timed out, using software path"
                );
                None
            }
        }
    }
}
