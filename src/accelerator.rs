//! Fast-path evaluator contract.
//!
//! An accelerator is anything that can evaluate a descriptor faster than the
//! in-process [`RiskEvaluator`]: an out-of-process service, an FPGA, a
//! kernel module. It must answer with exactly what the software evaluator
//! would, or not at all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::descriptor::Descriptor;
use crate::risk::{Evaluation, InvocationContext, RiskEvaluator};

/// Bounded-latency evaluator.
#[async_trait]
pub trait Accelerator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Evaluate within `timeout`. `None` means unavailable or too slow; an
    /// accelerator never guesses.
    async fn try_evaluate(
        &self,
        descriptor: &Descriptor,
        ctx: &InvocationContext,
        timeout: Duration,
    ) -> Option<Evaluation>;
}

/// Which evaluator produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPath {
    /// The accelerator answered in time.
    Accelerator,
    /// The in-process evaluator answered.
    Software,
    /// The caller was quarantined; nothing was evaluated.
    QuarantineShortCircuit,
    /// No descriptor or evaluation was available.
    Unresolved,
}

impl EvaluationPath {
    /// Name as written to the audit log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accelerator => "accelerator",
            Self::Software => "software",
            Self::QuarantineShortCircuit => "quarantine_short_circuit",
            Self::Unresolved => "unresolved",
        }
    }
}

/// Accelerator that runs the software evaluator in-process. Useful as a
/// reference implementation and for deployments without hardware.
#[derive(Debug, Clone)]
pub struct SoftwareAccelerator {
    evaluator: Arc<RiskEvaluator>,
}

impl SoftwareAccelerator {
    /// Wrap an evaluator.
    pub fn new(evaluator: Arc<RiskEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl Accelerator for SoftwareAccelerator {
    fn name(&self) -> &str {
        "software"
    }

    async fn try_evaluate(
        &self,
        descriptor: &Descriptor,
        ctx: &InvocationContext,
        _timeout: Duration,
    ) -> Option<Evaluation> {
        Some(self.evaluator.evaluate(descriptor, ctx))
    }
}
