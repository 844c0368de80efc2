//! Risk evaluation: descriptor + invocation context to a risk level.
//!
//! The descriptor alone determines a baseline, cached per command. Context
//! rules (elevated caller, protected paths, escalation and recursive
//! arguments) are applied fresh on every request and can only raise the
//! baseline.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};

use crate::descriptor::{CommandId, Descriptor, SecurityFlags, FLAG_TABLE};

// ---------------------------------------------------------------------------
// Risk level
// ---------------------------------------------------------------------------

/// Ordered risk classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// No security-relevant capability.
    #[default]
    Safe,
    /// Minor capability.
    Low,
    /// Worth an audit flag.
    Medium,
    /// Needs a human decision.
    High,
    /// Never allowed; quarantines the caller by default.
    Critical,
}

impl RiskLevel {
    /// All levels, lowest first.
    pub const ALL: [Self; 5] = [Self::Safe, Self::Low, Self::Medium, Self::High, Self::Critical];

    /// One level up, saturating at [`RiskLevel::Critical`].
    #[must_use]
    pub fn raised(self) -> Self {
        match self {
            Self::Safe => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Lowercase name used in config and audit output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown risk level: {s}"))
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Triggered flags
// ---------------------------------------------------------------------------

/// Context rules that fired for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextTriggers(u8);

impl ContextTriggers {
    /// Caller already holds elevated privilege.
    pub const ELEVATED_CALLER: Self = Self(1 << 0);
    /// An argument names a protected path.
    pub const PROTECTED_PATH: Self = Self(1 << 1);
    /// An argument requests privilege escalation.
    pub const ESCALATION_ARGUMENT: Self = Self(1 << 2);
    /// An argument asks for recursive operation.
    pub const RECURSIVE_ARGUMENT: Self = Self(1 << 3);

    const NAMES: [(Self, &'static str); 4] = [
        (Self::ELEVATED_CALLER, "elevated_caller"),
        (Self::PROTECTED_PATH, "protected_path"),
        (Self::ESCALATION_ARGUMENT, "escalation_argument"),
        (Self::RECURSIVE_ARGUMENT, "recursive_argument"),
    ];

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when nothing fired.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add `other` to the set.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Names of the triggers that fired.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }
}

/// Everything that contributed to a risk level: descriptor flags that carry
/// risk plus context rules that fired. Audit-only; never shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TriggeredFlags {
    /// Descriptor flags whose own baseline is above [`RiskLevel::Safe`].
    pub descriptor: SecurityFlags,
    /// Context rules that fired.
    pub context: ContextTriggers,
}

impl TriggeredFlags {
    /// True when nothing contributed.
    pub fn is_empty(&self) -> bool {
        self.descriptor.is_empty() && self.context.is_empty()
    }

    /// Names of descriptor flags followed by context trigger names.
    pub fn names(&self) -> Vec<&'static str> {
        self.descriptor.names().chain(self.context.names()).collect()
    }
}

impl Serialize for TriggeredFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

/// Result of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Final risk level.
    pub risk: RiskLevel,
    /// What contributed to it.
    pub triggered: TriggeredFlags,
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Identity of the agent or process requesting an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller {
    /// Stable caller identifier.
    pub id: String,
    /// Whether the caller already runs with elevated privilege.
    pub elevated: bool,
}

impl Caller {
    /// Unprivileged caller.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elevated: false,
        }
    }

    /// Caller already holding elevated privilege.
    pub fn elevated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elevated: true,
        }
    }
}

/// Per-request context. Created per request and dropped when the gateway
/// returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    /// Who is asking.
    pub caller: Caller,
    /// Resolved command identifier.
    pub command: CommandId,
    /// Argument vector, excluding the command itself.
    pub args: Vec<String>,
    /// Directory relative path arguments resolve against.
    pub working_dir: Option<PathBuf>,
    /// When the request arrived.
    pub timestamp: DateTime<Utc>,
}

impl InvocationContext {
    /// Context timestamped now, without a working directory.
    pub fn new(caller: Caller, command: CommandId, args: Vec<String>) -> Self {
        Self {
            caller,
            command,
            args,
            working_dir: None,
            timestamp: Utc::now(),
        }
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Injected predicates used by the context rules (`[risk]` in config).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    /// Path prefixes whose contents are protected.
    pub protected_paths: Vec<String>,
    /// Arguments that request privilege escalation.
    pub escalation_args: Vec<String>,
    /// Arguments that make an operation recursive.
    pub recursive_args: Vec<String>,
    /// Caller ids always treated as elevated.
    pub elevated_callers: Vec<String>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            protected_paths: ["/etc", "/boot", "/usr", "/bin", "/sbin", "/root", "/var/lib"]
                .map(String::from)
                .to_vec(),
            escalation_args: ["sudo", "su", "doas", "--privileged"]
                .map(String::from)
                .to_vec(),
            recursive_args: ["-r", "-R", "-rf", "-fr", "-Rf", "--recursive"]
                .map(String::from)
                .to_vec(),
            elevated_callers: Vec::new(),
        }
    }
}

impl RiskPolicy {
    /// True when `caller` is elevated by its own claim or by policy.
    pub fn is_elevated(&self, caller: &Caller) -> bool {
        caller.elevated || self.elevated_callers.iter().any(|id| *id == caller.id)
    }

    /// True when `arg`, resolved against `working_dir`, lies under a
    /// protected prefix. `--opt=value` arguments are checked by value.
    pub fn is_protected(&self, arg: &str, working_dir: Option<&Path>) -> bool {
        let value = option_value(arg);
        if value.is_empty() || (value.starts_with('-') && !value.contains('/')) {
            return false;
        }
        let raw = Path::new(value);
        let resolved = match (raw.is_absolute(), working_dir) {
            (true, _) => normalize(raw),
            (false, Some(dir)) => normalize(&dir.join(raw)),
            (false, None) => normalize(raw),
        };
        self.protected_paths
            .iter()
            .any(|prefix| resolved.starts_with(normalize(Path::new(prefix))))
    }

    /// True when `arg` (or its file name) matches an escalation predicate.
    pub fn is_escalation(&self, arg: &str) -> bool {
        let base = Path::new(arg)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(arg);
        self.escalation_args.iter().any(|p| p == arg || p == base)
    }

    /// True when `arg` matches a recursive predicate.
    pub fn is_recursive(&self, arg: &str) -> bool {
        self.recursive_args.iter().any(|p| p == arg)
    }
}

/// `--output=/etc/x` yields `/etc/x`; anything else is returned unchanged.
fn option_value(arg: &str) -> &str {
    match arg.split_once('=') {
        Some((key, value)) if key.starts_with('-') => value,
        _ => arg,
    }
}

/// Lexical normalisation: drops `.`, applies `..` without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Baseline {
    flags: SecurityFlags,
    risk: RiskLevel,
    triggered: SecurityFlags,
}

/// In-process risk evaluator.
///
/// Stateless apart from the baseline cache, which is keyed by command and
/// revalidated against the descriptor's flags on every hit, so a replaced
/// registry entry never reuses a stale baseline.
#[derive(Debug)]
pub struct RiskEvaluator {
    policy: Arc<RiskPolicy>,
    baselines: DashMap<CommandId, Baseline>,
}

impl RiskEvaluator {
    /// Evaluator using the given policy.
    pub fn new(policy: Arc<RiskPolicy>) -> Self {
        Self {
            policy,
            baselines: DashMap::new(),
        }
    }

    /// Policy in use.
    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Evaluate a request. Same inputs always give the same result.
    pub fn evaluate(&self, descriptor: &Descriptor, ctx: &InvocationContext) -> Evaluation {
        let baseline = self.baseline(descriptor);
        let mutating = descriptor.security_flags().is_mutating();
        let mut risk = baseline.risk;
        let mut context = ContextTriggers::empty();

        if mutating && self.policy.is_elevated(&ctx.caller) {
            risk = risk.raised();
            context.insert(ContextTriggers::ELEVATED_CALLER);
        }

        let working_dir = ctx.working_dir.as_deref();
        let (mut protected, mut escalation, mut recursive) = (false, false, false);
        for arg in &ctx.args {
            protected |= self.policy.is_protected(arg, working_dir);
            escalation |= self.policy.is_escalation(arg);
            recursive |= self.policy.is_recursive(arg);
        }

        if protected {
            let floor = if mutating {
                RiskLevel::Critical
            } else {
                RiskLevel::Medium
            };
            risk = risk.max(floor);
            context.insert(ContextTriggers::PROTECTED_PATH);
        }
        if escalation {
            risk = risk.max(RiskLevel::High);
            context.insert(ContextTriggers::ESCALATION_ARGUMENT);
        }
        if recursive && mutating {
            risk = risk.raised();
            context.insert(ContextTriggers::RECURSIVE_ARGUMENT);
        }

        Evaluation {
            risk,
            triggered: TriggeredFlags {
                descriptor: baseline.triggered,
                context,
            },
        }
    }

    /// Descriptor-only risk, ignoring context.
    pub fn baseline_risk(&self, descriptor: &Descriptor) -> RiskLevel {
        self.baseline(descriptor).risk
    }

    /// Number of cached baselines.
    pub fn cached(&self) -> usize {
        self.baselines.len()
    }

    /// Drop the cached baseline for a command.
    pub fn invalidate(&self, command: CommandId) {
        self.baselines.remove(&command);
    }

    fn baseline(&self, descriptor: &Descriptor) -> Baseline {
        let flags = descriptor.security_flags();
        if let Some(hit) = self.baselines.get(&descriptor.command()) {
            if hit.flags == flags {
                return *hit;
            }
        }
        let computed = compute_baseline(flags);
        self.baselines.insert(descriptor.command(), computed);
        computed
    }
}

/// Max of the per-flag baselines. Walks the whole table regardless of
/// which flags are set.
fn compute_baseline(flags: SecurityFlags) -> Baseline {
    let mut risk = RiskLevel::Safe;
    let mut triggered = SecurityFlags::empty();
    for entry in &FLAG_TABLE {
        let present = flags.contains(entry.flag);
        let level = if present { entry.baseline } else { RiskLevel::Safe };
        risk = risk.max(level);
        if level > RiskLevel::Safe {
            triggered |= entry.flag;
        }
    }
    Baseline {
        flags,
        risk,
        triggered,
    }
}
