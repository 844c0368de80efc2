//! Configuration loading.
//!
//! Loads from `./tcpguard.toml` (or `$TCPGUARD_CONFIG_PATH`). Environment
//! variables override file values; file values override defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::engine::VerdictPolicy;
use crate::registry::DEFAULT_CACHE_CAPACITY;
use crate::risk::{RiskLevel, RiskPolicy};

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Descriptor registry settings.
    pub registry: RegistryConfig,
    /// Verdict table, context rules and fail-open levels.
    pub policy: PolicyConfig,
    /// Fast-path evaluator settings.
    pub accelerator: AcceleratorConfig,
    /// Approval queue settings.
    pub approval: ApprovalConfig,
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
}

impl GuardConfig {
    /// Load with precedence env vars > TOML file > defaults.
    ///
    /// A missing config file is not an error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file(|key| std::env::var(key).ok())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.warn_fail_open();
        Ok(config)
    }

    fn load_from_file(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = Self::config_path_with(env);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// `$TCPGUARD_CONFIG_PATH`, else `./tcpguard.toml`.
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("TCPGUARD_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tcpguard.toml"))
    }

    /// Apply environment overrides through an injectable resolver.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("TCPGUARD_AUDIT_LOG") {
            self.paths.audit_log = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TCPGUARD_QUARANTINE_DB") {
            self.paths.quarantine_db = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TCPGUARD_LOGS_DIR") {
            self.paths.logs_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TCPGUARD_DESCRIPTOR_DB") {
            self.registry.descriptor_db = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TCPGUARD_ACCELERATOR_TIMEOUT_US") {
            match v.parse() {
                Ok(n) => self.accelerator.timeout_us = n,
                Err(_) => tracing::warn!(
                    var = "TCPGUARD_ACCELERATOR_TIMEOUT_US",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("TCPGUARD_APPROVAL_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.approval.timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "TCPGUARD_APPROVAL_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    fn warn_fail_open(&self) {
        for level in &self.policy.fail_open {
            tracing::warn!(risk = %level, "config enables fail-open on approval timeout");
        }
    }

    /// Parse a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }
}

// ── Registry ────────────────────────────────────────────────────

/// `[registry]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// LRU cache entries in front of the backing store.
    pub cache_capacity: usize,
    /// Descriptor database loaded at startup.
    pub descriptor_db: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            descriptor_db: None,
        }
    }
}

// ── Policy ──────────────────────────────────────────────────────

/// `[policy]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Risk level to verdict overrides (`[policy.verdicts]`).
    pub verdicts: VerdictPolicy,
    /// Context rule predicates.
    #[serde(flatten)]
    pub risk: RiskPolicy,
    /// Risk levels allowed when their approval times out.
    pub fail_open: Vec<RiskLevel>,
}

// ── Accelerator ─────────────────────────────────────────────────

/// `[accelerator]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Dispatch to the accelerator before the software evaluator.
    pub enabled: bool,
    /// Deadline for one accelerator call, in microseconds.
    pub timeout_us: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_us: 500,
        }
    }
}

impl AcceleratorConfig {
    /// Deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us)
    }
}

// ── Approval ────────────────────────────────────────────────────

/// `[approval]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Seconds an approver has to decide.
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl ApprovalConfig {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// `[paths]`. Unset entries resolve under [`config_dir`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Audit log (JSON lines).
    pub audit_log: Option<PathBuf>,
    /// Quarantine SQLite database.
    pub quarantine_db: Option<PathBuf>,
    /// Directory for rotated service logs.
    pub logs_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Audit log path.
    pub fn audit_log(&self) -> Result<PathBuf> {
        resolve(&self.audit_log, "audit.jsonl")
    }

    /// Quarantine database path.
    pub fn quarantine_db(&self) -> Result<PathBuf> {
        resolve(&self.quarantine_db, "quarantine.db")
    }

    /// Service log directory.
    pub fn logs_dir(&self) -> Result<PathBuf> {
        resolve(&self.logs_dir, "logs")
    }
}

fn resolve(configured: &Option<PathBuf>, default_name: &str) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(path.clone()),
        None => Ok(config_dir()?.join(default_name)),
    }
}

/// Resolve the default state directory (`~/.tcpguard/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".tcpguard"))
}
