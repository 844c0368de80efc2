//! Coverage for config parsing and path resolution.

use std::path::PathBuf;
use std::time::Duration;

use tcpguard::config::{config_dir, AcceleratorConfig, ApprovalConfig, GuardConfig};
use tcpguard::engine::VerdictAction;
use tcpguard::registry::DEFAULT_CACHE_CAPACITY;
use tcpguard::risk::RiskLevel;

#[test]
fn default_values() {
    let config = GuardConfig::default();
    assert_eq!(config.registry.cache_capacity, DEFAULT_CACHE_CAPACITY);
    assert!(config.registry.descriptor_db.is_none());
    assert!(!config.accelerator.enabled);
    assert_eq!(AcceleratorConfig::default().timeout(), Duration::from_micros(500));
    assert_eq!(ApprovalConfig::default().timeout(), Duration::from_secs(300));
    assert!(config.policy.fail_open.is_empty());
    assert_eq!(config.policy.verdicts.critical, VerdictAction::Quarantine);
    assert!(config
        .policy
        .risk
        .protected_paths
        .iter()
        .any(|p| p == "/etc"));
}

#[test]
fn config_dir_resolves() {
    let dir = config_dir();
    assert!(dir.is_ok());
    let path = match dir {
        Ok(path) => path,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(path.ends_with(".tcpguard"));
}

#[test]
fn parse_empty_config() {
    let config = GuardConfig::from_toml("").expect("empty config is valid");
    assert_eq!(config.approval.timeout_secs, 300);
}

#[test]
fn parse_full_config() {
    let toml_str = r#"
[registry]
cache_capacity = 64
descriptor_db = "/srv/tcpguard/tools.tcp"

[policy]
protected_paths = ["/etc", "/opt/secrets"]
elevated_callers = ["deploy-bot"]
fail_open = ["medium", "high"]

[policy.verdicts]
medium = "deny"
high = "quarantine"

[accelerator]
enabled = true
timeout_us = 250

[approval]
timeout_secs = 30

[paths]
audit_log = "/var/log/tcpguard/audit.jsonl"
"#;
    let config = GuardConfig::from_toml(toml_str).expect("should parse");

    assert_eq!(config.registry.cache_capacity, 64);
    assert_eq!(
        config.registry.descriptor_db,
        Some(PathBuf::from("/srv/tcpguard/tools.tcp"))
    );

    assert_eq!(config.policy.risk.protected_paths, vec!["/etc", "/opt/secrets"]);
    assert_eq!(config.policy.risk.elevated_callers, vec!["deploy-bot"]);
    // Unset predicate lists keep their defaults.
    assert!(config.policy.risk.recursive_args.iter().any(|a| a == "-rf"));
    assert_eq!(
        config.policy.fail_open,
        vec![RiskLevel::Medium, RiskLevel::High]
    );

    assert_eq!(config.policy.verdicts.medium, VerdictAction::Deny);
    assert_eq!(config.policy.verdicts.high, VerdictAction::Quarantine);
    assert_eq!(config.policy.verdicts.safe, VerdictAction::Allow);

    assert!(config.accelerator.enabled);
    assert_eq!(config.accelerator.timeout(), Duration::from_micros(250));
    assert_eq!(config.approval.timeout(), Duration::from_secs(30));

    assert_eq!(
        config.paths.audit_log().expect("audit path"),
        PathBuf::from("/var/log/tcpguard/audit.jsonl")
    );
    let quarantine_db = config.paths.quarantine_db().expect("quarantine path");
    assert!(quarantine_db.ends_with(".tcpguard/quarantine.db"));
}

#[test]
fn unknown_risk_level_is_rejected() {
    let result = GuardConfig::from_toml(
        r#"
[policy]
fail_open = ["extreme"]
"#,
    );
    assert!(result.is_err());
}

#[test]
fn unknown_verdict_action_is_rejected() {
    let result = GuardConfig::from_toml(
        r#"
[policy.verdicts]
low = "shrug"
"#,
    );
    assert!(result.is_err());
}
