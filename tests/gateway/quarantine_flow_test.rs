//! Quarantine lifecycle through the gateway.

use std::time::Duration;

use tcpguard::descriptor::CommandId;
use tcpguard::engine::{DenyReason, Verdict};
use tcpguard::quarantine::QuarantineError;
use tcpguard::risk::{Caller, RiskLevel};

use crate::harness::{args, gateway, LS, RM};

#[tokio::test]
async fn destructive_command_quarantines_until_release() {
    let (gateway, _audit) = gateway(Duration::from_secs(60));
    let agent = Caller::new("agent-7");

    let verdict = gateway.authorize(RM, &args(&["-rf", "/"]), &agent).await;
    assert_eq!(verdict, Verdict::Quarantine);

    // Even a read-only command is refused while quarantined.
    let verdict = gateway.authorize(LS, &args(&["-la"]), &agent).await;
    assert_eq!(verdict, Verdict::Deny(DenyReason::Quarantined));

    let record = gateway
        .release("agent-7", "operator")
        .await
        .expect("release should succeed");
    assert_eq!(record.strikes, 1);
    assert_eq!(record.released_by.as_deref(), Some("operator"));

    let verdict = gateway.authorize(LS, &args(&["-la"]), &agent).await;
    assert_eq!(verdict, Verdict::Allow);
}

#[tokio::test]
async fn quarantine_does_not_spill_to_other_callers() {
    let (gateway, _audit) = gateway(Duration::from_secs(60));

    let verdict = gateway
        .authorize(RM, &args(&["-rf", "/tmp/x"]), &Caller::new("bad"))
        .await;
    assert_eq!(verdict, Verdict::Quarantine);

    let verdict = gateway.authorize(LS, &[], &Caller::new("good")).await;
    assert_eq!(verdict, Verdict::Allow);
}

#[tokio::test]
async fn repeated_quarantine_accumulates_strikes() {
    let (gateway, _audit) = gateway(Duration::from_secs(60));
    let agent = Caller::new("agent-7");

    assert_eq!(
        gateway.authorize(RM, &[], &agent).await,
        Verdict::Quarantine
    );
    // Second attempt is short-circuited before evaluation, so the episode
    // is untouched.
    assert_eq!(
        gateway.authorize(RM, &[], &agent).await,
        Verdict::Deny(DenyReason::Quarantined)
    );

    let record = gateway
        .quarantine()
        .upsert("agent-7", "manual strike", RiskLevel::High)
        .await
        .expect("upsert");
    assert_eq!(record.strikes, 2);
    // Risk never drops within an episode.
    assert_eq!(record.risk_level, RiskLevel::Critical);
    assert!(record.is_active());
}

#[tokio::test]
async fn release_of_unknown_caller_fails() {
    let (gateway, _audit) = gateway(Duration::from_secs(60));
    let err = gateway
        .release("nobody", "operator")
        .await
        .expect_err("nothing to release");
    assert!(matches!(err, QuarantineError::NotQuarantined(id) if id == "nobody"));
}

#[tokio::test]
async fn unknown_command_is_denied_without_quarantine() {
    let (gateway, _audit) = gateway(Duration::from_secs(60));
    let agent = Caller::new("agent-7");

    let verdict = gateway
        .authorize(CommandId::new(0xDEAD_BEEF), &[], &agent)
        .await;
    assert_eq!(verdict, Verdict::Deny(DenyReason::UnknownCommand));

    let active = gateway.quarantine().get("agent-7").await.expect("lookup");
    assert!(active.is_none());
}
