//! Every authorization writes exactly one audit line.

use std::time::Duration;

use tcpguard::descriptor::CommandId;
use tcpguard::gateway::Authorization;
use tcpguard::risk::Caller;

use crate::harness::{args, gateway, LS, RM, UNLINK};

#[tokio::test]
async fn one_line_per_decided_request() {
    let (gateway, audit) = gateway(Duration::from_secs(60));
    let agent = Caller::new("agent");

    gateway.authorize(LS, &[], &agent).await;
    gateway.authorize(CommandId::new(0x0BAD_F00D), &[], &agent).await;
    gateway.authorize(RM, &args(&["-rf", "/etc"]), &agent).await;
    gateway.authorize(LS, &[], &agent).await;

    let lines = audit.authorizations();
    assert_eq!(lines.len(), 4);

    assert_eq!(lines[0]["verdict"], "allow");
    assert_eq!(lines[0]["evaluation_path"], "software");
    assert_eq!(lines[0]["risk_level"], "safe");

    assert_eq!(lines[1]["verdict"], "deny");
    assert_eq!(lines[1]["deny_reason"], "unknown_command");
    assert_eq!(lines[1]["evaluation_path"], "unresolved");
    assert_eq!(lines[1]["risk_level"], serde_json::Value::Null);

    assert_eq!(lines[2]["verdict"], "quarantine");
    assert_eq!(lines[2]["command_hash"], "0xaabbccdd");
    let flags = lines[2]["triggered_flags"]
        .as_array()
        .expect("flag list");
    assert!(flags.contains(&serde_json::json!("destructive")));
    assert!(flags.contains(&serde_json::json!("protected_path")));
    assert!(flags.contains(&serde_json::json!("recursive_argument")));

    assert_eq!(lines[3]["deny_reason"], "quarantined");
    assert_eq!(lines[3]["evaluation_path"], "quarantine_short_circuit");
}

#[tokio::test]
async fn approval_writes_one_authorization_line_at_resolution() {
    let (gateway, audit) = gateway(Duration::from_secs(60));
    let Authorization::Pending(pending) = gateway
        .authorize_deferred(UNLINK, &[], &Caller::new("agent"))
        .await
    else {
        panic!("expected approval to be required");
    };
    let token = pending.token().expect("token");

    // Nothing is logged while the request waits.
    assert!(audit.authorizations().is_empty());

    gateway
        .resolve_approval(token, true, "alice")
        .expect("resolve");
    pending.wait().await;

    let lines = audit.lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["event"], "approval_resolved");
    assert_eq!(lines[0]["resolved_by"], "alice");
    assert_eq!(lines[0]["approved"], true);
    assert_eq!(lines[1]["event"], "authorization");
    assert_eq!(lines[1]["verdict"], "allow");
    assert_eq!(lines[1]["approval_token"], token.to_string());
}

#[tokio::test]
async fn release_is_audited() {
    let (gateway, audit) = gateway(Duration::from_secs(60));
    gateway.authorize(RM, &[], &Caller::new("agent")).await;
    gateway
        .release("agent", "operator")
        .await
        .expect("release");

    let lines = audit.lines();
    let release = lines
        .iter()
        .find(|line| line["event"] == "quarantine_released")
        .expect("release line");
    assert_eq!(release["caller_id"], "agent");
    assert_eq!(release["released_by"], "operator");
    assert_eq!(release["strikes"], 1);
}

#[tokio::test]
async fn medium_risk_is_allowed_but_flagged() {
    let (gateway, audit) = gateway(Duration::from_secs(60));
    // Read-only command touching a protected path: medium risk.
    let verdict = gateway
        .authorize(LS, &args(&["/etc/passwd"]), &Caller::new("agent"))
        .await;
    assert!(verdict.is_allow());

    let lines = audit.authorizations();
    assert_eq!(lines[0]["risk_level"], "medium");
    assert_eq!(lines[0]["flagged"], true);
}
