//! CLI contract tests, run against the built binary.

use std::path::Path;

use assert_cmd::Command;
use tempfile::TempDir;

use tcpguard::descriptor::{encode, CommandId, DescriptorFields, SecurityFlags};

/// Command with every state path pointed into `dir`.
fn tcpguard(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tcpguard").expect("binary should build");
    cmd.env("TCPGUARD_CONFIG_PATH", dir.join("absent.toml"))
        .env("TCPGUARD_AUDIT_LOG", dir.join("audit.jsonl"))
        .env("TCPGUARD_QUARANTINE_DB", dir.join("quarantine.db"))
        .env_remove("TCPGUARD_DESCRIPTOR_DB")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    let text = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(text.trim()).expect("stdout should be JSON")
}

/// Database with `ls` (read-only) and `rm` (destructive).
fn write_db(dir: &Path) -> std::path::PathBuf {
    let mut bytes = Vec::new();
    for (name, flags) in [
        ("ls", SecurityFlags::READ_ONLY),
        ("rm", SecurityFlags::DESTRUCTIVE | SecurityFlags::FILE_DELETE),
    ] {
        let fields = DescriptorFields::new(CommandId::from_name(name), flags);
        bytes.extend_from_slice(&encode(&fields).expect("encode"));
    }
    let path = dir.join("tools.tcp");
    std::fs::write(&path, bytes).expect("write db");
    path
}

#[test]
fn encode_prints_standard_descriptor() {
    let tmp = TempDir::new().expect("should create temp dir");
    let output = tcpguard(tmp.path())
        .args(["encode", "--command", "0xaabbccdd", "--flags", "destructive,file_delete"])
        .output()
        .expect("run");
    assert!(output.status.success());

    let hex = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    assert_eq!(hex.len(), 48);
    assert!(hex.starts_with("54435002aabbccdd00000900"));
}

#[test]
fn encode_rejects_unknown_flag() {
    let tmp = TempDir::new().expect("should create temp dir");
    tcpguard(tmp.path())
        .args(["encode", "--command", "ls", "--flags", "read_only,teleport"])
        .assert()
        .failure();
}

#[test]
fn encode_rejects_contradictory_flags() {
    let tmp = TempDir::new().expect("should create temp dir");
    tcpguard(tmp.path())
        .args(["encode", "--command", "rm", "--flags", "read_only,destructive"])
        .assert()
        .failure();
}

#[test]
fn inspect_decodes_what_encode_prints() {
    let tmp = TempDir::new().expect("should create temp dir");
    let encoded = tcpguard(tmp.path())
        .args([
            "encode",
            "--command",
            "0x00000042",
            "--flags",
            "network_access",
            "--signature",
            "0102030405060708",
        ])
        .output()
        .expect("run");
    assert!(encoded.status.success());
    let hex = String::from_utf8_lossy(&encoded.stdout).trim().to_owned();
    assert_eq!(hex.len(), 64);

    let inspected = tcpguard(tmp.path())
        .args(["inspect", &hex])
        .output()
        .expect("run");
    assert!(inspected.status.success());
    let json = stdout_json(&inspected);
    assert_eq!(json["command"], "0x00000042");
    assert_eq!(json["version"], "extended");
    assert_eq!(json["signature"], "0102030405060708");
}

#[test]
fn inspect_rejects_corruption() {
    let tmp = TempDir::new().expect("should create temp dir");
    let fields = DescriptorFields::new(CommandId::new(7), SecurityFlags::READ_ONLY);
    let mut bytes = encode(&fields).expect("encode");
    bytes[10] ^= 0x01;

    tcpguard(tmp.path())
        .args(["inspect", &hex::encode(bytes)])
        .assert()
        .failure();
}

#[test]
fn check_allows_read_only_command() {
    let tmp = TempDir::new().expect("should create temp dir");
    let db = write_db(tmp.path());

    let output = tcpguard(tmp.path())
        .args(["check", "--caller", "agent", "--db"])
        .arg(&db)
        .args(["--", "ls", "-la"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["result"]["verdict"], "allow");
}

#[test]
fn check_denies_unknown_command() {
    let tmp = TempDir::new().expect("should create temp dir");
    let db = write_db(tmp.path());

    let output = tcpguard(tmp.path())
        .args(["check", "--caller", "agent", "--db"])
        .arg(&db)
        .args(["--", "mkfs", "/dev/sda"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let json = stdout_json(&output);
    assert_eq!(json["result"]["verdict"], "deny");
    assert_eq!(json["result"]["reason"], "unknown_command");
}

#[test]
fn quarantine_persists_across_invocations_until_release() {
    let tmp = TempDir::new().expect("should create temp dir");
    let db = write_db(tmp.path());

    let quarantined = tcpguard(tmp.path())
        .args(["check", "--caller", "agent", "--db"])
        .arg(&db)
        .args(["--", "rm", "-rf", "/"])
        .output()
        .expect("run");
    assert_eq!(quarantined.status.code(), Some(2));
    assert_eq!(stdout_json(&quarantined)["result"]["verdict"], "quarantine");

    let blocked = tcpguard(tmp.path())
        .args(["check", "--caller", "agent", "--db"])
        .arg(&db)
        .args(["--", "ls"])
        .output()
        .expect("run");
    assert_eq!(blocked.status.code(), Some(2));
    assert_eq!(stdout_json(&blocked)["result"]["reason"], "quarantined");

    tcpguard(tmp.path())
        .args(["release", "--caller", "agent", "--by", "operator"])
        .assert()
        .success();

    let allowed = tcpguard(tmp.path())
        .args(["check", "--caller", "agent", "--db"])
        .arg(&db)
        .args(["--", "ls"])
        .output()
        .expect("run");
    assert_eq!(allowed.status.code(), Some(0));

    let audit = std::fs::read_to_string(tmp.path().join("audit.jsonl")).expect("audit log");
    let events: Vec<serde_json::Value> = audit
        .lines()
        .map(|line| serde_json::from_str(line).expect("audit line is JSON"))
        .collect();
    assert_eq!(events.len(), 4);
    assert_eq!(events[2]["event"], "quarantine_released");
}

#[test]
fn release_of_unknown_caller_fails() {
    let tmp = TempDir::new().expect("should create temp dir");
    tcpguard(tmp.path())
        .args(["release", "--caller", "nobody"])
        .assert()
        .failure();
}

#[test]
fn run_serves_json_lines() {
    let tmp = TempDir::new().expect("should create temp dir");
    let db = write_db(tmp.path());
    let requests = [
        r#"{"op":"authorize","id":"1","caller":"agent","command":"ls","args":["-la"]}"#,
        r#"{"op":"authorize","id":"2","caller":"agent","command":"0xdeadbeef"}"#,
        "not json",
    ]
    .join("\n");

    let output = tcpguard(tmp.path())
        .env("TCPGUARD_LOGS_DIR", tmp.path().join("logs"))
        .args(["run", "--db"])
        .arg(&db)
        .write_stdin(requests)
        .output()
        .expect("run");
    assert!(output.status.success());

    let replies: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("reply is JSON"))
        .collect();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0]["id"], "1");
    assert_eq!(replies[0]["result"]["verdict"], "allow");
    assert_eq!(replies[1]["result"]["reason"], "unknown_command");
    assert!(replies[2]["error"].is_string());
}

#[test]
fn run_withdraws_pending_approvals_at_end_of_input() {
    let tmp = TempDir::new().expect("should create temp dir");
    let fields = DescriptorFields::new(CommandId::from_name("unlink"), SecurityFlags::FILE_DELETE);
    let db = tmp.path().join("tools.tcp");
    std::fs::write(&db, encode(&fields).expect("encode")).expect("write db");
    let requests = [
        r#"{"op":"authorize","id":"a","caller":"agent","command":"unlink"}"#,
        r#"{"op":"authorize","id":"b","caller":"agent","command":"unlink"}"#,
    ]
    .join("\n");

    let output = tcpguard(tmp.path())
        .env("TCPGUARD_LOGS_DIR", tmp.path().join("logs"))
        .args(["run", "--db"])
        .arg(&db)
        .write_stdin(requests)
        .output()
        .expect("run");
    assert!(output.status.success());

    let replies: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("reply is JSON"))
        .collect();
    assert_eq!(replies.len(), 4);
    let pending: Vec<_> = replies.iter().filter(|r| r["status"] == "pending").collect();
    assert_eq!(pending.len(), 2);
    let finals: Vec<_> = replies.iter().filter(|r| r.get("result").is_some()).collect();
    assert_eq!(finals.len(), 2);
    for reply in finals {
        assert_eq!(reply["result"]["reason"], "approval_cancelled");
        assert!(reply["token"].is_string());
    }
}
