//! Both store implementations honour the same contract.

use std::sync::Arc;

use tempfile::TempDir;

use tcpguard::quarantine::{
    InMemoryQuarantineStore, QuarantineError, QuarantineStore, SqliteQuarantineStore,
};
use tcpguard::risk::RiskLevel;

async fn stores() -> Vec<(&'static str, Arc<dyn QuarantineStore>)> {
    let sqlite = SqliteQuarantineStore::in_memory()
        .await
        .expect("in-memory sqlite");
    vec![
        ("memory", Arc::new(InMemoryQuarantineStore::new())),
        ("sqlite", Arc::new(sqlite)),
    ]
}

#[tokio::test]
async fn episode_lifecycle() {
    for (name, store) in stores().await {
        assert!(store.get("agent").await.expect("get").is_none(), "{name}");

        let first = store
            .upsert("agent", "first", RiskLevel::High)
            .await
            .expect("upsert");
        assert_eq!(first.strikes, 1, "{name}");

        let second = store
            .upsert("agent", "second", RiskLevel::Medium)
            .await
            .expect("upsert");
        assert_eq!(second.strikes, 2, "{name}");
        assert_eq!(second.risk_level, RiskLevel::High, "{name}");
        assert_eq!(second.reason, "second", "{name}");
        assert_eq!(second.entered_at, first.entered_at, "{name}");

        let released = store.release("agent", "ops").await.expect("release");
        assert!(!released.is_active(), "{name}");
        assert!(store.get("agent").await.expect("get").is_none(), "{name}");

        // A new quarantine opens a fresh episode.
        let third = store
            .upsert("agent", "again", RiskLevel::Low)
            .await
            .expect("upsert");
        assert_eq!(third.strikes, 1, "{name}");
        assert_eq!(third.risk_level, RiskLevel::Low, "{name}");

        let history = store.history("agent").await.expect("history");
        assert_eq!(history.len(), 2, "{name}");
        assert!(!history[0].is_active(), "{name}");
        assert!(history[1].is_active(), "{name}");
    }
}

#[tokio::test]
async fn release_without_episode_fails() {
    for (name, store) in stores().await {
        let err = store
            .release("ghost", "ops")
            .await
            .expect_err("nothing to release");
        assert!(matches!(err, QuarantineError::NotQuarantined(_)), "{name}");
    }
}

#[tokio::test]
async fn concurrent_upserts_count_every_strike() {
    for (name, store) in stores().await {
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .upsert("agent", &format!("strike {i}"), RiskLevel::Critical)
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("upsert");
        }

        let active = store
            .get("agent")
            .await
            .expect("get")
            .expect("active episode");
        assert_eq!(active.strikes, 16, "{name}");
        assert_eq!(store.history("agent").await.expect("history").len(), 1, "{name}");
    }
}

#[tokio::test]
async fn sqlite_state_survives_reopen() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("state").join("quarantine.db");

    {
        let store = SqliteQuarantineStore::open(&path).await.expect("open");
        store
            .upsert("agent", "destructive", RiskLevel::Critical)
            .await
            .expect("upsert");
    }

    let reopened = SqliteQuarantineStore::open(&path).await.expect("reopen");
    let active = reopened
        .get("agent")
        .await
        .expect("get")
        .expect("still quarantined");
    assert_eq!(active.risk_level, RiskLevel::Critical);
    assert_eq!(active.reason, "destructive");
}
