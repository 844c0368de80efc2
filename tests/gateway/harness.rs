//! Shared setup for gateway tests: an in-memory stack with captured audit
//! output.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tcpguard::approval::ApprovalQueue;
use tcpguard::audit::AuditLogger;
use tcpguard::descriptor::{CommandId, DescriptorFields, SecurityFlags};
use tcpguard::engine::{DecisionEngine, VerdictPolicy};
use tcpguard::gateway::EnforcementGateway;
use tcpguard::quarantine::InMemoryQuarantineStore;
use tcpguard::registry::CapabilityRegistry;
use tcpguard::risk::{RiskEvaluator, RiskPolicy};

/// Destructive delete, registered under a fixed hash.
pub const RM: CommandId = CommandId::new(0xAABB_CCDD);
/// Read-only listing.
pub const LS: CommandId = CommandId::new(0x0000_1500);
/// File delete without the destructive flag: high risk, needs approval.
pub const UNLINK: CommandId = CommandId::new(0x0000_2600);

/// Audit sink that tests can read back.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    /// Parsed audit lines.
    pub fn lines(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().expect("test lock").clone();
        String::from_utf8(bytes)
            .expect("audit output is UTF-8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("audit line is JSON"))
            .collect()
    }

    /// Parsed `authorization` lines only.
    pub fn authorizations(&self) -> Vec<serde_json::Value> {
        self.lines()
            .into_iter()
            .filter(|line| line["event"] == "authorization")
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("test lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Registry holding [`RM`], [`LS`] and [`UNLINK`].
pub fn registry() -> Arc<CapabilityRegistry> {
    let registry = CapabilityRegistry::default();
    registry
        .register_fields(
            &DescriptorFields::new(RM, SecurityFlags::DESTRUCTIVE | SecurityFlags::FILE_DELETE),
            "test",
        )
        .expect("register rm");
    registry
        .register_fields(&DescriptorFields::new(LS, SecurityFlags::READ_ONLY), "test")
        .expect("register ls");
    registry
        .register_fields(
            &DescriptorFields::new(UNLINK, SecurityFlags::FILE_DELETE),
            "test",
        )
        .expect("register unlink");
    Arc::new(registry)
}

/// Gateway over [`registry`] with the default verdict table.
pub fn gateway(approval_timeout: Duration) -> (EnforcementGateway, SharedBuf) {
    let evaluator = Arc::new(RiskEvaluator::new(Arc::new(RiskPolicy::default())));
    let engine = DecisionEngine::new(registry(), evaluator, VerdictPolicy::default());
    let buf = SharedBuf::default();
    let gateway = EnforcementGateway::new(
        engine,
        Arc::new(InMemoryQuarantineStore::new()),
        Arc::new(ApprovalQueue::new(approval_timeout)),
        Arc::new(AuditLogger::from_writer(Box::new(buf.clone()))),
    );
    (gateway, buf)
}

/// Owned argument list.
pub fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|arg| (*arg).to_owned()).collect()
}
