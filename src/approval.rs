//! Approval queue: human-in-the-loop for high-risk requests.
//!
//! Each request gets a token and a `tokio::sync::oneshot` channel. The
//! waiter holds a [`PendingApproval`]; an approver resolves the token from
//! anywhere else. Dropping the handle, timing out, [`ApprovalQueue::cancel`]
//! and [`ApprovalQueue::cancel_all`] all remove the entry, so nothing is
//! left behind whichever way the wait ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::descriptor::CommandId;
use crate::risk::RiskLevel;

/// Default time an approver has to decide.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// A request waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    /// Token identifying the request.
    pub token: Uuid,
    /// Who asked.
    pub caller_id: String,
    /// What they asked to run.
    pub command: CommandId,
    /// With which arguments.
    pub args: Vec<String>,
    /// Evaluated risk.
    pub risk: RiskLevel,
    /// When the request was queued.
    pub created_at: DateTime<Utc>,
    /// How long the approver has.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

/// How a pending approval ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// An approver allowed it.
    Approved,
    /// An approver refused it.
    Denied,
    /// Nobody decided in time.
    TimedOut,
    /// The request was withdrawn or the queue shut down.
    Cancelled,
}

/// Approval queue errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending request with this token (never existed, already resolved,
    /// timed out or cancelled).
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
}

struct PendingEntry {
    request: ApprovalRequest,
    sender: oneshot::Sender<ApprovalOutcome>,
}

/// Pending approvals keyed by token.
pub struct ApprovalQueue {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for ApprovalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalQueue")
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

impl ApprovalQueue {
    /// Queue whose requests time out after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Timeout applied to new requests.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Queue a request and return the waiter's handle.
    pub fn submit(
        self: &Arc<Self>,
        caller_id: &str,
        command: CommandId,
        args: &[String],
        risk: RiskLevel,
    ) -> PendingApproval {
        let (sender, receiver) = oneshot::channel();
        let request = ApprovalRequest {
            token: Uuid::new_v4(),
            caller_id: caller_id.to_owned(),
            command,
            args: args.to_vec(),
            risk,
            created_at: Utc::now(),
            timeout: self.default_timeout,
        };
        let token = request.token;

        info!(
            token = %token,
            caller = %caller_id,
            command_hash = %command,
            risk = %risk,
            "approval request submitted"
        );

        self.pending.lock().insert(
            token,
            PendingEntry {
                request: request.clone(),
                sender,
            },
        );

        PendingApproval {
            request,
            queue: Arc::clone(self),
            receiver,
        }
    }

    /// Deliver an approver's decision. Returns the resolved request.
    pub fn resolve(&self, token: Uuid, approved: bool) -> Result<ApprovalRequest, ApprovalError> {
        let outcome = if approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Denied
        };
        let request = self.finish(token, outcome)?;
        info!(
            token = %token,
            caller = %request.caller_id,
            command_hash = %request.command,
            outcome = ?outcome,
            "approval resolved"
        );
        Ok(request)
    }

    /// Withdraw one pending request; its waiter sees `Cancelled`.
    pub fn cancel(&self, token: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        let request = self.finish(token, ApprovalOutcome::Cancelled)?;
        info!(token = %token, caller = %request.caller_id, "approval cancelled");
        Ok(request)
    }

    /// Withdraw everything, e.g. on shutdown. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            // Receiver may already be gone; nothing to do then.
            let _send_result = entry.sender.send(ApprovalOutcome::Cancelled);
        }
        if count > 0 {
            warn!(count, "cancelled all pending approvals");
        }
        count
    }

    /// Request for `token`, if still pending.
    pub fn get_pending(&self, token: Uuid) -> Option<ApprovalRequest> {
        self.pending.lock().get(&token).map(|e| e.request.clone())
    }

    /// Number of requests awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of pending requests, oldest first.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Remove `token` and send `outcome` while holding the lock, so a waiter
    /// that finds its entry gone knows the outcome is already in its channel.
    fn finish(&self, token: Uuid, outcome: ApprovalOutcome) -> Result<ApprovalRequest, ApprovalError> {
        let mut pending = self.pending.lock();
        let entry = pending.remove(&token).ok_or(ApprovalError::NotFound(token))?;
        let _send_result = entry.sender.send(outcome);
        Ok(entry.request)
    }

    fn take(&self, token: Uuid) -> bool {
        self.pending.lock().remove(&token).is_some()
    }
}

/// Waiter side of a queued request. Dropping it withdraws the request.
#[derive(Debug)]
pub struct PendingApproval {
    request: ApprovalRequest,
    queue: Arc<ApprovalQueue>,
    receiver: oneshot::Receiver<ApprovalOutcome>,
}

impl PendingApproval {
    /// Token an approver resolves.
    pub fn token(&self) -> Uuid {
        self.request.token
    }

    /// The queued request.
    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }

    /// Wait for a decision, at most the request's timeout.
    pub async fn wait(mut self) -> ApprovalOutcome {
        let token = self.request.token;
        match tokio::time::timeout(self.request.timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ApprovalOutcome::Cancelled,
            Err(_) => {
                if self.queue.take(token) {
                    info!(token = %token, caller = %self.request.caller_id, "approval timed out");
                    ApprovalOutcome::TimedOut
                } else {
                    // Resolved at the deadline; the outcome is already sent.
                    self.receiver
                        .try_recv()
                        .unwrap_or(ApprovalOutcome::Cancelled)
                }
            }
        }
    }
}

impl Drop for PendingApproval {
    fn drop(&mut self) {
        self.queue.take(self.request.token);
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
