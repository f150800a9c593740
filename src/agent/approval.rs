//! Single-slot approval workflow for the Approved remediation policy.
//!
//! At most one request is outstanding at a time. A request is outstanding
//! while it is Pending, and also after it was Approved until the next cycle
//! takes it. A grant is single-use: the cycle that takes it applies the
//! request's items at most once, whatever the outcome. Drift detected while a
//! request is outstanding never creates a second one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{AgentError, AgentResult};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A held remediation waiting for an operator decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub state: ApprovalState,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Ids of the drifted items the request covers. Empty when the handler
    /// does not report item ids.
    #[serde(default)]
    pub items: Vec<String>,
}

impl ApprovalRequest {
    fn new(description: String, items: Vec<String>, now: DateTime<Utc>) -> Self {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        Self {
            id: format!("apr-{millis:x}-{seq}"),
            description,
            created_at: now,
            state: ApprovalState::Pending,
            resolved_at: None,
            items,
        }
    }

    /// Whether the grant covers `id`.
    pub fn covers(&self, id: &str) -> bool {
        self.items.iter().any(|item| item == id)
    }

    fn resolve(&mut self, state: ApprovalState, now: DateTime<Utc>) {
        self.state = state;
        self.resolved_at = Some(now);
    }
}

/// Result of [`ApprovalWorkflow::raise`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// A new Pending request was created.
    Created(ApprovalRequest),
    /// A request is already outstanding; nothing was created.
    Outstanding { id: String },
}

#[derive(Debug, Default)]
pub struct ApprovalWorkflow {
    ttl: Option<Duration>,
    current: Option<ApprovalRequest>,
    last_resolved: Option<ApprovalRequest>,
}

impl ApprovalWorkflow {
    /// `ttl = None` means requests never expire.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            current: None,
            last_resolved: None,
        }
    }

    /// The request awaiting a decision, if any.
    pub fn pending(&self) -> Option<&ApprovalRequest> {
        self.current
            .as_ref()
            .filter(|r| r.state == ApprovalState::Pending)
    }

    pub fn pending_id(&self) -> Option<&str> {
        self.pending().map(|r| r.id.as_str())
    }

    /// True while a request is pending or approved but not yet applied.
    pub fn is_outstanding(&self) -> bool {
        self.current.is_some()
    }

    /// The approved request waiting to be applied, if any.
    pub fn granted(&self) -> Option<&ApprovalRequest> {
        self.current
            .as_ref()
            .filter(|r| r.state == ApprovalState::Approved)
    }

    /// The most recently resolved request (applied, rejected, or expired).
    pub fn last_resolved(&self) -> Option<&ApprovalRequest> {
        self.last_resolved.as_ref()
    }

    /// Ask for approval of `items`, unless a request is already outstanding.
    pub fn raise(
        &mut self,
        description: impl Into<String>,
        items: Vec<String>,
        now: DateTime<Utc>,
    ) -> RaiseOutcome {
        if let Some(current) = &self.current {
            return RaiseOutcome::Outstanding {
                id: current.id.clone(),
            };
        }
        let request = ApprovalRequest::new(description.into(), items, now);
        self.current = Some(request.clone());
        RaiseOutcome::Created(request)
    }

    /// Approve the pending request. The id must match exactly.
    pub fn approve(&mut self, id: &str, now: DateTime<Utc>) -> AgentResult<ApprovalRequest> {
        let request = self.pending_mut(id)?;
        request.resolve(ApprovalState::Approved, now);
        Ok(request.clone())
    }

    /// Reject the pending request, discarding the held changes.
    pub fn reject(&mut self, id: &str, now: DateTime<Utc>) -> AgentResult<ApprovalRequest> {
        let request = self.pending_mut(id)?;
        request.resolve(ApprovalState::Rejected, now);
        let resolved = request.clone();
        self.current = None;
        self.last_resolved = Some(resolved.clone());
        Ok(resolved)
    }

    /// Expire the pending request once its ttl has elapsed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<ApprovalRequest> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        let request = self.current.as_mut()?;
        if request.state != ApprovalState::Pending || now - request.created_at < ttl {
            return None;
        }
        request.resolve(ApprovalState::Expired, now);
        let expired = request.clone();
        self.current = None;
        self.last_resolved = Some(expired.clone());
        Some(expired)
    }

    /// Consume an approved request, freeing the slot. The caller may apply
    /// the returned request's items once.
    pub fn take_approved(&mut self) -> Option<ApprovalRequest> {
        self.granted()?;
        let request = self.current.take()?;
        self.last_resolved = Some(request.clone());
        Some(request)
    }

    fn pending_mut(&mut self, id: &str) -> AgentResult<&mut ApprovalRequest> {
        match self.current.as_mut() {
            Some(r) if r.state == ApprovalState::Pending && r.id == id => Ok(r),
            _ => Err(AgentError::ApprovalNotFound { id: id.to_string() }),
        }
    }
}
