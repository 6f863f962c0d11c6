//! Bringing the external role into line with the active set.
//!
//! The plan is computed once from a single snapshot; every operation is then
//! applied on its own so one member's failure never stops the rest.

use crate::error::{ActivityError, Result};
use crate::retry::RetryPolicy;
use crate::types::{ActiveSet, Identity};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Who holds the role, as seen at one moment.
pub type RoleState = BTreeMap<Identity, bool>;

// ---------------------------------------------------------------------------
// RoleSystem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoleSystemError {
    #[error("identity not found")]
    NotFound,

    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("rejected: {0}")]
    Rejected(String),
}

impl RoleSystemError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// `Some(hint)` when another attempt may succeed.
    pub fn retry_hint(&self) -> Option<Option<Duration>> {
        match self {
            Self::Transient { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// The external system that owns role membership.
///
/// `grant` and `revoke` must succeed when the member is already in the
/// requested state.
pub trait RoleSystem {
    /// Current membership. `hint` lists the identities the caller is about to
    /// compare against; systems that match handles loosely use it to key the
    /// snapshot with the caller's spelling.
    fn snapshot(&self, hint: &BTreeSet<Identity>) -> std::result::Result<RoleState, RoleSystemError>;
    fn grant(&self, identity: &Identity) -> std::result::Result<(), RoleSystemError>;
    fn revoke(&self, identity: &Identity) -> std::result::Result<(), RoleSystemError>;

    /// Members the last snapshot could not key on their own, and which the
    /// plan therefore never touches.
    fn unresolved(&self) -> Vec<UnresolvedMember> {
        Vec::new()
    }
}

/// A member whose handle collided with another member's in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedMember {
    pub handle: Identity,
    pub member_id: String,
    pub has_role: bool,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "identity", rename_all = "snake_case")]
pub enum RoleOperation {
    Grant(Identity),
    Revoke(Identity),
}

impl RoleOperation {
    pub fn identity(&self) -> &Identity {
        match self {
            RoleOperation::Grant(i) | RoleOperation::Revoke(i) => i,
        }
    }
}

impl fmt::Display for RoleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleOperation::Grant(i) => write!(f, "grant {i}"),
            RoleOperation::Revoke(i) => write!(f, "revoke {i}"),
        }
    }
}

/// Grants first, then revokes, each in identity order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ReconciliationPlan {
    operations: Vec<RoleOperation>,
}

impl ReconciliationPlan {
    pub fn operations(&self) -> &[RoleOperation] {
        &self.operations
    }

    pub fn grants(&self) -> impl Iterator<Item = &Identity> {
        self.operations.iter().filter_map(|op| match op {
            RoleOperation::Grant(i) => Some(i),
            RoleOperation::Revoke(_) => None,
        })
    }

    pub fn revokes(&self) -> impl Iterator<Item = &Identity> {
        self.operations.iter().filter_map(|op| match op {
            RoleOperation::Revoke(i) => Some(i),
            RoleOperation::Grant(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Grant = active − holders, Revoke = holders − active.
pub fn plan(active: &ActiveSet, state: &RoleState) -> ReconciliationPlan {
    let holders: BTreeSet<&Identity> = state
        .iter()
        .filter(|(_, has)| **has)
        .map(|(i, _)| i)
        .collect();

    let grants = active
        .iter()
        .filter(|i| !holders.contains(i))
        .map(|i| RoleOperation::Grant(i.clone()));
    let revokes = holders
        .iter()
        .copied()
        .filter(|i| !active.contains(*i))
        .map(|i| RoleOperation::Revoke(i.clone()));

    ReconciliationPlan {
        operations: grants.chain(revokes).collect(),
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    IdentityNotFound,
    RetriesExhausted { attempts: u32, last_error: String },
    Rejected { message: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::IdentityNotFound => f.write_str("identity not found"),
            SkipReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            SkipReason::Rejected { message } => write!(f, "rejected: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedOperation {
    pub operation: RoleOperation,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub granted: Vec<Identity>,
    pub revoked: Vec<Identity>,
    pub skipped: Vec<SkippedOperation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<UnresolvedMember>,
}

impl ReconcileReport {
    /// Nothing was skipped and no role holder was left unresolved.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && !self.unresolved.iter().any(|m| m.has_role)
    }
}

/// Fetch the snapshot the plan is computed from, retrying transient failures.
pub fn fetch_snapshot(
    system: &dyn RoleSystem,
    hint: &BTreeSet<Identity>,
    policy: &RetryPolicy,
) -> Result<RoleState> {
    let (result, attempts) = policy.run(|| system.snapshot(hint), RoleSystemError::retry_hint);
    result.map_err(|e| ActivityError::Snapshot(format!("{e} (after {attempts} attempt(s))")))
}

/// Apply every operation in `plan`, recording rather than propagating
/// per-operation failures.
pub fn execute(
    plan: &ReconciliationPlan,
    system: &dyn RoleSystem,
    policy: &RetryPolicy,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        unresolved: system.unresolved(),
        ..ReconcileReport::default()
    };

    for op in plan.operations() {
        let (result, attempts) = policy.run(
            || match op {
                RoleOperation::Grant(i) => system.grant(i),
                RoleOperation::Revoke(i) => system.revoke(i),
            },
            RoleSystemError::retry_hint,
        );

        match result {
            Ok(()) => {
                tracing::info!(%op, attempts, "applied");
                match op {
                    RoleOperation::Grant(i) => report.granted.push(i.clone()),
                    RoleOperation::Revoke(i) => report.revoked.push(i.clone()),
                }
            }
            Err(e) => {
                let reason = match e {
                    RoleSystemError::NotFound => SkipReason::IdentityNotFound,
                    RoleSystemError::Transient { message, .. } => SkipReason::RetriesExhausted {
                        attempts,
                        last_error: message,
                    },
                    RoleSystemError::Rejected(message) => SkipReason::Rejected { message },
                };
                tracing::warn!(%op, %reason, "skipped");
                report.skipped.push(SkippedOperation {
                    operation: op.clone(),
                    reason,
                });
            }
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
