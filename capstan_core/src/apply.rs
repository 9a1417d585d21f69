//! The apply engine: executes an edit set against the target system.
//!
//! Operations run in differ order. Consecutive operations of the same
//! phase and tier have no dependencies on each other and are dispatched
//! concurrently up to a bounded pool; stage boundaries are the only
//! sequencing points. Each operation independently retries transient
//! target errors with bounded exponential backoff; terminal errors fail
//! that operation alone and the engine moves on.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::connectors::TargetAdmin;
use crate::diff::{EditSet, OpKind, Operation, Phase};
use crate::errors::{Skip, TargetApplyError};
use crate::logging::{debug, warn};

const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Tuning for one apply run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum concurrently dispatched operations within a stage.
    pub concurrency: usize,
    /// Retry budget per operation for transient errors.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt up to a fixed cap.
    pub base_backoff: Duration,
    /// Past this instant no new operations are dispatched; in-flight
    /// operations are allowed to finish.
    pub deadline: Option<Instant>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            deadline: None,
        }
    }
}

/// An operation the target rejected with a terminal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOp {
    /// The operation that failed.
    pub op: Operation,
    /// The target's error.
    pub error: String,
    /// Whether the error class is retryable (the retry budget was
    /// exhausted) as opposed to terminal.
    pub retryable: bool,
}

/// The terminal artifact of an apply run: every operation accounted for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Operations that succeeded (including those absorbed as already
    /// satisfied).
    pub succeeded: Vec<Operation>,
    /// Operations that failed.
    pub failed: Vec<FailedOp>,
    /// Operations never dispatched because the deadline passed.
    pub not_attempted: Vec<Operation>,
    /// Items excluded before apply, with reasons.
    pub skips: Vec<Skip>,
}

impl ApplyReport {
    /// Whether every dispatched operation succeeded and none were cut off.
    pub fn clean(&self) -> bool {
        self.failed.is_empty() && self.not_attempted.is_empty()
    }
}

/// Execute an edit set. Never aborts early on per-operation failure; the
/// report accounts for every operation either way.
pub async fn apply(
    edit_set: EditSet,
    target: &dyn TargetAdmin,
    opts: &ApplyOptions,
) -> ApplyReport {
    let mut report = ApplyReport {
        skips: edit_set.skips,
        ..Default::default()
    };

    for stage in stages(edit_set.ops) {
        if past_deadline(opts) {
            warn!(
                "cycle deadline exceeded; {} operation(s) not attempted",
                stage.len()
            );
            report.not_attempted.extend(stage);
            continue;
        }

        let results: Vec<(Operation, Result<(), TargetApplyError>)> =
            futures::stream::iter(stage.into_iter().map(|op| async move {
                let res = apply_op(&op, target, opts).await;
                (op, res)
            }))
            .buffer_unordered(opts.concurrency.max(1))
            .collect()
            .await;

        for (op, res) in results {
            match res {
                Ok(()) => report.succeeded.push(op),
                Err(e) => {
                    warn!("operation failed: {op}: {e}");
                    report.failed.push(FailedOp {
                        retryable: e.retryable(),
                        error: e.to_string(),
                        op,
                    });
                }
            }
        }
    }

    report
}

/// Group ordered operations into dependency stages: consecutive runs of
/// the same (phase, tier) are mutually independent.
fn stages(ops: Vec<Operation>) -> Vec<Vec<Operation>> {
    let mut res: Vec<Vec<Operation>> = Vec::new();
    for op in ops {
        match res.last_mut() {
            Some(stage)
                if stage
                    .first()
                    .map(|first| (first.phase, first.tier()) == (op.phase, op.tier()))
                    .unwrap_or(false) =>
            {
                stage.push(op)
            }
            _ => res.push(vec![op]),
        }
    }
    res
}

fn past_deadline(opts: &ApplyOptions) -> bool {
    opts.deadline
        .map(|deadline| Instant::now() >= deadline)
        .unwrap_or(false)
}

async fn apply_op(
    op: &Operation,
    target: &dyn TargetAdmin,
    opts: &ApplyOptions,
) -> Result<(), TargetApplyError> {
    let mut attempt = 0u32;
    loop {
        match dispatch(op, target).await {
            Ok(()) => return Ok(()),
            Err(e) if absorbed(op, &e) => {
                // The operation's intent is already satisfied; a race with
                // a concurrent administrative change is success, not error.
                debug!("absorbed as already satisfied: {op}: {e}");
                return Ok(());
            }
            Err(e) if e.retryable() && attempt < opts.max_retries => {
                attempt += 1;
                let delay = backoff(opts.base_backoff, attempt);
                debug!("retrying ({attempt}/{}) after {delay:?}: {op}: {e}", opts.max_retries);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn absorbed(op: &Operation, e: &TargetApplyError) -> bool {
    matches!(
        (op.phase, e),
        (Phase::Create, TargetApplyError::AlreadyExists(_))
            | (Phase::Delete, TargetApplyError::NotFound(_))
    )
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << (attempt - 1).min(16)).min(BACKOFF_CAP)
}

async fn dispatch(op: &Operation, target: &dyn TargetAdmin) -> Result<(), TargetApplyError> {
    let ns = &op.namespace;
    match &op.kind {
        OpKind::EnsureNamespace => target.create_namespace(ns).await,
        OpKind::CreateGroup { group } => target.create_group(ns, group).await,
        OpKind::DeleteGroup { group } => target.delete_group(ns, group).await,
        OpKind::CreateUser {
            username,
            email,
            role,
        } => target.create_user(ns, username, email, *role).await,
        OpKind::SetUserRole { username, role } => {
            target.set_user_role(ns, username, *role).await
        }
        OpKind::RetireUser { username } => target.retire_user(ns, username).await,
        OpKind::DeleteUser { username } => target.delete_user(ns, username).await,
        OpKind::AddMember { group, username } => target.add_member(ns, group, username).await,
        OpKind::RemoveMember { group, username } => {
            target.remove_member(ns, group, username).await
        }
        OpKind::SetGrant {
            asset,
            group,
            level,
        } => target.set_asset_grant(asset, group, *level).await,
        OpKind::RevokeGrant { asset, group } => target.revoke_asset_grant(asset, group).await,
    }
}
