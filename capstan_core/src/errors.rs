//! The reconciler's error taxonomy.
//!
//! The propagation policy is layered: errors local to one entity, asset,
//! or namespace become [`Skip`]s in the cycle report; component-level
//! errors fail that component for the cycle and fall back to the last
//! persisted good input; a cycle only no-ops outright when every input is
//! unavailable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{AssetKey, Namespace, Role};

/// Failure fetching from the identity provider. Fails the fetcher for the
/// whole cycle: partial pages are discarded and the prior snapshot is used.
#[derive(Debug, Error)]
pub enum IdentitySourceError {
    /// The provider could not be reached or returned a transport-level
    /// failure.
    #[error("identity provider request failed: {0}")]
    Transport(String),
    /// The provider rejected the credentials.
    #[error("identity provider authentication failed: {0}")]
    Auth(String),
    /// The provider responded with something the client could not parse.
    #[error("unexpected identity provider response: {0}")]
    Protocol(String),
}

/// A structural problem with the asset manifest. Fail-closed: any one bad
/// entry rejects the whole manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid manifest: {field}: {reason}")]
pub struct ManifestValidationError {
    /// Path of the offending field, e.g. `assets[2].permission`.
    pub field: String,
    /// Why the field was rejected.
    pub reason: String,
}

/// Failure reading one namespace's state from the target system. Excludes
/// that namespace from the cycle; the rest proceed.
#[derive(Debug, Error)]
pub enum TargetReadError {
    /// The target could not be reached or answered with a server error.
    #[error("target read failed: {0}")]
    Unavailable(String),
    /// The target rejected the reconciler's credentials for this read.
    #[error("target denied read access: {0}")]
    PermissionDenied(String),
    /// The target responded with something the client could not parse.
    #[error("unexpected target response: {0}")]
    Protocol(String),
}

/// Failure applying one operation to the target system.
///
/// The apply engine retries retryable variants with bounded backoff and
/// absorbs `AlreadyExists`/`NotFound` where the operation's intent is
/// already satisfied.
#[derive(Debug, Clone, Error)]
pub enum TargetApplyError {
    /// The target asked the client to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The request timed out.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The target answered with a transient server error.
    #[error("target unavailable: {0}")]
    Unavailable(String),
    /// The entity being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The entity being modified or removed does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The target rejected the reconciler's credentials for this write.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The target rejected the request as malformed.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// Anything else; treated as terminal.
    #[error("target apply failed: {0}")]
    Other(String),
}

impl TargetApplyError {
    /// Whether the apply engine should retry the operation.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TargetApplyError::RateLimited(_)
                | TargetApplyError::Timeout(_)
                | TargetApplyError::Unavailable(_)
        )
    }
}

/// Failure in the snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored document failed to (de)serialize.
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A cycle-level outcome that prevents reconciliation from running at all.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Another cycle holds the lease.
    #[error("a cycle is already in progress (lease {holder} expires at {expires_unix})")]
    InProgress {
        /// The lease holder's id.
        holder: String,
        /// Unix timestamp at which the lease lapses.
        expires_unix: i64,
    },
    /// Neither a usable identity snapshot nor a usable manifest was
    /// available; last-known-good state is preserved by doing nothing.
    #[error("no usable inputs; cycle is a no-op")]
    NoInputs,
    /// The snapshot store itself failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A per-entity item excluded from a cycle, carried into the cycle report
/// so nothing is dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Skip {
    /// A user matched more than one role group under the reject policy.
    #[error("user {username}: ambiguous role groups {matched:?}")]
    AmbiguousRole {
        /// The namespace the user would have landed in.
        namespace: Namespace,
        /// The user's name.
        username: String,
        /// Every role the user's groups mapped to.
        matched: Vec<Role>,
    },
    /// An asset grant referenced a group that is not part of desired state.
    #[error("asset {asset}: grant references unknown group {group}")]
    UnknownGroupReference {
        /// The asset whose grant was skipped.
        asset: AssetKey,
        /// The unresolved group name.
        group: String,
    },
    /// A governed asset does not exist in the target system.
    #[error("asset {asset}: not present in target system")]
    AssetNotFound {
        /// The missing asset.
        asset: AssetKey,
    },
    /// A namespace could not be read this cycle and was excluded.
    #[error("namespace {namespace}: unreadable this cycle: {reason}")]
    NamespaceUnavailable {
        /// The namespace that was skipped.
        namespace: Namespace,
        /// Why the read failed.
        reason: String,
    },
}
