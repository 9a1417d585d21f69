//! One reconciliation cycle, end to end.
//!
//! A cycle is stateless given the persisted snapshots and the target's
//! observed state: take the lease, gather inputs (concurrently, each with
//! a last-known-good fallback), build desired state, read actual state,
//! diff, apply, persist the report, release the lease. Cycles never
//! overlap; the lease is the only shared mutable resource between them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::apply::{self, ApplyOptions, ApplyReport};
use crate::config::CapstanConfig;
use crate::connectors::{IdentitySource, TargetAdmin};
use crate::desired;
use crate::diff::{self, GlobalDiffs};
use crate::errors::{CycleError, StoreError};
use crate::fetch::{self, IdentitySnapshot};
use crate::logging::{info, warn};
use crate::state::Asset;
use crate::store::SnapshotStore;
use crate::{actual, manifest};

/// The external collaborators a cycle runs against.
pub struct CycleDeps<'a> {
    /// The identity provider.
    pub identity: &'a dyn IdentitySource,
    /// The target system's admin interface.
    pub target: &'a dyn TargetAdmin,
    /// Snapshot persistence.
    pub store: &'a SnapshotStore,
}

/// Where one of the cycle's inputs came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum InputOutcome {
    /// Fetched fresh this cycle.
    Fresh,
    /// The fresh fetch failed; the last persisted good copy was used.
    Fallback {
        /// Why the fresh input was unusable.
        reason: String,
    },
    /// No usable data at all, fresh or persisted.
    Unavailable {
        /// Why the input was unavailable.
        reason: String,
    },
}

/// The persisted record of one cycle: inputs, skips, and the fate of
/// every operation. A cycle always produces a report, even when it
/// no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Unique id for this cycle.
    pub cycle_id: String,
    /// Unix timestamp when the cycle started.
    pub started_unix: i64,
    /// Unix timestamp when the cycle finished.
    pub finished_unix: i64,
    /// Where the identity snapshot came from.
    pub identity: InputOutcome,
    /// Where the asset manifest came from.
    pub manifest: InputOutcome,
    /// The apply outcome, absent when the cycle no-oped.
    pub apply: Option<ApplyReport>,
    /// Why reconciliation was skipped entirely, if it was.
    pub no_op_reason: Option<String>,
}

/// Run one lease-guarded reconciliation cycle and persist its report.
pub async fn run_cycle(
    deps: &CycleDeps<'_>,
    config: &CapstanConfig,
) -> Result<CycleReport, CycleError> {
    let started_unix = OffsetDateTime::now_utc().unix_timestamp();
    let lease = deps
        .store
        .acquire_lease(config.cycle.lease_ttl_secs, started_unix)
        .await?;

    let result = reconcile(deps, config, started_unix).await;

    let finished_unix = OffsetDateTime::now_utc().unix_timestamp();
    if let Err(e) = deps.store.release_lease(&lease, finished_unix).await {
        warn!("failed to release cycle lease: {e}");
    }

    let mut report = result?;
    report.finished_unix = finished_unix;
    deps.store.write_report(started_unix, &report).await?;

    match (&report.apply, &report.no_op_reason) {
        (Some(apply), _) => info!(
            "cycle {}: {} succeeded, {} failed, {} skipped, {} not attempted",
            report.cycle_id,
            apply.succeeded.len(),
            apply.failed.len(),
            apply.skips.len(),
            apply.not_attempted.len()
        ),
        (None, Some(reason)) => info!("cycle {}: no-op: {reason}", report.cycle_id),
        (None, None) => {}
    }
    Ok(report)
}

/// Compute the diffs a cycle would apply, without taking the lease or
/// applying anything. The identity fetch (and its snapshot write) still
/// happens, falling back to the persisted snapshot on failure.
pub async fn plan(
    deps: &CycleDeps<'_>,
    config: &CapstanConfig,
) -> Result<GlobalDiffs, CycleError> {
    let now_unix = OffsetDateTime::now_utc().unix_timestamp();
    let (identity_res, manifest_res) = tokio::join!(
        gather_identity(deps, config, now_unix),
        gather_manifest(deps)
    );
    let (snapshot, _) = identity_res?;
    let (assets, _) = manifest_res?;

    let snapshot = snapshot.ok_or(CycleError::NoInputs)?;
    let groups = snapshot.groups(&config.identity);
    let desired = desired::build(&snapshot.users, &groups, &assets, config);
    let actual = actual::read(deps.target, &desired).await;
    Ok(diff::get_diffs(&desired, &actual, config))
}

async fn reconcile(
    deps: &CycleDeps<'_>,
    config: &CapstanConfig,
    started_unix: i64,
) -> Result<CycleReport, CycleError> {
    let (identity_res, manifest_res) = tokio::join!(
        gather_identity(deps, config, started_unix),
        gather_manifest(deps)
    );
    let (snapshot, identity_outcome) = identity_res?;
    let (assets, manifest_outcome) = manifest_res?;

    let mut report = CycleReport {
        cycle_id: Uuid::new_v4().to_string(),
        started_unix,
        finished_unix: started_unix,
        identity: identity_outcome,
        manifest: manifest_outcome,
        apply: None,
        no_op_reason: None,
    };

    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => {
            // No identity data at all. "No data" must never be read as
            // "desired = empty", so the whole differ run is skipped and
            // last-known-good state is left untouched.
            report.no_op_reason = Some(
                "identity source unavailable and no prior snapshot; skipping reconciliation"
                    .to_owned(),
            );
            return Ok(report);
        }
    };

    let groups = snapshot.groups(&config.identity);
    let desired = desired::build(&snapshot.users, &groups, &assets, config);
    let actual = actual::read(deps.target, &desired).await;
    let edit_set = diff::get_diffs(&desired, &actual, config).into_edit_set();

    let opts = ApplyOptions {
        concurrency: config.cycle.apply_concurrency,
        max_retries: config.cycle.max_retries,
        deadline: Some(Instant::now() + Duration::from_secs(config.cycle.deadline_secs)),
        ..Default::default()
    };
    report.apply = Some(apply::apply(edit_set, deps.target, &opts).await);
    Ok(report)
}

async fn gather_identity(
    deps: &CycleDeps<'_>,
    config: &CapstanConfig,
    cycle_unix: i64,
) -> Result<(Option<IdentitySnapshot>, InputOutcome), StoreError> {
    match fetch::fetch_identity(deps.identity, &config.identity).await {
        Ok(snapshot) => {
            deps.store
                .write_identity_snapshot(cycle_unix, &snapshot)
                .await?;
            Ok((Some(snapshot), InputOutcome::Fresh))
        }
        Err(e) => {
            warn!("identity fetch failed, falling back to prior snapshot: {e}");
            match deps.store.load_identity_snapshot().await? {
                Some(snapshot) => Ok((
                    Some(snapshot),
                    InputOutcome::Fallback {
                        reason: e.to_string(),
                    },
                )),
                None => Ok((
                    None,
                    InputOutcome::Unavailable {
                        reason: e.to_string(),
                    },
                )),
            }
        }
    }
}

async fn gather_manifest(
    deps: &CycleDeps<'_>,
) -> Result<(Vec<Asset>, InputOutcome), StoreError> {
    let fresh_failure = match deps.store.load_manifest_raw().await? {
        Some(raw) => match manifest::load(&raw) {
            Ok(assets) => {
                deps.store.write_validated_manifest(&raw).await?;
                return Ok((assets, InputOutcome::Fresh));
            }
            // Fail closed: a malformed manifest must not apply anything.
            Err(e) => e.to_string(),
        },
        None => "no manifest present at intake key".to_owned(),
    };

    warn!("manifest unusable, falling back to last validated copy: {fresh_failure}");
    match deps.store.load_validated_manifest().await? {
        Some(raw) => match manifest::load(&raw) {
            Ok(assets) => Ok((
                assets,
                InputOutcome::Fallback {
                    reason: fresh_failure,
                },
            )),
            Err(e) => {
                warn!("last validated manifest no longer parses: {e}");
                Ok((
                    Vec::new(),
                    InputOutcome::Unavailable {
                        reason: fresh_failure,
                    },
                ))
            }
        },
        None => Ok((
            Vec::new(),
            InputOutcome::Unavailable {
                reason: fresh_failure,
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ObjectStore;
    use crate::diff::OpKind;
    use crate::errors::Skip;
    use crate::state::{Namespace, Role};
    use crate::store::{MemoryObjectStore, ASSET_GOVERNANCE_KEY};
    use crate::test_util::{MemoryIdentity, MemoryTarget};
    use std::sync::Arc;

    const MANIFEST: &[u8] = br#"{"assets":[{
        "name": "dataset_example_1",
        "category": "dataset",
        "namespace": "default",
        "groups": ["qs_group_finance"],
        "permission": "READ"
    }]}"#;

    fn scenario_identity() -> MemoryIdentity {
        MemoryIdentity::new()
            .with_group("g1", "qs_role_admin", &[("qs1@example.com", "qs1@example.com")])
            .with_group("g2", "qs_role_author", &[("qs4@example.com", "qs4@example.com")])
    }

    #[tokio::test]
    async fn scenario_creates_users_and_skips_unknown_group_grant() -> anyhow::Result<()> {
        let identity = scenario_identity();
        let target = MemoryTarget::new();
        let memory = Arc::new(MemoryObjectStore::new());
        memory.put(ASSET_GOVERNANCE_KEY, MANIFEST.to_vec()).await?;
        let store = SnapshotStore::new(memory);
        let config = CapstanConfig::new();

        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };

        let report = run_cycle(&deps, &config).await?;
        let apply = report.apply.expect("cycle ran");

        // qs1 registered as ADMIN, qs4 as AUTHOR, in a freshly created
        // default namespace
        assert!(target.has_namespace("default"));
        assert_eq!(
            target.user_role("default", "qs1@example.com"),
            Some(Role::Admin)
        );
        assert_eq!(
            target.user_role("default", "qs4@example.com"),
            Some(Role::Author)
        );

        // the finance grant was skipped, not silently dropped: no user
        // belongs to qs_group_finance
        assert!(apply.skips.iter().any(|s| matches!(
            s,
            Skip::UnknownGroupReference { group, .. } if group == "qs_group_finance"
        )));
        assert!(apply.failed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn a_converged_target_produces_an_empty_second_cycle() -> anyhow::Result<()> {
        let identity = scenario_identity();
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let config = CapstanConfig::new();
        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };

        run_cycle(&deps, &config).await?;
        let state_after_first = target.snapshot();

        let second = run_cycle(&deps, &config).await?;
        let apply = second.apply.expect("cycle ran");

        assert!(apply.succeeded.is_empty());
        assert!(apply.failed.is_empty());
        assert_eq!(target.snapshot(), state_after_first);
        Ok(())
    }

    #[tokio::test]
    async fn identity_outage_falls_back_to_prior_snapshot() -> anyhow::Result<()> {
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let config = CapstanConfig::new();

        // first cycle with a healthy provider persists the snapshot
        let healthy = scenario_identity();
        let deps = CycleDeps {
            identity: &healthy,
            target: &target,
            store: &store,
        };
        run_cycle(&deps, &config).await?;

        // provider goes dark; the persisted snapshot still drives the loop
        let dark = MemoryIdentity::failing();
        let deps = CycleDeps {
            identity: &dark,
            target: &target,
            store: &store,
        };
        let report = run_cycle(&deps, &config).await?;

        assert!(matches!(report.identity, InputOutcome::Fallback { .. }));
        assert!(report.apply.is_some());
        assert_eq!(
            target.user_role("default", "qs1@example.com"),
            Some(Role::Admin)
        );
        Ok(())
    }

    #[tokio::test]
    async fn no_inputs_at_all_is_a_reported_no_op() -> anyhow::Result<()> {
        let dark = MemoryIdentity::failing();
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let config = CapstanConfig::new();
        let deps = CycleDeps {
            identity: &dark,
            target: &target,
            store: &store,
        };

        let report = run_cycle(&deps, &config).await?;

        assert!(report.apply.is_none());
        assert!(report.no_op_reason.is_some());
        assert!(matches!(report.identity, InputOutcome::Unavailable { .. }));
        // nothing was touched
        assert!(!target.has_namespace("default"));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_manifest_falls_back_and_applies_no_assets() -> anyhow::Result<()> {
        let identity = scenario_identity();
        let target = MemoryTarget::new();
        let memory = Arc::new(MemoryObjectStore::new());
        memory
            .put(ASSET_GOVERNANCE_KEY, br#"{"assets":[{"name":"x"}]}"#.to_vec())
            .await?;
        let store = SnapshotStore::new(memory);
        let config = CapstanConfig::new();
        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };

        let report = run_cycle(&deps, &config).await?;

        // fail-closed: no validated fallback exists, so zero assets were
        // applied; user reconciliation still ran
        assert!(matches!(report.manifest, InputOutcome::Unavailable { .. }));
        assert_eq!(
            target.user_role("default", "qs1@example.com"),
            Some(Role::Admin)
        );
        Ok(())
    }

    #[tokio::test]
    async fn a_held_lease_suppresses_the_cycle() -> anyhow::Result<()> {
        let identity = scenario_identity();
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let config = CapstanConfig::new();
        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let _lease = store.acquire_lease(600, now).await?;

        let err = run_cycle(&deps, &config).await.unwrap_err();
        assert!(matches!(err, CycleError::InProgress { .. }));
        assert!(!target.has_namespace("default"));
        Ok(())
    }

    #[tokio::test]
    async fn plan_reports_diffs_without_applying() -> anyhow::Result<()> {
        let identity = scenario_identity();
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let config = CapstanConfig::new();
        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };

        let diffs = plan(&deps, &config).await?;
        let edit_set = diffs.into_edit_set();

        assert!(edit_set
            .ops
            .iter()
            .any(|op| matches!(op.kind, OpKind::EnsureNamespace)));
        assert!(edit_set.ops.iter().any(|op| matches!(
            &op.kind,
            OpKind::CreateUser { username, role: Role::Admin, .. }
                if username == "qs1@example.com"
        )));
        assert!(!target.has_namespace("default"));
        Ok(())
    }

    #[tokio::test]
    async fn reports_are_persisted_per_cycle() -> anyhow::Result<()> {
        let identity = scenario_identity();
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let config = CapstanConfig::new();
        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };

        run_cycle(&deps, &config).await?;
        assert_eq!(store.list_reports().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn manifest_grants_apply_when_group_and_asset_exist() -> anyhow::Result<()> {
        let identity = scenario_identity().with_group(
            "g3",
            "qs_group_finance",
            &[("qs4@example.com", "qs4@example.com")],
        );
        let target = MemoryTarget::new();
        // the asset itself is owned externally and must already exist
        target.seed_namespace("default", |ns| ns.add_dataset("dataset_example_1"));
        let memory = Arc::new(MemoryObjectStore::new());
        memory.put(ASSET_GOVERNANCE_KEY, MANIFEST.to_vec()).await?;
        let store = SnapshotStore::new(memory);
        let config = CapstanConfig::new();
        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };

        let report = run_cycle(&deps, &config).await?;
        let apply = report.apply.expect("cycle ran");

        let key = crate::state::AssetKey {
            namespace: Namespace::default(),
            category: crate::state::AssetCategory::Dataset,
            name: "dataset_example_1".to_owned(),
        };
        assert_eq!(
            target.grant_level(&key, "qs_group_finance"),
            Some(crate::state::PermissionLevel::Read)
        );
        assert!(apply.failed.is_empty());
        assert!(apply.skips.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn vanished_users_are_retired_not_deleted_by_default() -> anyhow::Result<()> {
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let config = CapstanConfig::new();

        let both = scenario_identity();
        let deps = CycleDeps {
            identity: &both,
            target: &target,
            store: &store,
        };
        run_cycle(&deps, &config).await?;
        assert!(target.has_user("default", "qs4@example.com"));

        // qs4 drops out of the identity source
        let only_qs1 = MemoryIdentity::new().with_group(
            "g1",
            "qs_role_admin",
            &[("qs1@example.com", "qs1@example.com")],
        );
        let deps = CycleDeps {
            identity: &only_qs1,
            target: &target,
            store: &store,
        };
        run_cycle(&deps, &config).await?;

        assert_eq!(target.retired_users(), vec!["qs4@example.com".to_owned()]);
        assert!(target.deleted_users().is_empty());
        assert!(target.has_user("default", "qs1@example.com"));
        Ok(())
    }

    #[tokio::test]
    async fn delete_policy_opts_into_account_removal() -> anyhow::Result<()> {
        let target = MemoryTarget::new();
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        let mut config = CapstanConfig::new();
        config.policies.user_removal = crate::config::UserRemovalPolicy::Delete;

        let both = scenario_identity();
        let deps = CycleDeps {
            identity: &both,
            target: &target,
            store: &store,
        };
        run_cycle(&deps, &config).await?;

        let only_qs1 = MemoryIdentity::new().with_group(
            "g1",
            "qs_role_admin",
            &[("qs1@example.com", "qs1@example.com")],
        );
        let deps = CycleDeps {
            identity: &only_qs1,
            target: &target,
            store: &store,
        };
        run_cycle(&deps, &config).await?;

        assert_eq!(target.deleted_users(), vec!["qs4@example.com".to_owned()]);
        assert!(target.retired_users().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn partial_namespace_outage_reconciles_the_rest() -> anyhow::Result<()> {
        let identity = scenario_identity();
        let target = MemoryTarget::new();
        target.fail_namespace_reads("finance");
        let memory = Arc::new(MemoryObjectStore::new());
        memory
            .put(
                ASSET_GOVERNANCE_KEY,
                br#"{"assets":[{
                    "name": "budget",
                    "category": "dataset",
                    "namespace": "finance",
                    "groups": ["qs_group_finance"],
                    "permission": "READ"
                }]}"#
                    .to_vec(),
            )
            .await?;
        let store = SnapshotStore::new(memory);
        let mut config = CapstanConfig::new();
        // materialize the finance group so the finance namespace enters
        // desired state at all
        config.policies.materialize_referenced_groups = true;

        let deps = CycleDeps {
            identity: &identity,
            target: &target,
            store: &store,
        };
        let report = run_cycle(&deps, &config).await?;
        let apply = report.apply.expect("cycle ran");

        // default reconciled; finance skipped with a reason, not failed
        assert_eq!(
            target.user_role("default", "qs1@example.com"),
            Some(Role::Admin)
        );
        assert!(apply.skips.iter().any(|s| matches!(
            s,
            Skip::NamespaceUnavailable { namespace, .. }
                if namespace == &Namespace::from("finance")
        )));
        assert!(apply.failed.is_empty());
        Ok(())
    }
}
