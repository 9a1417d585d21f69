//! Snapshot persistence: the object-store key layout, the filesystem
//! backend, and the cycle lease.
//!
//! The well-known keys are a fixed, documented convention shared with the
//! administrator: the asset manifest is dropped at `asset-governance.json`
//! and the latest identity snapshot is published at
//! `user-governance.json`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connectors::ObjectStore;
use crate::errors::{CycleError, StoreError};
use crate::fetch::IdentitySnapshot;
use crate::logging::debug;

/// Latest identity snapshot (stable contract).
pub const USER_GOVERNANCE_KEY: &str = "user-governance.json";
/// Administrator manifest intake (stable contract).
pub const ASSET_GOVERNANCE_KEY: &str = "asset-governance.json";
/// Last manifest that passed validation.
pub const VALIDATED_MANIFEST_KEY: &str = "asset-governance.validated.json";
/// The cycle lease.
pub const LEASE_KEY: &str = "cycle.lease";
/// Timestamped identity snapshots.
pub const USER_SNAPSHOT_PREFIX: &str = "snapshots/users/";
/// Per-cycle reports.
pub const REPORT_PREFIX: &str = "reports/";

/// Filesystem-backed object store rooted at a project's data directory.
/// Keys map to relative paths, so the layout matches any bucket-shaped
/// backend.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// A held cycle lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The holder's id for this cycle.
    pub holder: String,
    /// Unix timestamp at which the lease lapses on its own.
    pub expires_unix: i64,
}

/// Typed access to everything the reconciler persists, layered over any
/// [`ObjectStore`].
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
}

impl SnapshotStore {
    /// Wrap an object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Persist a fresh identity snapshot under the cycle timestamp and
    /// publish it at the well-known latest key.
    pub async fn write_identity_snapshot(
        &self,
        cycle_unix: i64,
        snapshot: &IdentitySnapshot,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        self.store
            .put(&format!("{USER_SNAPSHOT_PREFIX}{cycle_unix}.json"), bytes.clone())
            .await?;
        self.store.put(USER_GOVERNANCE_KEY, bytes).await
    }

    /// The latest persisted identity snapshot, if any.
    pub async fn load_identity_snapshot(&self) -> Result<Option<IdentitySnapshot>, StoreError> {
        match self.store.get(USER_GOVERNANCE_KEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The raw administrator manifest, if one has been dropped off.
    pub async fn load_manifest_raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(ASSET_GOVERNANCE_KEY).await
    }

    /// Persist the last-known-good manifest after it passed validation.
    pub async fn write_validated_manifest(&self, raw: &[u8]) -> Result<(), StoreError> {
        self.store.put(VALIDATED_MANIFEST_KEY, raw.to_vec()).await
    }

    /// The last manifest that passed validation, if any.
    pub async fn load_validated_manifest(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(VALIDATED_MANIFEST_KEY).await
    }

    /// Persist a cycle report under the cycle timestamp.
    pub async fn write_report<T: Serialize + Sync>(
        &self,
        cycle_unix: i64,
        report: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(report)?;
        self.store
            .put(&format!("{REPORT_PREFIX}{cycle_unix}.json"), bytes)
            .await
    }

    /// Keys of all persisted cycle reports.
    pub async fn list_reports(&self) -> Result<Vec<String>, StoreError> {
        self.store.list(REPORT_PREFIX).await
    }

    /// Take the cycle lease, or fail with [`CycleError::InProgress`] if an
    /// unexpired lease is held. An expired lease is reclaimed so a crashed
    /// cycle cannot deadlock future cycles.
    pub async fn acquire_lease(
        &self,
        ttl_secs: i64,
        now_unix: i64,
    ) -> Result<Lease, CycleError> {
        if let Some(bytes) = self.store.get(LEASE_KEY).await? {
            if let Ok(existing) = serde_json::from_slice::<Lease>(&bytes) {
                if existing.expires_unix > now_unix {
                    return Err(CycleError::InProgress {
                        holder: existing.holder,
                        expires_unix: existing.expires_unix,
                    });
                }
                debug!(
                    "reclaiming lapsed lease {} (expired {})",
                    existing.holder, existing.expires_unix
                );
            }
        }
        let lease = Lease {
            holder: Uuid::new_v4().to_string(),
            expires_unix: now_unix + ttl_secs,
        };
        self.store
            .put(LEASE_KEY, serde_json::to_vec(&lease).map_err(StoreError::from)?)
            .await?;
        Ok(lease)
    }

    /// Lapse a held lease so the next trigger can run immediately.
    pub async fn release_lease(&self, lease: &Lease, now_unix: i64) -> Result<(), StoreError> {
        let lapsed = Lease {
            holder: lease.holder.clone(),
            expires_unix: now_unix,
        };
        self.store.put(LEASE_KEY, serde_json::to_vec(&lapsed)?).await
    }
}

/// In-memory object store for tests and dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: std::sync::Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.objects
            .lock()
            .expect("store poisoned")
            .insert(key.to_owned(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .objects
            .lock()
            .expect("store poisoned")
            .get(key)
            .cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .expect("store poisoned")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::User;

    fn temp_store() -> FsObjectStore {
        FsObjectStore::new(
            std::env::temp_dir().join(format!("capstan-test-{}", Uuid::new_v4())),
        )
    }

    fn snapshot() -> IdentitySnapshot {
        IdentitySnapshot {
            users: vec![User {
                username: "qs1@example.com".to_owned(),
                email: "qs1@example.com".to_owned(),
                groups: ["qs_role_admin".to_owned()].into(),
            }],
        }
    }

    #[tokio::test]
    async fn fs_store_round_trips_and_lists() -> anyhow::Result<()> {
        let store = temp_store();
        store.put("snapshots/users/1.json", b"one".to_vec()).await?;
        store.put("snapshots/users/2.json", b"two".to_vec()).await?;
        store.put("reports/1.json", b"r".to_vec()).await?;

        assert_eq!(store.get("snapshots/users/1.json").await?, Some(b"one".to_vec()));
        assert_eq!(store.get("missing.json").await?, None);
        assert_eq!(
            store.list(USER_SNAPSHOT_PREFIX).await?,
            vec![
                "snapshots/users/1.json".to_owned(),
                "snapshots/users/2.json".to_owned()
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn identity_snapshot_round_trips() -> anyhow::Result<()> {
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        store.write_identity_snapshot(1700000000, &snapshot()).await?;

        let loaded = store.load_identity_snapshot().await?;
        assert_eq!(loaded, Some(snapshot()));
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_contract_shape_is_stable() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryObjectStore::new());
        let store = SnapshotStore::new(memory.clone());
        store.write_identity_snapshot(1700000000, &snapshot()).await?;

        let raw = memory.get(USER_GOVERNANCE_KEY).await?.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw)?;
        assert_eq!(doc["users"][0]["username"], "qs1@example.com");
        assert_eq!(doc["users"][0]["groups"][0], "qs_role_admin");
        Ok(())
    }

    #[tokio::test]
    async fn lease_blocks_until_released() -> anyhow::Result<()> {
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));

        let lease = store.acquire_lease(600, 1000).await?;
        let err = store.acquire_lease(600, 1001).await.unwrap_err();
        assert!(matches!(err, CycleError::InProgress { .. }));

        store.release_lease(&lease, 1002).await?;
        assert!(store.acquire_lease(600, 1002).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn lapsed_lease_is_reclaimed() -> anyhow::Result<()> {
        let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()));

        store.acquire_lease(600, 1000).await?;
        // TTL has passed without a release: a crashed cycle cannot
        // deadlock the loop.
        assert!(store.acquire_lease(600, 1601).await.is_ok());
        Ok(())
    }
}
