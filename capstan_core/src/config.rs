//! Project configuration: the `capstan.yaml` file and connector
//! credentials.
//!
//! Role ambiguity, user removal, and the treatment of referenced groups
//! without members are all explicit configuration values here rather
//! than inferred behaviors.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yaml_peg::serde as yaml;

use crate::logging::debug;
use crate::state::{GroupKind, Namespace, Role};

/// Struct representing the capstan.yaml file.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct CapstanConfig {
    version: String,
    name: String,
    /// How identity-provider groups map into the target system.
    pub identity: IdentityConfig,
    /// Policy decisions for the differ and desired-state builder.
    #[serde(default)]
    pub policies: PolicyConfig,
    /// Cycle scheduling and apply-engine tuning.
    #[serde(default)]
    pub cycle: CycleConfig,
    /// The project id used to label cycle artifacts.
    #[serde(default = "new_project_id")]
    pub project_id: String,
}

/// Create a new random project id. Should only ever be called once
/// per project.
pub fn new_project_id() -> String {
    Uuid::new_v4().to_string()
}

impl CapstanConfig {
    /// New === default for this simple constructor.
    pub fn new() -> Self {
        Self {
            version: "0.1".to_owned(),
            ..Default::default()
        }
    }

    /// Use the default filepath to ingest the capstan config.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<CapstanConfig> {
        let config_raw = fs::read_to_string(&path).context("Reading file")?;
        let mut config =
            yaml::from_str::<CapstanConfig>(&config_raw).context("Deserializing config")?;
        // Rewrite any newly created fields (project_id) to the config file.
        fs::write(
            path,
            yaml::to_string(&config[0]).context("Serializing config")?,
        )
        .context("Writing file back")?;

        config.pop().ok_or_else(|| anyhow!["failed"])
    }

    /// Set the project name.
    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Get the name
    pub fn get_name(&self) -> String {
        self.name.to_owned()
    }

    /// Convert this config to a yaml string.
    pub fn to_yaml(&self) -> Result<String> {
        yaml::to_string(self).map_err(anyhow::Error::from)
    }
}

/// How provider groups are recognized and mapped.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IdentityConfig {
    /// Prefix that marks a provider group as governed. Groups without a
    /// role mapping or this prefix are ignored entirely.
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
    /// Role-mapping table: provider group name to target-system role.
    #[serde(default = "default_role_groups")]
    pub role_groups: BTreeMap<String, Role>,
    /// The namespace identity-sourced users and groups land in.
    #[serde(default)]
    pub namespace: Namespace,
}

impl IdentityConfig {
    /// Classify a provider group name under this config. `None` means the
    /// group is not governed and is dropped at normalization time.
    pub fn classify(&self, group_name: &str) -> Option<GroupKind> {
        if let Some(role) = self.role_groups.get(group_name) {
            return Some(GroupKind::Role(*role));
        }
        if group_name.starts_with(&self.group_prefix) {
            return Some(GroupKind::Governed);
        }
        None
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            group_prefix: default_group_prefix(),
            role_groups: default_role_groups(),
            namespace: Namespace::default(),
        }
    }
}

fn default_group_prefix() -> String {
    "qs_".to_owned()
}

fn default_role_groups() -> BTreeMap<String, Role> {
    [
        ("qs_role_admin".to_owned(), Role::Admin),
        ("qs_role_author".to_owned(), Role::Author),
        ("qs_role_reader".to_owned(), Role::Reader),
    ]
    .into()
}

/// What to do when a user's groups map to more than one role.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Skip the user and report the ambiguity.
    #[default]
    Reject,
    /// Resolve using the configured `role_precedence` order.
    Precedence,
}

/// What to do when a user disappears from the identity source.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRemovalPolicy {
    /// Withdraw role and group assignments but keep the account, so a
    /// transient identity-source outage cannot destroy accounts.
    #[default]
    Retire,
    /// Delete the account outright.
    Delete,
}

/// Policy decisions for the desired-state builder and differ.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PolicyConfig {
    /// Role-ambiguity handling.
    #[serde(default)]
    pub ambiguity: AmbiguityPolicy,
    /// Order consulted under `ambiguity: precedence`. First match wins.
    #[serde(default = "default_role_precedence")]
    pub role_precedence: Vec<Role>,
    /// Handling for users absent from the identity source.
    #[serde(default)]
    pub user_removal: UserRemovalPolicy,
    /// Whether a grant may reference a governed group with no resolvable
    /// members; when true the group is created empty, when false the grant
    /// is skipped and reported.
    #[serde(default)]
    pub materialize_referenced_groups: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ambiguity: AmbiguityPolicy::default(),
            role_precedence: default_role_precedence(),
            user_removal: UserRemovalPolicy::default(),
            materialize_referenced_groups: false,
        }
    }
}

fn default_role_precedence() -> Vec<Role> {
    vec![Role::Admin, Role::Author, Role::Reader]
}

/// Cycle scheduling and apply-engine tuning.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CycleConfig {
    /// Seconds between scheduled cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds after which a cycle stops dispatching new operations.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Seconds before an abandoned cycle lease lapses.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,
    /// Maximum concurrently dispatched operations within an apply stage.
    #[serde(default = "default_apply_concurrency")]
    pub apply_concurrency: usize,
    /// Retry budget per operation for transient target errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            deadline_secs: default_deadline_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            apply_concurrency: default_apply_concurrency(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_deadline_secs() -> u64 {
    240
}

fn default_lease_ttl_secs() -> i64 {
    600
}

fn default_apply_concurrency() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

/// Alias for HashMap to hold credentials information.
pub type CredentialsMap = HashMap<String, String>;

/// Fetch the credentials from the capstan connectors config.
pub fn fetch_credentials(path: PathBuf) -> Result<HashMap<String, CredentialsMap>> {
    debug!("Trying to read credentials from {:?}", path);
    let credentials_raw = fs::read_to_string(path)?;
    let mut config = yaml::from_str::<HashMap<String, CredentialsMap>>(&credentials_raw)?;

    config
        .pop()
        .ok_or_else(|| anyhow!["failed to generate credentials"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_policy_defaults() -> Result<()> {
        let raw = r#"
version: "0.1"
name: governance
identity:
  group_prefix: qs_
"#;
        let cfg = yaml::from_str::<CapstanConfig>(raw)?
            .pop()
            .ok_or_else(|| anyhow!("empty"))?;
        assert_eq!(cfg.policies.ambiguity, AmbiguityPolicy::Reject);
        assert_eq!(cfg.policies.user_removal, UserRemovalPolicy::Retire);
        assert!(!cfg.policies.materialize_referenced_groups);
        assert_eq!(cfg.cycle.interval_secs, 300);
        assert_eq!(
            cfg.identity.role_groups.get("qs_role_admin"),
            Some(&Role::Admin)
        );
        Ok(())
    }

    #[test]
    fn classify_recognizes_roles_prefix_and_noise() {
        let identity = IdentityConfig::default();
        assert_eq!(
            identity.classify("qs_role_author"),
            Some(GroupKind::Role(Role::Author))
        );
        assert_eq!(
            identity.classify("qs_group_finance"),
            Some(GroupKind::Governed)
        );
        assert_eq!(identity.classify("Everyone"), None);
        assert_eq!(
            identity.classify("aws_012345678901_QSGovernance-FederatedQuickSightRole"),
            None
        );
    }

    #[test]
    fn precedence_list_defaults_to_descending_privilege() {
        let policies = PolicyConfig::default();
        assert_eq!(
            policies.role_precedence,
            vec![Role::Admin, Role::Author, Role::Reader]
        );
    }
}
