//! Path utilities for project organization.
//!
//! The project structure currently looks like this:
//!
//! ```text
//! pwd
//!  └── {project_name}
//!       ├── capstan.yaml
//!       └── .data
//!            ├── user-governance.json
//!            ├── asset-governance.json
//!            ├── asset-governance.validated.json
//!            ├── cycle.lease
//!            ├── snapshots
//!            │    └── users
//!            │         └── {timestamp}.json
//!            └── reports
//!                 └── {timestamp}.json
//! ```
//!
//! The `.data` directory is the default backend for the object-store
//! interface; a bucket-backed store uses the same key layout.

use std::path::{Path, PathBuf};

use dirs::home_dir;
use lazy_static::lazy_static;

lazy_static! {
    static ref DATA_DIR: PathBuf = PathBuf::from(".data");
    static ref CAPSTAN_CFG: PathBuf = PathBuf::from("capstan.yaml");
    static ref CONNECTOR_CFG: PathBuf = PathBuf::from("connectors.yaml");
    static ref PROFILE_CFG_DIR: PathBuf = PathBuf::from(".capstan");
}

/// The path to the main capstan config for a project.
pub fn capstan_cfg_path<P: AsRef<Path>>(project_path: P) -> PathBuf {
    project_path.as_ref().join(CAPSTAN_CFG.as_path())
}

/// Local path for the capstan config.
pub fn capstan_cfg_path_local() -> PathBuf {
    CAPSTAN_CFG.to_owned()
}

/// Local path for the data directory that backs the filesystem object store.
pub fn data_dir() -> PathBuf {
    DATA_DIR.to_owned()
}

/// The path to the user-level profile directory (`~/.capstan`).
pub fn profile_cfg_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(PROFILE_CFG_DIR.as_path()))
}

/// The path to the user-level connector credentials file
/// (`~/.capstan/connectors.yaml`).
pub fn connectors_cfg_path() -> Option<PathBuf> {
    profile_cfg_dir().map(|p| p.join(CONNECTOR_CFG.as_path()))
}
