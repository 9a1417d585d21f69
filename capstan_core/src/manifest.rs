//! Loading and validation of the administrator-authored asset manifest.
//!
//! The manifest is the sole human-facing contract. Validation is
//! fail-closed: one malformed entry rejects the whole document, so a bad
//! manifest can never cause a partial permission application.
//!
//! Sample manifest:
//!
//! ```json
//! {
//!    "assets":[
//!       {
//!          "name": "dataset_example_1",
//!          "category": "dataset",
//!          "namespace": "default",
//!          "groups": [
//!             "qs_group_ops",
//!             "qs_group_finance"
//!          ],
//!          "permission": "READ"
//!       }
//!    ]
//! }
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::errors::ManifestValidationError;
use crate::state::{Asset, AssetCategory, AssetKey, Namespace, PermissionLevel};

/// Permissive mirror of the manifest document, validated field by field
/// after parsing so errors can name the offending entry.
#[derive(Deserialize, Debug)]
struct RawManifest {
    assets: Option<Vec<RawAsset>>,
}

#[derive(Deserialize, Debug)]
struct RawAsset {
    name: Option<String>,
    category: Option<String>,
    namespace: Option<String>,
    groups: Option<Vec<String>>,
    permission: Option<String>,
}

fn err(field: impl Into<String>, reason: impl Into<String>) -> ManifestValidationError {
    ManifestValidationError {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Parse and validate a raw manifest document into governed assets.
///
/// Entries sharing an asset key are merged; a group granted two different
/// levels on the same asset is a validation error, not a silent override.
pub fn load(raw: &[u8]) -> Result<Vec<Asset>, ManifestValidationError> {
    let doc: RawManifest = serde_json::from_slice(raw)
        .map_err(|e| err("$", format!("not a valid manifest document: {e}")))?;

    let entries = doc
        .assets
        .ok_or_else(|| err("assets", "missing required top-level key"))?;

    let mut assets: BTreeMap<AssetKey, Asset> = BTreeMap::new();

    for (i, entry) in entries.iter().enumerate() {
        let name = match entry.name.as_deref() {
            Some(n) if !n.is_empty() => n.to_owned(),
            Some(_) => return Err(err(format!("assets[{i}].name"), "must not be empty")),
            None => return Err(err(format!("assets[{i}].name"), "missing required field")),
        };

        let category = match entry.category.as_deref() {
            Some(c) if !c.is_empty() => AssetCategory::from(c.to_owned()),
            Some(_) => return Err(err(format!("assets[{i}].category"), "must not be empty")),
            None => {
                return Err(err(
                    format!("assets[{i}].category"),
                    "missing required field",
                ))
            }
        };

        let namespace = match entry.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Namespace(ns.to_owned()),
            Some(_) => {
                return Err(err(
                    format!("assets[{i}].namespace"),
                    "must not be empty when present",
                ))
            }
            None => Namespace::default(),
        };

        let groups = match entry.groups.as_deref() {
            Some(g) if !g.is_empty() => g,
            Some(_) => return Err(err(format!("assets[{i}].groups"), "must not be empty")),
            None => return Err(err(format!("assets[{i}].groups"), "missing required field")),
        };

        let permission = match entry.permission.as_deref() {
            Some(p) => p
                .parse::<PermissionLevel>()
                .map_err(|reason| err(format!("assets[{i}].permission"), reason))?,
            None => {
                return Err(err(
                    format!("assets[{i}].permission"),
                    "missing required field",
                ))
            }
        };

        if let Some(supported) = category.supported_levels() {
            if !supported.contains(&permission) {
                return Err(err(
                    format!("assets[{i}].permission"),
                    format!("level {permission} is not supported for category {category}"),
                ));
            }
        }

        let key = AssetKey {
            namespace,
            category,
            name,
        };
        let asset = assets.entry(key.clone()).or_insert_with(|| Asset {
            key,
            grants: BTreeMap::new(),
        });

        for group in groups {
            if group.is_empty() {
                return Err(err(
                    format!("assets[{i}].groups"),
                    "group names must not be empty",
                ));
            }
            if let Some(prior) = asset.grants.insert(group.to_owned(), permission) {
                if prior != permission {
                    return Err(err(
                        format!("assets[{i}].groups"),
                        format!(
                            "group {group} is granted both {prior} and {permission} on {}",
                            asset.key
                        ),
                    ));
                }
            }
        }
    }

    Ok(assets.into_values().collect())
}
