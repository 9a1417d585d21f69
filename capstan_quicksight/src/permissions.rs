//! Mapping between Capstan permission levels and QuickSight action lists.
//!
//! QuickSight expresses grants as per-principal action lists; the
//! reconciler expresses them as levels. Levels nest (write includes read,
//! admin includes write), so classification checks the strongest level
//! first. Opaque categories encode the level as a single
//! `{category}:{LEVEL}` action and round-trip without interpretation.

use capstan_core::state::{AssetCategory, PermissionLevel};

const DATASET_READ: &[&str] = &[
    "quicksight:DescribeDataSet",
    "quicksight:DescribeDataSetPermissions",
    "quicksight:PassDataSet",
    "quicksight:DescribeIngestion",
    "quicksight:ListIngestions",
];
const DATASET_WRITE: &[&str] = &[
    "quicksight:UpdateDataSet",
    "quicksight:DeleteDataSet",
    "quicksight:CreateIngestion",
    "quicksight:CancelIngestion",
];
const DATASET_ADMIN: &[&str] = &["quicksight:UpdateDataSetPermissions"];

const DASHBOARD_READ: &[&str] = &[
    "quicksight:DescribeDashboard",
    "quicksight:ListDashboardVersions",
    "quicksight:QueryDashboard",
];
const DASHBOARD_ADMIN: &[&str] = &[
    "quicksight:UpdateDashboard",
    "quicksight:DeleteDashboard",
    "quicksight:DescribeDashboardPermissions",
    "quicksight:UpdateDashboardPermissions",
    "quicksight:UpdateDashboardPublishedVersion",
];

const THEME_READ: &[&str] = &[
    "quicksight:DescribeTheme",
    "quicksight:ListThemeVersions",
];
const THEME_ADMIN: &[&str] = &[
    "quicksight:UpdateTheme",
    "quicksight:DeleteTheme",
    "quicksight:DescribeThemePermissions",
    "quicksight:UpdateThemePermissions",
];

const ANALYSIS_READ: &[&str] = &[
    "quicksight:DescribeAnalysis",
    "quicksight:QueryAnalysis",
];
const ANALYSIS_WRITE: &[&str] = &[
    "quicksight:UpdateAnalysis",
    "quicksight:DeleteAnalysis",
];
const ANALYSIS_ADMIN: &[&str] = &[
    "quicksight:DescribeAnalysisPermissions",
    "quicksight:UpdateAnalysisPermissions",
];

const LEVELS_BY_STRENGTH: [PermissionLevel; 3] = [
    PermissionLevel::Admin,
    PermissionLevel::Write,
    PermissionLevel::Read,
];

/// The full action list for a (category, level) pair, or `None` when the
/// category does not support the level.
pub(crate) fn actions_for(
    category: &AssetCategory,
    level: PermissionLevel,
) -> Option<Vec<String>> {
    let tiers: &[&[&str]] = match (category, level) {
        (AssetCategory::Dataset, PermissionLevel::Read) => &[DATASET_READ],
        (AssetCategory::Dataset, PermissionLevel::Write) => &[DATASET_READ, DATASET_WRITE],
        (AssetCategory::Dataset, PermissionLevel::Admin) => {
            &[DATASET_READ, DATASET_WRITE, DATASET_ADMIN]
        }
        (AssetCategory::Dashboard, PermissionLevel::Read) => &[DASHBOARD_READ],
        (AssetCategory::Dashboard, PermissionLevel::Admin) => {
            &[DASHBOARD_READ, DASHBOARD_ADMIN]
        }
        (AssetCategory::Theme, PermissionLevel::Read) => &[THEME_READ],
        (AssetCategory::Theme, PermissionLevel::Admin) => &[THEME_READ, THEME_ADMIN],
        (AssetCategory::Analysis, PermissionLevel::Read) => &[ANALYSIS_READ],
        (AssetCategory::Analysis, PermissionLevel::Write) => &[ANALYSIS_READ, ANALYSIS_WRITE],
        (AssetCategory::Analysis, PermissionLevel::Admin) => {
            &[ANALYSIS_READ, ANALYSIS_WRITE, ANALYSIS_ADMIN]
        }
        (AssetCategory::Other(name), level) => {
            return Some(vec![format!("{name}:{level}")]);
        }
        _ => return None,
    };
    Some(
        tiers
            .iter()
            .flat_map(|tier| tier.iter().map(|a| a.to_string()))
            .collect(),
    )
}

/// Classify an observed action list back into a level; strongest match
/// wins. `None` means the grant was not written by this reconciler's
/// vocabulary and is left alone.
pub(crate) fn level_for_actions(
    category: &AssetCategory,
    actions: &[String],
) -> Option<PermissionLevel> {
    for level in LEVELS_BY_STRENGTH {
        if let Some(expected) = actions_for(category, level) {
            if expected.iter().all(|a| actions.contains(a)) {
                return Some(level);
            }
        }
    }
    None
}

/// Every action any level could have granted for the category; used for
/// full revocation.
pub(crate) fn all_actions(category: &AssetCategory) -> Vec<String> {
    let mut actions: Vec<String> = LEVELS_BY_STRENGTH
        .into_iter()
        .filter_map(|level| actions_for(category, level))
        .flatten()
        .collect();
    actions.sort();
    actions.dedup();
    actions
}
