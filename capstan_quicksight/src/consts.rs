//! Endpoint layout for the asset categories QuickSight can enumerate.

use capstan_core::state::AssetCategory;

/// How one asset category maps onto the admin API.
pub(crate) struct CategoryEndpoints {
    /// Path segment under `/accounts/{account_id}`.
    pub(crate) path: &'static str,
    /// Key of the listing array in the response body.
    pub(crate) list_key: &'static str,
    /// Key of the asset id field in a listing entry.
    pub(crate) id_key: &'static str,
}

/// Categories the connector can enumerate. Opaque categories have no
/// listing endpoint here; their grants can only be reconciled against a
/// target that exposes them, so they surface as missing assets otherwise.
pub(crate) const RECOGNIZED: [AssetCategory; 4] = [
    AssetCategory::Dataset,
    AssetCategory::Dashboard,
    AssetCategory::Theme,
    AssetCategory::Analysis,
];

pub(crate) fn endpoints(category: &AssetCategory) -> Option<CategoryEndpoints> {
    match category {
        AssetCategory::Dataset => Some(CategoryEndpoints {
            path: "data-sets",
            list_key: "DataSetSummaries",
            id_key: "DataSetId",
        }),
        AssetCategory::Dashboard => Some(CategoryEndpoints {
            path: "dashboards",
            list_key: "DashboardSummaryList",
            id_key: "DashboardId",
        }),
        AssetCategory::Theme => Some(CategoryEndpoints {
            path: "themes",
            list_key: "ThemeSummaryList",
            id_key: "ThemeId",
        }),
        AssetCategory::Analysis => Some(CategoryEndpoints {
            path: "analyses",
            list_key: "AnalysisSummaryList",
            id_key: "AnalysisId",
        }),
        AssetCategory::Other(_) => None,
    }
}
