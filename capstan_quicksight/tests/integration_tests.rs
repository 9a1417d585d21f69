use std::collections::HashMap;

use capstan_core::config::CredentialsMap;
use capstan_core::connectors::TargetAdmin;
use capstan_core::errors::TargetApplyError;
use capstan_core::state::{AssetCategory, AssetKey, Namespace, PermissionLevel, Role};
use capstan_quicksight::QuickSightConnector;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn connector_for(server: &MockServer) -> QuickSightConnector {
    let creds: CredentialsMap = HashMap::from([
        ("account_id".to_owned(), "012345678901".to_owned()),
        ("region".to_owned(), "us-east-1".to_owned()),
        ("session_token".to_owned(), "test-token".to_owned()),
        ("url".to_owned(), server.uri()),
    ]);
    QuickSightConnector::new(&creds).unwrap()
}

fn dataset(name: &str) -> AssetKey {
    AssetKey {
        namespace: Namespace::default(),
        category: AssetCategory::Dataset,
        name: name.to_owned(),
    }
}

#[tokio::test]
async fn namespace_existence_follows_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/namespaces/default"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Name": "default"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/namespaces/finance"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let connector = connector_for(&server);
    assert!(connector
        .namespace_exists(&Namespace::default())
        .await
        .unwrap());
    assert!(!connector
        .namespace_exists(&Namespace::from("finance"))
        .await
        .unwrap());
}

#[tokio::test]
async fn list_users_follows_next_token_and_filters_ungoverned_roles() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/namespaces/default/users"))
        .and(query_param("next-token", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "UserList": [
                {"UserName": "qs4@example.com", "Email": "qs4@example.com", "Role": "AUTHOR"}
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/namespaces/default/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "UserList": [
                {"UserName": "qs1@example.com", "Email": "qs1@example.com", "Role": "ADMIN"},
                {"UserName": "kiosk@example.com", "Email": "kiosk@example.com", "Role": "RESTRICTED_READER"}
            ],
            "NextToken": "t1"
        })))
        .mount(&server)
        .await;

    let connector = connector_for(&server);
    let users = connector.list_users(&Namespace::default()).await.unwrap();

    assert_eq!(users.len(), 2);
    assert_eq!(users[0].role, Role::Admin);
    assert_eq!(users[1].username, "qs4@example.com");
}

#[tokio::test]
async fn conflicting_creates_map_to_already_exists() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/accounts/012345678901/namespaces/default/users"))
        .respond_with(
            ResponseTemplate::new(409)
                .set_body_json(json!({"Message": "user already registered"})),
        )
        .mount(&server)
        .await;

    let connector = connector_for(&server);
    let err = connector
        .create_user(
            &Namespace::default(),
            "qs1@example.com",
            "qs1@example.com",
            Role::Admin,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TargetApplyError::AlreadyExists(_)));
}

#[tokio::test]
async fn throttling_maps_to_a_retryable_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/accounts/012345678901/namespaces/default/groups"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(json!({"Message": "slow down"})),
        )
        .mount(&server)
        .await;

    let connector = connector_for(&server);
    let err = connector
        .create_group(&Namespace::default(), "qs_group_ops")
        .await
        .unwrap_err();

    assert!(matches!(err, TargetApplyError::RateLimited(_)));
    assert!(err.retryable());
}

#[tokio::test]
async fn asset_grants_resolve_names_and_action_lists() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/data-sets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "DataSetSummaries": [
                {"Name": "dataset_example_1", "DataSetId": "ds-001"}
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/data-sets/ds-001/permissions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Permissions": [
                {
                    "Principal": "arn:aws:quicksight:us-east-1:012345678901:group/default/qs_group_finance",
                    "Actions": [
                        "quicksight:DescribeDataSet",
                        "quicksight:DescribeDataSetPermissions",
                        "quicksight:PassDataSet",
                        "quicksight:DescribeIngestion",
                        "quicksight:ListIngestions"
                    ]
                },
                {
                    "Principal": "arn:aws:quicksight:us-east-1:012345678901:group/marketing/qs_group_mkt",
                    "Actions": ["quicksight:DescribeDataSet"]
                },
                {
                    "Principal": "arn:aws:quicksight:us-east-1:012345678901:user/default/someone",
                    "Actions": ["quicksight:DescribeDataSet"]
                }
            ]
        })))
        .mount(&server)
        .await;

    let connector = connector_for(&server);
    let grants = connector
        .asset_grants(&dataset("dataset_example_1"))
        .await
        .unwrap();

    // only the same-namespace group principal with a recognized action
    // list survives
    assert_eq!(
        grants,
        vec![("qs_group_finance".to_owned(), PermissionLevel::Read)]
    );
}

#[tokio::test]
async fn setting_a_grant_revokes_the_other_tiers() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/data-sets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "DataSetSummaries": [
                {"Name": "dataset_example_1", "DataSetId": "ds-001"}
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/accounts/012345678901/data-sets/ds-001/permissions"))
        .and(body_partial_json(json!({
            "GrantPermissions": [{
                "Principal": "arn:aws:quicksight:us-east-1:012345678901:group/default/qs_group_finance"
            }],
            "RevokePermissions": [{
                "Principal": "arn:aws:quicksight:us-east-1:012345678901:group/default/qs_group_finance"
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let connector = connector_for(&server);
    connector
        .set_asset_grant(
            &dataset("dataset_example_1"),
            "qs_group_finance",
            PermissionLevel::Read,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn grants_on_missing_assets_are_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/accounts/012345678901/data-sets"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"DataSetSummaries": []})),
        )
        .mount(&server)
        .await;

    let connector = connector_for(&server);
    let err = connector
        .set_asset_grant(&dataset("missing"), "qs_group_ops", PermissionLevel::Read)
        .await
        .unwrap_err();

    assert!(matches!(err, TargetApplyError::NotFound(_)));
}
