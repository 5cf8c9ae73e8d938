use std::time::Duration;

use cluster::row;
use common::testing::TestConfigBuilder;
use identity::{FreeUpRequest, IdentifierKind, IdentityService, RoleGroup};
use serde_json::json;

#[tokio::test]
async fn test_service_provisions_schema_and_frees_identifiers() {
    let config = TestConfigBuilder::new()
        .in_memory()
        .with_keyspace("identity_test")
        .build();
    let service = IdentityService::start_isolated(&config).await.unwrap();

    let mut tables = service.cluster().list_tables("identity_test").await.unwrap();
    tables.sort();
    assert_eq!(tables, vec!["role_group", "user", "user_lookup"]);

    let session = service.cluster().session("identity_test").await.unwrap();
    session
        .upsert(
            "user",
            &row([("id", json!("u1"))]),
            &row([("email", json!("a@x.com")), ("flagsValue", json!(2))]),
        )
        .await
        .unwrap();

    let outcome = service
        .free_up(FreeUpRequest::new("u1", [IdentifierKind::Email]))
        .await
        .unwrap();
    assert_eq!(outcome.freed.len(), 1);
    // The in-process index starts empty.
    assert!(outcome.is_partially_consistent());

    let stored = session
        .get("user", &row([("id", json!("u1"))]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.get("prevUsedEmail"), Some(&json!("a@x.com")));
    assert_eq!(stored.get("flagsValue"), Some(&json!(0)));

    service.shutdown().await;
}

#[tokio::test]
async fn test_service_lists_role_groups() {
    let config = TestConfigBuilder::new()
        .in_memory()
        .with_sweep_interval(Duration::from_secs(60))
        .build();
    let service = IdentityService::start_isolated(&config).await.unwrap();

    let session = service.cluster().session("identity").await.unwrap();
    session
        .upsert(
            "role_group",
            &row([("id", json!("g1"))]),
            &row([("name", json!("Flag Reviewer"))]),
        )
        .await
        .unwrap();

    let groups = service.role_groups().list_role_groups().await.unwrap();
    assert_eq!(
        groups,
        vec![RoleGroup {
            id: "g1".to_string(),
            name: "Flag Reviewer".to_string(),
        }]
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_service_without_schema_reports_missing_keyspace() {
    let mut config = TestConfigBuilder::new().in_memory().build();
    config.reclamation.provision_schema = false;
    let service = IdentityService::start_isolated(&config).await.unwrap();

    let err = service
        .free_up(FreeUpRequest::new("u1", [IdentifierKind::Phone]))
        .await
        .unwrap_err();
    assert!(matches!(err, identity::IdentityError::NotFound(_)));

    service.shutdown().await;
}
