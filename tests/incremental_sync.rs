use std::sync::Arc;

use chrono::{DateTime, Utc};
use mockito::{Matcher, ServerGuard};
use pipesync::bulk_sync::{BulkSync, CHECKPOINT_SOURCE};
use pipesync::client::PipedriveClient;
use pipesync::config::{Config, PipedriveConfig, SyncConfig};
use pipesync::progress::NoProgress;
use pipesync::reconcile::Reconciler;
use pipesync::sqlite_store::SqliteStore;
use pipesync_core::progress::{SyncPhase, SyncType};
use pipesync_core::sanitize::SanitizeLimits;
use pipesync_core::store::Store;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn mock_remote(server: &mut ServerGuard) {
    server
        .mock("GET", "/users/me")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"success": true, "data": {"id": 1, "name": "Me"}}).to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/filters")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"success": true, "data": [{"id": 7, "name": "Still Active", "type": "people"}]})
                .to_string(),
        )
        .create_async()
        .await;
    for path in ["/personFields", "/organizationFields"] {
        server
            .mock("GET", path)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"success": true, "data": []}).to_string())
            .create_async()
            .await;
    }
    server
        .mock("GET", "/persons")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({
                "success": true,
                "data": [
                    {"id": 1, "name": "Ada", "update_time": "2024-01-03 08:00:00"},
                    {"id": 2, "name": "Grace", "update_time": "2024-01-05 12:00:00"}
                ],
                "additional_data": {"pagination": {"more_items_in_collection": false}}
            })
            .to_string(),
        )
        .create_async()
        .await;
}

async fn checkpoint(store: &SqliteStore) -> DateTime<Utc> {
    let raw = store.get_checkpoint(CHECKPOINT_SOURCE).await.unwrap().unwrap();
    DateTime::parse_from_rfc3339(&raw).unwrap().with_timezone(&Utc)
}

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn failed_person_is_retried_by_next_incremental_sync() {
    let mut remote = mockito::Server::new_async().await;
    mock_remote(&mut remote).await;

    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("pipesync.sqlite"));
    let store = Arc::new(SqliteStore::open(&config).await.unwrap());
    store
        .set_checkpoint(CHECKPOINT_SOURCE, "2024-01-02T00:00:00+00:00")
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_ada BEFORE INSERT ON contacts \
         WHEN NEW.remote_person_id = '1' \
         BEGIN SELECT RAISE(ABORT, 'contact rejected'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let pipedrive = PipedriveConfig {
        base_url: remote.url(),
        max_retries: 0,
        retry_base_delay_ms: 1,
        max_retry_delay_ms: 2,
        ..PipedriveConfig::default()
    };
    let client = PipedriveClient::new(&pipedrive, "t").unwrap();
    let reconciler = Arc::new(Reconciler::new(store.clone(), client, SanitizeLimits::default()));
    let sync = BulkSync::new(reconciler, SyncConfig::default());

    let first = sync
        .run("inc-1", SyncType::Incremental, &NoProgress, &CancellationToken::new())
        .await;
    assert_eq!(first.status, SyncPhase::Completed);
    assert_eq!(first.succeeded_records, 1);
    assert_eq!(first.failed_records, 1);
    assert!(checkpoint(&store).await < at("2024-01-03T08:00:00Z"));
    assert!(store.find_contact_by_remote_person("1").await.unwrap().is_none());

    sqlx::query("DROP TRIGGER reject_ada")
        .execute(store.pool())
        .await
        .unwrap();

    let second = sync
        .run("inc-2", SyncType::Incremental, &NoProgress, &CancellationToken::new())
        .await;
    assert_eq!(second.status, SyncPhase::Completed);
    assert_eq!(second.failed_records, 0);
    assert_eq!(second.skipped_records, 0);
    assert!(store.find_contact_by_remote_person("1").await.unwrap().is_some());
    assert_eq!(checkpoint(&store).await, at("2024-01-05T12:00:00Z"));

    let third = sync
        .run("inc-3", SyncType::Incremental, &NoProgress, &CancellationToken::new())
        .await;
    assert_eq!(third.skipped_records, 2);
    assert_eq!(third.succeeded_records, 0);
}
