use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, ServerGuard};
use pipesync::app::App;
use pipesync::config::{Config, PipedriveConfig};
use pipesync::server::{router, USER_HEADER};
use pipesync::sqlite_store::SqliteStore;
use serde_json::{json, Value};
use tempfile::TempDir;

struct TestServer {
    _tmp: TempDir,
    addr: SocketAddr,
    http: reqwest::Client,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: Value, user: Option<&str>) -> (u16, Value) {
        let mut req = self.http.post(self.url(path)).json(&body);
        if let Some(user) = user {
            req = req.header(USER_HEADER, user);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.http.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json::<Value>().await.unwrap_or(Value::Null))
    }
}

async fn start(remote: &ServerGuard) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("pipesync.sqlite"));
    config.pipedrive = PipedriveConfig {
        base_url: remote.url(),
        api_token: Some("test-token".to_string()),
        max_retries: 0,
        retry_base_delay_ms: 1,
        max_retry_delay_ms: 2,
        ..PipedriveConfig::default()
    };
    config.replication.base_delay_ms = 1;

    let store = SqliteStore::open(&config).await.unwrap();
    let app = Arc::new(App::new(config, Arc::new(store)).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(app)).await.unwrap();
    });

    TestServer {
        _tmp: tmp,
        addr,
        http: reqwest::Client::new(),
    }
}

async fn create_user(server: &TestServer) -> String {
    let (status, body) = server
        .post(
            "/users",
            json!({"name": "Owner", "email": "Owner@Example.com"}),
            None,
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(body["email"], "owner@example.com");
    assert!(body.get("remoteApiToken").is_none());
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_version() {
    let remote = mockito::Server::new_async().await;
    let server = start(&remote).await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn invalid_contact_is_rejected_with_error_envelope() {
    let remote = mockito::Server::new_async().await;
    let server = start(&remote).await;

    let (status, body) = server
        .post("/contacts", json!({"name": "  ", "warmnessScore": 2}), None)
        .await;
    assert_eq!(status, 422);
    assert_eq!(body["error"]["code"], "validation");
    assert!(body["error"]["message"].as_str().is_some());

    let (status, body) = server.get("/contacts/does-not-exist").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn missing_user_header_is_a_bad_request() {
    let remote = mockito::Server::new_async().await;
    let server = start(&remote).await;

    let (status, body) = server
        .post("/contacts/anything/promote", json!({}), None)
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn warmness_crossing_threshold_promotes_once() {
    let mut remote = mockito::Server::new_async().await;
    remote
        .mock("GET", "/users/find")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"success": true, "data": [{"id": 42, "email": "owner@example.com", "name": "Owner"}]})
                .to_string(),
        )
        .create_async()
        .await;
    remote
        .mock("GET", "/personFields")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"success": true, "data": [
                {"id": 9, "key": "label", "name": "Label", "field_type": "enum",
                 "options": [{"id": 3, "label": "Warm Lead"}]}
            ]})
            .to_string(),
        )
        .create_async()
        .await;
    let person_create = remote
        .mock("POST", "/persons")
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(
            json!({"name": "Ada Lovelace", "owner_id": 42, "label": 3}),
        ))
        .with_status(201)
        .with_body(json!({"success": true, "data": {"id": 900, "name": "Ada Lovelace"}}).to_string())
        .expect(1)
        .create_async()
        .await;

    let server = start(&remote).await;
    let user_id = create_user(&server).await;

    let (status, contact) = server
        .post(
            "/contacts",
            json!({"name": "Ada Lovelace", "email": "ada@example.com", "warmnessScore": 2}),
            None,
        )
        .await;
    assert_eq!(status, 201);
    let contact_id = contact["id"].as_str().unwrap().to_string();

    let path = format!("/contacts/{}/warmness", contact_id);
    let (status, update) = server.post(&path, json!({"score": 3}), Some(&user_id)).await;
    assert_eq!(status, 200);
    assert!(update["promotion"].is_null());

    let (status, update) = server.post(&path, json!({"score": 6}), Some(&user_id)).await;
    assert_eq!(status, 200);
    assert_eq!(update["promotion"]["remotePersonId"], "900");
    assert_eq!(update["promotion"]["labelApplied"], true);

    let (status, update) = server.post(&path, json!({"score": 8}), Some(&user_id)).await;
    assert_eq!(status, 200);
    assert!(update["promotion"].is_null());

    let (_, stored) = server.get(&format!("/contacts/{}", contact_id)).await;
    assert_eq!(stored["remotePersonId"], "900");
    assert_eq!(stored["warmnessScore"], 8);

    let (status, again) = server
        .post(
            &format!("/contacts/{}/promote", contact_id),
            json!({}),
            Some(&user_id),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(again["alreadyLinked"], true);

    person_create.assert_async().await;
}

#[tokio::test]
async fn activity_on_unlinked_contact_is_logged_without_replication() {
    let mut remote = mockito::Server::new_async().await;
    let any_post = remote
        .mock("POST", Matcher::Any)
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let server = start(&remote).await;
    let user_id = create_user(&server).await;
    let (_, contact) = server
        .post("/contacts", json!({"name": "Grace Hopper"}), None)
        .await;

    let (status, logged) = server
        .post(
            "/activities",
            json!({
                "activityType": "CALL",
                "subject": "Intro call",
                "contactId": contact["id"],
            }),
            Some(&user_id),
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(logged["activity"]["replicatedToPipedrive"], false);
    assert!(logged["replication"].is_null());

    let activity_path = format!("/activities/{}/replicate", logged["activity"]["id"].as_str().unwrap());
    let (status, outcome) = server.post(&activity_path, json!({}), None).await;
    assert_eq!(status, 200);
    assert_eq!(outcome["status"], "contact_not_linked");

    let (status, listed) = server
        .get(&format!("/contacts/{}/activities", contact["id"].as_str().unwrap()))
        .await;
    assert_eq!(status, 200);
    assert_eq!(listed["activities"].as_array().unwrap().len(), 1);

    let (status, fetched) = server
        .get(&format!("/activities/{}", logged["activity"]["id"].as_str().unwrap()))
        .await;
    assert_eq!(status, 200);
    assert_eq!(fetched["subject"], "Intro call");
    assert_eq!(fetched["pipedriveSyncAttempts"], 0);

    let (status, user) = server.get(&format!("/users/{}", user_id)).await;
    assert_eq!(status, 200);
    assert_eq!(user["name"], "Owner");

    any_post.assert_async().await;
}

#[tokio::test]
async fn deactivation_without_remote_sync_updates_contact() {
    let remote = mockito::Server::new_async().await;
    let server = start(&remote).await;
    let user_id = create_user(&server).await;
    let (_, contact) = server
        .post("/contacts", json!({"name": "Alan Turing"}), None)
        .await;
    let id = contact["id"].as_str().unwrap();

    let (status, body) = server
        .post(
            &format!("/contacts/{}/deactivate", id),
            json!({"reason": "left company", "syncRemote": false}),
            Some(&user_id),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["isActive"], false);
    assert_eq!(body["deactivationReason"], "left company");

    let (status, body) = server
        .post(
            &format!("/contacts/{}/deactivate", id),
            json!({"syncRemote": false}),
            Some(&user_id),
        )
        .await;
    assert_eq!(status, 422);
    assert_eq!(body["error"]["code"], "validation");

    let (status, body) = server
        .post(
            &format!("/contacts/{}/reactivate", id),
            json!({"syncRemote": false}),
            Some(&user_id),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["isActive"], true);
}

#[tokio::test]
async fn campaign_membership_over_http() {
    let remote = mockito::Server::new_async().await;
    let server = start(&remote).await;
    let (_, contact) = server
        .post("/contacts", json!({"name": "Barbara Liskov"}), None)
        .await;
    let (status, campaign) = server
        .post("/campaigns", json!({"name": "Spring outreach"}), None)
        .await;
    assert_eq!(status, 201);

    let resp = server
        .http
        .post(server.url(&format!(
            "/campaigns/{}/contacts",
            campaign["id"].as_str().unwrap()
        )))
        .json(&json!({"contactId": contact["id"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let (_, stored) = server
        .get(&format!("/contacts/{}", contact["id"].as_str().unwrap()))
        .await;
    assert_eq!(stored["addedToCampaign"], true);

    let (_, list) = server.get("/campaigns").await;
    assert_eq!(list["campaigns"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn sync_with_expired_token_fails_and_streams_terminal_event() {
    let mut remote = mockito::Server::new_async().await;
    remote
        .mock("GET", "/users/me")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body(json!({"success": false, "error": "unauthorized"}).to_string())
        .create_async()
        .await;
    let server = start(&remote).await;

    let (status, started) = server.post("/sync", json!({"type": "FULL"}), None).await;
    assert_eq!(status, 202);
    let sync_id = started["syncId"].as_str().unwrap().to_string();

    let mut last = Value::Null;
    for _ in 0..100 {
        let (status, body) = server.get(&format!("/sync/{}", sync_id)).await;
        assert_eq!(status, 200);
        last = body;
        if last["event"] != "progress" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(last["event"], "error");
    assert_eq!(last["state"]["status"], "failed");
    assert_eq!(last["state"]["syncType"], "FULL");

    let stream = server
        .http
        .get(server.url(&format!("/sync/{}/events", sync_id)))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(stream.contains("event: error"));
    assert!(stream.contains("\"status\":\"failed\""));

    let (status, body) = server.get("/sync/unknown").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn lifecycle_routes_accept_an_empty_body() {
    let mut remote = mockito::Server::new_async().await;
    let any_put = remote
        .mock("PUT", Matcher::Any)
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let server = start(&remote).await;
    let user_id = create_user(&server).await;
    let (_, contact) = server
        .post("/contacts", json!({"name": "Edsger Dijkstra"}), None)
        .await;
    let id = contact["id"].as_str().unwrap();

    let resp = server
        .http
        .post(server.url(&format!("/contacts/{}/deactivate", id)))
        .header(USER_HEADER, &user_id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["isActive"], false);
    assert!(body["deactivationReason"].is_null());

    let resp = server
        .http
        .post(server.url(&format!("/contacts/{}/reactivate", id)))
        .header(USER_HEADER, &user_id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    any_put.assert_async().await;
}
