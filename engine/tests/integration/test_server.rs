//! Control API tests, driven through the router without a socket

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use secrecy::SecretString;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{static_build, Harness};
use shipyard::authn::signature::{sign, SIGNATURE_HEADER};
use shipyard::server::serve::router;
use shipyard::server::state::ServerState;
use shipyard::storage::settings::Settings;

const SECRET: &str = "hook-secret";

async fn harness() -> (Harness, Router) {
    let mut settings = Settings::default();
    settings.webhook_secret = Some(SecretString::from(SECRET));
    let h = Harness::with_settings(settings, |_| {}).await;
    let app = router(Arc::new(ServerState::new(h.app.clone())));
    (h, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn push(body: &Value, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/push")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (_h, app) = harness().await;
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "shipyard");
}

#[tokio::test]
async fn test_create_project_binds_default_hostnames() {
    let (h, app) = harness().await;
    let request = json!({
        "slug": "blog",
        "repo_url": format!("file://{}", h.source_dir("blog").display()),
        "build": { "install_command": "", "build_command": "" }
    });
    let (status, project) = send(&app, post_json("POST", "/projects", &request)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(project["slug"], "blog");
    assert_eq!(project["production_branch"], "main");

    let (status, bindings) = send(&app, get("/bindings")).await;
    assert_eq!(status, StatusCode::OK);
    let hostnames: Vec<&str> = bindings
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["hostname"].as_str().unwrap())
        .collect();
    assert!(hostnames.contains(&h.hostname("blog").as_str()));
    assert!(hostnames.contains(&h.staging_hostname("blog").as_str()));

    // slugs are unique
    let (status, body) = send(&app, post_json("POST", "/projects", &request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("blog"));
}

#[tokio::test]
async fn test_invalid_project_is_a_bad_request() {
    let (_h, app) = harness().await;
    let request = json!({ "slug": "Not A Slug", "repo_url": "file:///tmp/x" });
    let (status, _) = send(&app, post_json("POST", "/projects", &request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_resources_are_not_found() {
    let (_h, app) = harness().await;
    for uri in ["/projects/missing", "/deployments/missing", "/bindings/missing.example.com"] {
        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn test_submit_and_cancel_through_the_api() {
    let (h, app) = harness().await;
    let project = h.project("site", static_build()).await;
    let uri = format!("/projects/{}/deployments", project.id);

    let (status, body) = send(&app, post_json("POST", &uri, &json!({ "commit": "cafe1", "branch": "main" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["created"], true);
    assert_eq!(body["deployment"]["status"], "QUEUED");
    let id = body["deployment"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, post_json("POST", &uri, &json!({ "commit": "cafe1", "branch": "main" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], false);
    assert_eq!(body["deployment"]["id"], id.as_str());

    let cancel = format!("/deployments/{}/cancel", id);
    let (status, body) = send(&app, post_json("POST", &cancel, &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");

    let (_, listed) = send(&app, get(&uri)).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_webhook_requires_a_valid_signature() {
    let (h, app) = harness().await;
    h.project("site", static_build()).await;
    let event = json!({ "project": "site", "ref": "refs/heads/main", "after": "abc123" });

    let (status, _) = send(&app, push(&event, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = sign(b"wrong-secret", event.to_string().as_bytes()).unwrap();
    let (status, _) = send(&app, push(&event, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.app.scheduler.queue_depth().total(), 0);
}

#[tokio::test]
async fn test_signed_push_queues_a_deployment() {
    let (h, app) = harness().await;
    let project = h.project("site", static_build()).await;
    let event = json!({ "project": "site", "ref": "refs/heads/feature/x", "after": "abc123" });
    let signature = sign(SECRET.as_bytes(), event.to_string().as_bytes()).unwrap();

    let (status, body) = send(&app, push(&event, Some(signature.clone()))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deployment"]["role"], "staging");
    assert_eq!(body["deployment"]["trigger"], "webhook");
    assert_eq!(body["deployment"]["project_id"], project.id.as_str());
    assert_eq!(h.app.scheduler.queue_depth().automated, 1);

    // redelivery maps onto the same deployment
    let (status, again) = send(&app, push(&event, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["deployment"]["id"], body["deployment"]["id"]);

    // tags are acknowledged and ignored
    let tag = json!({ "project": "site", "ref": "refs/tags/v1", "after": "abc123" });
    let signature = sign(SECRET.as_bytes(), tag.to_string().as_bytes()).unwrap();
    let (status, body) = send(&app, push(&tag, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["skipped"].is_string());
}

#[tokio::test]
async fn test_push_with_option_shaped_commit_is_refused() {
    let (h, app) = harness().await;
    h.project("site", static_build()).await;
    let event = json!({
        "project": "site",
        "ref": "refs/heads/main",
        "after": "--upload-pack=touch /tmp/owned"
    });
    let signature = sign(SECRET.as_bytes(), event.to_string().as_bytes()).unwrap();

    let (status, body) = send(&app, push(&event, Some(signature))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert_eq!(h.app.scheduler.queue_depth().total(), 0);
}

#[tokio::test]
async fn test_logs_are_paged() {
    let (h, app) = harness().await;
    let project = h.project("site", static_build()).await;
    let done = h.deploy(&project, "cafe1", "main").await;

    let total = h.app.logs.read(&done.id, 0, 1000).await.unwrap().len();
    assert!(total > 2);

    let (status, page) = send(&app, get(&format!("/deployments/{}/logs?offset=0&limit=2", done.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["lines"].as_array().unwrap().len(), 2);
    assert_eq!(page["live"], false);

    let next = page["next_offset"].as_u64().unwrap();
    let (_, rest) = send(
        &app,
        get(&format!("/deployments/{}/logs?offset={}&limit=1000", done.id, next)),
    )
    .await;
    assert_eq!(rest["lines"].as_array().unwrap().len(), total - 2);
}

#[tokio::test]
async fn test_promote_and_rollback_endpoints() {
    let (h, app) = harness().await;
    let project = h.project("site", static_build()).await;
    let first = h.deploy(&project, "cafe1", "main").await;
    let second = h.deploy(&project, "cafe2", "main").await;
    let host = h.hostname("site");

    let (status, binding) = send(
        &app,
        post_json("POST", &format!("/bindings/{}/rollback", host), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(binding["active_deployment"], first.id.as_str());

    let (status, promotion) = send(
        &app,
        post_json(
            "POST",
            &format!("/bindings/{}/promote", host),
            &json!({ "deployment_id": second.id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promotion["outcome"], "activated");
    assert_eq!(promotion["active_deployment"], second.id.as_str());
}
