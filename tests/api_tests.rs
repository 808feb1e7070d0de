use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use proxyip_check_rs::auth::TokenAuthority;
use proxyip_check_rs::checker::Checker;
use proxyip_check_rs::config::{AuthConfig, CheckerConfig};
use proxyip_check_rs::dns::Resolver;
use proxyip_check_rs::error::{CheckError, CheckResult};
use proxyip_check_rs::probe::{failed_result, Prober};
use proxyip_check_rs::server::{router, AppState};
use proxyip_check_rs::types::{Endpoint, ProbeResult};

const HOST: &str = "check.example";
const UA: &str = "api-tests/1.0";

/// Succeeds for `1.1.1.1` only.
struct StubProber;

#[async_trait]
impl Prober for StubProber {
    async fn probe(&self, ep: &Endpoint) -> ProbeResult {
        let mut r = failed_result(&ep.host, ep.port, "refused");
        if ep.host == "1.1.1.1" {
            r.success = true;
            r.status_code = Some(400);
            r.response_byte_length = 655;
            r.error_message = None;
        }
        r
    }
}

struct StubResolver;

#[async_trait]
impl Resolver for StubResolver {
    async fn resolve(&self, domain: &str) -> CheckResult<Vec<String>> {
        match domain {
            "dual.example" => Ok(vec!["1.1.1.1".into(), "[2606:4700::1111]".into()]),
            _ => Err(CheckError::Resolution("No A or AAAA records found".into())),
        }
    }
}

fn build_app(secret: Option<&str>) -> (Router, TokenAuthority) {
    let mut config = CheckerConfig::default();
    config.auth = AuthConfig {
        secret: secret.map(str::to_string),
        ..AuthConfig::default()
    };
    config.scan.inter_batch_delay = Duration::from_millis(1);
    config.geo.enabled = false;
    let checker = Checker::new(
        Arc::new(StubProber),
        Arc::new(StubResolver),
        None,
        config.clone(),
    );
    let authority = TokenAuthority::new(config.auth);
    (router(AppState::new(checker, authority.clone())), authority)
}

fn rotating_token(authority: &TokenAuthority) -> String {
    authority.context(HOST, UA).ephemeral.value
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, format!("{HOST}:8080"))
        .header(header::USER_AGENT, UA)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::HOST, HOST)
        .header(header::USER_AGENT, UA)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    assert_eq!(
        res.headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn check_missing_or_empty_proxyip_is_400() {
    let (app, _) = build_app(None);
    let (status, body) = send(&app, get("/check")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
    assert!(body["timestamp"].is_string());

    let (status, body) = send(&app, get("/check?proxyip=")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid proxyip parameter");
}

#[tokio::test]
async fn check_maps_classification_to_status() {
    let (app, _) = build_app(None);
    let (status, body) = send(&app, get("/check?proxyip=1.1.1.1:443")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["proxyIP"], "1.1.1.1");
    assert_eq!(body["portRemote"], 443);
    assert_eq!(body["statusCode"], 400);

    let (status, body) = send(&app, get("/check?proxyip=2.2.2.2:8443")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
    assert_eq!(body["portRemote"], 8443);
    assert_eq!(body["error"], "refused");
}

#[tokio::test]
async fn check_with_secret_requires_token() {
    let (app, authority) = build_app(Some("s3cret"));
    let (status, body) = send(&app, get("/check?proxyip=1.1.1.1")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "ProxyIP Check Failed: Invalid TOKEN");

    let (status, _) = send(&app, get("/check?proxyip=1.1.1.1&token=s3cret")).await;
    assert_eq!(status, StatusCode::OK);

    let tok = rotating_token(&authority);
    let (status, _) = send(&app, get(&format!("/check?proxyip=1.1.1.1&token={tok}"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn resolve_requires_rotating_token() {
    let (app, authority) = build_app(None);
    let (status, _) = send(&app, get("/resolve?domain=dual.example")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let tok = rotating_token(&authority);
    let (status, body) = send(&app, get(&format!("/resolve?domain=dual.example&token={tok}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["domain"], "dual.example");
    assert_eq!(body["ips"][1], "[2606:4700::1111]");
}

#[tokio::test]
async fn resolve_failure_is_500_with_message() {
    let (app, authority) = build_app(None);
    let tok = rotating_token(&authority);
    let (status, body) = send(&app, get(&format!("/resolve?domain=none.example&token={tok}"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "DNS resolution failed: No A or AAAA records found");
}

#[tokio::test]
async fn token_is_bound_to_caller() {
    let (app, authority) = build_app(None);
    let other = authority.context(HOST, "someone-else").ephemeral.value;
    let (status, _) = send(&app, get(&format!("/resolve?domain=dual.example&token={other}"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn index_publishes_token_only_without_secret() {
    let (app, authority) = build_app(None);
    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token"], rotating_token(&authority));
    assert_eq!(body["window_minutes"], 31);
    assert_eq!(body["refresh_hint_minutes"], 13);

    let (app, _) = build_app(Some("s3cret"));
    let (status, _) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ip_info_without_geo_is_upstream_error() {
    let (app, authority) = build_app(None);
    let tok = rotating_token(&authority);
    let (status, body) = send(&app, get(&format!("/ip-info?token={tok}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "IP parameter not provided");

    let (status, body) = send(&app, get(&format!("/ip-info?ip=1.1.1.1&token={tok}"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "upstream");
}

#[tokio::test]
async fn scan_api_runs_ranges_in_background() {
    let (app, authority) = build_app(None);
    let tok = rotating_token(&authority);

    let (status, _) = send(&app, get(&format!("/api/results?token={tok}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &app,
        post_json(
            &format!("/api/scan?token={tok}"),
            r#"{"ranges":["1.1.1.1-3","bogus","1.1.2.1-2"]}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "running");
    assert_eq!(body["total_ranges"], 3);

    let mut last = Value::Null;
    for _ in 0..200 {
        let (_, status_body) = send(&app, get(&format!("/api/status?token={tok}"))).await;
        last = status_body;
        if last["state"] == "done" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["state"], "done");
    assert_eq!(last["checked"], 5);
    assert_eq!(last["successful"], 1);

    let (status, results) = send(&app, get(&format!("/api/results?token={tok}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["results"][0]["proxyIP"], "1.1.1.1");
    assert_eq!(results["results"][0]["success"], true);
    assert_eq!(results["results"][4]["proxyIP"], "1.1.2.2");
}

#[tokio::test]
async fn scan_api_rejects_bad_token_and_empty_ranges() {
    let (app, authority) = build_app(None);
    let (status, _) = send(&app, post_json("/api/scan?token=nope", r#"{"ranges":["1.1.1.1-2"]}"#)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let tok = rotating_token(&authority);
    let (status, _) = send(&app, post_json(&format!("/api/scan?token={tok}"), r#"{"ranges":[" "]}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post_json(&format!("/api/scan/resume?token={tok}"), "")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
