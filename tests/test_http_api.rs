//! HTTP surface tests: template lifecycle, auth, rate limiting, overload.

mod common;

use axum::http::StatusCode;
use regex::Regex;
use serde_json::json;
use tower::util::ServiceExt;

use common::{bare_request, body_json, json_request, open_app, open_config};
use toolgate::config::AuthMode;

fn cat_template(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "transport": "stdio",
        "command": "/bin/cat",
        "args": [],
        "timeoutMs": 1000,
        "retries": 0,
    })
}

#[tokio::test]
async fn template_registration_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = open_app(&dir);

    // Register.
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/templates", &cat_template("echo")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Listed.
    let response = app.clone().oneshot(bare_request("GET", "/api/templates")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["echo"]);

    // Instantiate.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/services",
            &json!({"templateName": "echo"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let service_id = body["serviceId"].as_str().unwrap().to_string();
    let id_shape = Regex::new(r"^echo-\d+-[a-z0-9]{6}$").unwrap();
    assert!(id_shape.is_match(&service_id), "unexpected id {service_id}");

    // Fresh instance sits in idle.
    let response = app
        .clone()
        .oneshot(bare_request("GET", &format!("/api/services/{service_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["state"], "idle");

    // The template file was persisted.
    assert!(dir.path().join("templates/echo.json").exists());
}

#[tokio::test]
async fn duplicate_template_save_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = open_app(&dir);

    let first = app
        .clone()
        .oneshot(json_request("POST", "/api/templates", &cat_template("echo")))
        .await
        .unwrap();
    assert_eq!(body_json(first).await["changed"], json!(true));

    let second = app
        .clone()
        .oneshot(json_request("POST", "/api/templates", &cat_template("echo")))
        .await
        .unwrap();
    assert_eq!(body_json(second).await["changed"], json!(false));
}

#[tokio::test]
async fn delete_unknown_template_is_noop_false() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = open_app(&dir);
    let response = app
        .oneshot(bare_request("DELETE", "/api/templates/never-was"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["removed"], json!(false));
}

#[tokio::test]
async fn invalid_template_is_400_with_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = open_app(&dir);
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/templates",
            &json!({"name": "broken", "transport": "stdio"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "validation");
    assert!(body["message"].as_str().unwrap().contains("command"));
}

#[tokio::test]
async fn health_endpoint_needs_no_auth() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = open_config();
    config.auth.mode = AuthMode::Token;
    config.auth.bearer_tokens = vec!["token-0123456789".into()];
    let state = common::build_state(config, dir.path());
    let app = toolgate::web::build_app(state);

    let response = app.oneshot(bare_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["uptimeMs"].is_u64());
}

#[tokio::test]
async fn api_requires_credentials_in_token_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = open_config();
    config.auth.mode = AuthMode::Token;
    config.auth.bearer_tokens = vec!["token-0123456789".into()];
    config.auth.api_keys = [("key-9876543210".to_string(), "ci".to_string())].into();
    let state = common::build_state(config, dir.path());
    let app = toolgate::web::build_app(state);

    // Nothing presented.
    let response = app.clone().oneshot(bare_request("GET", "/api/templates")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "unauthorized");
    assert_eq!(body["meta"]["stage"], "before_agent");

    // Wrong bearer.
    let mut request = bare_request("GET", "/api/templates");
    request
        .headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Correct bearer.
    let mut request = bare_request("GET", "/api/templates");
    request
        .headers_mut()
        .insert("authorization", "Bearer token-0123456789".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // API key works too.
    let mut request = bare_request("GET", "/api/templates");
    request.headers_mut().insert("x-api-key", "key-9876543210".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Both at once is a validation failure, not an auth failure.
    let mut request = bare_request("GET", "/api/templates");
    request
        .headers_mut()
        .insert("authorization", "Bearer token-0123456789".parse().unwrap());
    request.headers_mut().insert("x-api-key", "key-9876543210".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "validation");
}

#[tokio::test]
async fn rate_limit_bounds_requests_per_principal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = open_config();
    config.rate_limit.capacity = 2;
    config.rate_limit.refill_per_sec = 0.001;
    let state = common::build_state(config, dir.path());
    let app = toolgate::web::build_app(state);

    for _ in 0..2 {
        let response = app.clone().oneshot(bare_request("GET", "/api/templates")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(bare_request("GET", "/api/templates")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body = body_json(response).await;
    assert_eq!(body["code"], "rate_limited");
    assert_eq!(body["recoverable"], json!(true));
}

#[tokio::test]
async fn exhausted_ceiling_fails_fast_with_overloaded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = open_config();
    config.request_ceiling = 1;
    let state = common::build_state(config, dir.path());
    // Burn the only permit so every request fails fast.
    state.ceiling.try_acquire().unwrap().forget();
    let app = toolgate::web::build_app(state);

    let response = app.oneshot(bare_request("GET", "/api/templates")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "overloaded");
}

#[tokio::test]
async fn template_env_patch_produces_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = open_app(&dir);

    app.clone()
        .oneshot(json_request("POST", "/api/templates", &cat_template("echo")))
        .await
        .unwrap();
    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/api/templates/echo/env",
            &json!({"MODE": "fast"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stored = state.registry.get_template("echo").unwrap();
    assert_eq!(stored.env.get("MODE").map(String::as_str), Some("fast"));
}

#[tokio::test]
async fn diagnose_reports_findings() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = open_app(&dir);

    app.clone()
        .oneshot(json_request("POST", "/api/templates", &cat_template("echo")))
        .await
        .unwrap();
    let response = app
        .clone()
        .oneshot(bare_request("POST", "/api/templates/echo/diagnose"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
    assert!(body["findings"].as_array().unwrap().len() >= 2);

    // Unknown template is a 404.
    let response = app
        .oneshot(bare_request("POST", "/api/templates/ghost/diagnose"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_round_trip_via_api() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = open_app(&dir);

    let response = app.clone().oneshot(bare_request("GET", "/api/config")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut config = body_json(response).await;
    config["port"] = json!(9999);

    let response = app
        .clone()
        .oneshot(json_request("PUT", "/api/config", &config))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.config.read().unwrap().port, 9999);
    assert!(dir.path().join("gateway.json").exists());

    // Invalid config rejected.
    config["requestCeiling"] = json!(0);
    let response = app
        .oneshot(json_request("PUT", "/api/config", &config))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_service_paths_are_404() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = open_app(&dir);
    for uri in [
        "/api/services/ghost-1-abcdef",
        "/api/services/ghost-1-abcdef/health",
        "/api/services/ghost-1-abcdef/logs",
    ] {
        let response = app.clone().oneshot(bare_request("GET", uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {uri}");
        assert_eq!(body_json(response).await["code"], "not_found");
    }
}
