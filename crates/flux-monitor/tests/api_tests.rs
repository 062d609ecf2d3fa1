use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use flux_monitor::{api, build, config::AppConfig, AppState};
use flux_shutdown::ShutdownPhase;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceExt;

async fn create_test_state() -> Arc<AppState> {
    let (_tx, rx) = watch::channel(ShutdownPhase::Running);
    build(&AppConfig::default(), rx)
        .await
        .expect("Failed to build app")
        .state
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn error_rate_rule() -> Value {
    json!({
        "name": "HighErrorRate",
        "query": "error_rate{service=\"checkout\"}",
        "condition": { "operator": "gt", "threshold": 0.05 },
        "severity": "critical",
        "annotations": { "summary": "Error rate {{ $value | humanizePercentage }}" }
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = api::create_router(create_test_state().await);

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["firing_alerts"], 0);
}

#[tokio::test]
async fn test_health_reports_draining() {
    let (tx, rx) = watch::channel(ShutdownPhase::Running);
    let state = build(&AppConfig::default(), rx).await.unwrap().state;
    let app = api::create_router(state);

    tx.send(ShutdownPhase::Draining).unwrap();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "draining");
}

#[tokio::test]
async fn test_ingest_partial_batch() {
    let state = create_test_state().await;
    let app = api::create_router(state.clone());

    let payload = json!({
        "metrics": [
            { "name": "cpu_usage", "type": "gauge", "value": 0.42, "labels": { "host": "web-1" } },
            { "name": "cpu_usage", "type": "gauge", "value": 0.57, "labels": { "host": "web-2" } },
            { "name": "123bad", "type": "gauge", "value": 1.0 }
        ]
    });
    let (status, body) = call(&app, "POST", "/metrics", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["rejected"], 1);
    assert_eq!(body["errors"][0]["index"], 2);

    state.pipeline.flush().await.unwrap();
    let (status, body) = call(&app, "GET", "/query?query=cpu_usage", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["series"].as_array().unwrap().len(), 2);

    let (_, body) = call(&app, "GET", "/query?query=cpu_usage%7Bhost%3D%22web-2%22%7D", None).await;
    assert_eq!(body["series"].as_array().unwrap().len(), 1);
    assert_eq!(body["series"][0]["points"][0][1], 0.57);
}

#[tokio::test]
async fn test_ingest_bare_array() {
    let app = api::create_router(create_test_state().await);

    let payload = json!([{ "name": "queue_depth", "value": 12, "timestamp": 1_700_000_000_000i64 }]);
    let (status, body) = call(&app, "POST", "/metrics", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 1);

    let (status, body) = call(&app, "POST", "/metrics", Some(json!({ "samples": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
}

#[tokio::test]
async fn test_range_query() {
    let state = create_test_state().await;
    let app = api::create_router(state.clone());

    let payload = json!([
        { "name": "latency", "value": 1.0, "timestamp": "2023-11-14T22:00:00Z" },
        { "name": "latency", "value": 3.0, "timestamp": "2023-11-14T22:00:30Z" },
        { "name": "latency", "value": 5.0, "timestamp": "2023-11-14T22:01:10Z" }
    ]);
    call(&app, "POST", "/metrics", Some(payload)).await;
    state.pipeline.flush().await.unwrap();

    let (status, body) = call(
        &app,
        "GET",
        "/query?query=avg(latency)&start=1699999200&end=2023-11-14T22:02:00Z&step=1m",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let points = body["series"][0]["points"].as_array().unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0], json!([1_699_999_200.0, 2.0]));
    assert_eq!(points[1], json!([1_699_999_260.0, 5.0]));
}

#[tokio::test]
async fn test_query_errors() {
    let app = api::create_router(create_test_state().await);

    let (status, body) = call(&app, "GET", "/query?query=avg(latency", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "query");

    let (status, body) = call(&app, "GET", "/query?query=latency&start=yesterday", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "start");
}

#[tokio::test]
async fn test_rule_crud() {
    let app = api::create_router(create_test_state().await);

    let (status, created) = call(&app, "POST", "/rules", Some(error_rate_rule())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["enabled"], true);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "POST", "/rules", Some(error_rate_rule())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (status, body) = call(&app, "GET", &format!("/rules/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "HighErrorRate");

    let mut updated = error_rate_rule();
    updated["severity"] = json!("warning");
    let (status, body) = call(&app, "PUT", &format!("/rules/{}", id), Some(updated)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["severity"], "warning");
    assert_eq!(body["id"], id.as_str());

    let (_, body) = call(&app, "GET", "/rules", None).await;
    assert_eq!(body["rules"].as_array().unwrap().len(), 1);

    let (status, _) = call(&app, "DELETE", &format!("/rules/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", &format!("/rules/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_rule_validation() {
    let app = api::create_router(create_test_state().await);

    let mut unknown_operator = error_rate_rule();
    unknown_operator["condition"] = json!({ "operator": "between", "threshold": 1.0 });
    let (status, body) = call(&app, "POST", "/rules", Some(unknown_operator)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let mut bad_query = error_rate_rule();
    bad_query["query"] = json!("avg(error_rate");
    let (status, _) = call(&app, "POST", "/rules", Some(bad_query)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad_sensitivity = error_rate_rule();
    bad_sensitivity["condition"] = json!({ "sensitivity": 1.5 });
    let (status, _) = call(&app, "POST", "/rules", Some(bad_sensitivity)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_alert_lifecycle_through_api() {
    let state = create_test_state().await;
    let app = api::create_router(state.clone());

    call(&app, "POST", "/rules", Some(error_rate_rule())).await;
    let payload = json!([{ "name": "error_rate", "value": 0.08, "labels": { "service": "checkout" } }]);
    call(&app, "POST", "/metrics", Some(payload)).await;
    state.pipeline.flush().await.unwrap();

    let stats = state.alerts.run_cycle(Utc::now()).await;
    assert_eq!(stats.succeeded, 1);

    let (status, body) = call(&app, "GET", "/alerts?status=firing", None).await;
    assert_eq!(status, StatusCode::OK);
    let alerts = body["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["severity"], "critical");
    assert_eq!(alerts[0]["annotations"]["summary"], "Error rate 8%");

    let (_, body) = call(&app, "GET", "/alerts?status=resolved", None).await;
    assert!(body["alerts"].as_array().unwrap().is_empty());

    let (_, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(body["firing_alerts"], 1);
}

#[tokio::test]
async fn test_notifications_endpoints() {
    let app = api::create_router(create_test_state().await);

    let (status, body) = call(&app, "GET", "/notifications?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["notifications"].as_array().unwrap().is_empty());

    let (status, body) = call(&app, "POST", "/notifications/missing/delivered", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_disabling_rule_resolves_alerts() {
    let state = create_test_state().await;
    let app = api::create_router(state.clone());

    let (_, rule) = call(&app, "POST", "/rules", Some(error_rate_rule())).await;
    let rule_id = rule["id"].as_str().unwrap().to_string();
    let payload = json!([{ "name": "error_rate", "value": 0.08, "labels": { "service": "checkout" } }]);
    call(&app, "POST", "/metrics", Some(payload)).await;
    state.pipeline.flush().await.unwrap();
    state.alerts.run_cycle(Utc::now()).await;

    let mut disabled = error_rate_rule();
    disabled["enabled"] = json!(false);
    let (status, body) = call(&app, "PUT", &format!("/rules/{rule_id}"), Some(disabled)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);

    let (_, body) = call(&app, "GET", "/alerts?status=resolved", None).await;
    assert_eq!(body["alerts"].as_array().unwrap().len(), 1);
    let (_, body) = call(&app, "GET", "/alerts?status=firing", None).await;
    assert!(body["alerts"].as_array().unwrap().is_empty());
}
