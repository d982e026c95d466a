//! HTTP surface tests: health endpoint, admin authentication and operator
//! controls, driven through the router without binding a socket

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use pretty_assertions::assert_eq;
use resilience_plane::config::Config;
use resilience_plane::monitor::{DegradationLevel, FEATURE_ANALYTICS, FeatureFlags, ScriptedMetrics};
use resilience_plane::server::{AppState, create_router};
use resilience_plane::{Error, ResiliencePlane};
use serde_json::{Value, json};
use tower::ServiceExt;

const TOKEN: &str = "test-admin-token";

fn setup() -> (Arc<ResiliencePlane>, Router) {
    let plane = Arc::new(ResiliencePlane::with_source(
        Config::default(),
        Arc::new(ScriptedMetrics::new([(20.0, 30.0)])),
        Arc::new(FeatureFlags::new()),
        None,
    ));
    let state = Arc::new(AppState::new(Arc::clone(&plane), Some(TOKEN.to_string())));
    (plane, create_router(state))
}

fn admin(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

#[tokio::test]
async fn test_health_reports_healthy_then_critical() {
    let (plane, router) = setup();
    plane.monitor().sample_now().await.unwrap();

    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["degradation"]["level"], "NONE");

    plane
        .monitor()
        .trigger_degradation(DegradationLevel::Moderate, "test")
        .await;
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");

    plane
        .monitor()
        .trigger_degradation(DegradationLevel::Severe, "test")
        .await;
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "critical");
}

#[tokio::test]
async fn test_admin_requires_bearer_token() {
    let (_, router) = setup();

    let request = Request::get("/admin/circuit-breakers")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );

    let request = Request::get("/admin/circuit-breakers")
        .header(header::AUTHORIZATION, "Bearer wrong-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&router, admin(Method::GET, "/admin/circuit-breakers", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_breaker_listing_and_reset() {
    let (plane, router) = setup();
    for _ in 0..3 {
        let _ = plane
            .execute("redis", || async { Err::<(), _>(Error::connection("down")) })
            .await;
    }

    let (status, body) = send(&router, admin(Method::GET, "/admin/circuit-breakers", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["redis"]["state"], "OPEN");

    let (status, body) = send(
        &router,
        admin(Method::POST, "/admin/circuit-breakers/redis/reset", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "CLOSED");
    assert!(plane.registry().open_circuits().is_empty());

    let (status, _) = send(
        &router,
        admin(Method::POST, "/admin/circuit-breakers/unknown/reset", None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_feature_toggle() {
    let (plane, router) = setup();

    let uri = format!("/admin/features/{FEATURE_ANALYTICS}");
    let (status, body) = send(
        &router,
        admin(Method::PUT, &uri, Some(json!({"enabled": false}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert!(!plane.flags().is_enabled(FEATURE_ANALYTICS));

    let (status, body) = send(&router, admin(Method::GET, "/admin/features", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[FEATURE_ANALYTICS], false);
}

#[tokio::test]
async fn test_unbounded_temporary_disable_is_accepted() {
    let (plane, router) = setup();

    let uri = format!("/admin/features/{FEATURE_ANALYTICS}");
    let (status, body) = send(
        &router,
        admin(
            Method::PUT,
            &uri,
            Some(json!({"enabled": false, "disable_for_secs": u64::MAX})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert!(!plane.flags().is_enabled(FEATURE_ANALYTICS));
}

#[tokio::test]
async fn test_manual_trigger_and_recover() {
    let (plane, router) = setup();

    let (status, body) = send(
        &router,
        admin(
            Method::POST,
            "/admin/degradation/trigger",
            Some(json!({"level": "SEVERE", "reason": "game day"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["level"], "SEVERE");
    assert_eq!(body["reason"], "game day");
    assert!(!plane.flags().is_enabled(FEATURE_ANALYTICS));

    let (status, body) = send(&router, admin(Method::POST, "/admin/degradation/recover", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_active"], false);
    assert!(plane.flags().is_enabled(FEATURE_ANALYTICS));
}

#[tokio::test]
async fn test_threshold_update_is_validated() {
    let (plane, router) = setup();

    let (status, mut thresholds) =
        send(&router, admin(Method::GET, "/admin/thresholds", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(thresholds["critical_cpu"], 85.0);

    thresholds["warning_cpu"] = json!(65.0);
    let (status, _) = send(
        &router,
        admin(Method::PUT, "/admin/thresholds", Some(thresholds.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plane.monitor().thresholds().warning_cpu, 65.0);

    thresholds["recovery_cpu"] = json!(99.0);
    let (status, body) = send(
        &router,
        admin(Method::PUT, "/admin/thresholds", Some(thresholds)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Configuration error"));
    assert_eq!(plane.monitor().thresholds().recovery_cpu, 60.0);
}

#[tokio::test]
async fn test_open_circuit_maps_to_503_with_retry_after() {
    use axum::response::IntoResponse;

    let err = Error::CircuitOpen {
        service: "redis".to_string(),
        retry_after: std::time::Duration::from_millis(1_500),
    };
    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
}
