//! HTTP router and handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::Error;
use crate::failsafe::CircuitBreakerStats;
use crate::monitor::{DegradationLevel, DegradationState, HealthStatus, ResourceThresholds};
use crate::plane::ResiliencePlane;

/// Shared application state
pub struct AppState {
    /// Control plane
    pub plane: Arc<ResiliencePlane>,
    /// Bearer token required on admin routes, if set
    pub admin_token: Option<String>,
    /// Prometheus render handle
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    /// State with no metrics exporter
    #[must_use]
    pub fn new(plane: Arc<ResiliencePlane>, admin_token: Option<String>) -> Self {
        Self {
            plane,
            admin_token,
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/admin/circuit-breakers", get(list_breakers_handler))
        .route(
            "/admin/circuit-breakers/{name}/reset",
            post(reset_breaker_handler),
        )
        .route("/admin/services", get(services_handler))
        .route("/admin/features", get(features_handler))
        .route("/admin/features/{name}", put(set_feature_handler))
        .route("/admin/degradation/trigger", post(trigger_degradation_handler))
        .route("/admin/degradation/recover", post(recover_handler))
        .route(
            "/admin/thresholds",
            get(get_thresholds_handler).put(put_thresholds_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            admin_auth_middleware,
        ));

    let router = Router::new()
        .route("/health", get(health_handler))
        .merge(admin);

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after();
        let message = if self.is_circuit_open() {
            "Service temporarily unavailable, retry shortly".to_string()
        } else {
            self.to_string()
        };

        let mut response = (
            status,
            Json(json!({
                "error": message,
                "detail": self.to_string(),
            })),
        )
            .into_response();

        if let Some(after) = retry_after {
            // round up so clients never retry before the breaker admits a trial call
            let secs = after.as_secs().saturating_add(u64::from(after.subsec_nanos() > 0));
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

/// Admin authentication middleware
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    use subtle::ConstantTimeEq;

    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    let matches = provided.is_some_and(|p| p.as_bytes().ct_eq(expected.as_bytes()).into());
    if matches {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected admin request");
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(json!({
                "error": "Missing or invalid admin token. Use: Authorization: Bearer <token>"
            })),
        )
            .into_response()
    }
}

/// Health check handler
///
/// Returns 503 only when degradation is severe so load balancers keep
/// routing to a merely degraded instance.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.plane.health_report();
    let status = if report.status == HealthStatus::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

async fn list_breakers_handler(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<String, CircuitBreakerStats>> {
    Json(state.plane.registry().stats().into_iter().collect())
}

async fn reset_breaker_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, Error> {
    state.plane.registry().force_reset(&name)?;
    info!(service = %name, "Circuit breaker reset by operator");
    Ok(Json(json!({
        "name": name,
        "state": "CLOSED",
    })))
}

async fn services_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let degradation = state.plane.degradation();
    let services: BTreeMap<_, _> = degradation.all_service_health().into_iter().collect();
    Json(json!({
        "fallback_enabled": degradation.fallback_enabled(),
        "services": services,
    }))
}

async fn features_handler(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, bool>> {
    Json(state.plane.flags().snapshot())
}

/// Body of `PUT /admin/features/{name}`
#[derive(Debug, Deserialize)]
struct FeatureUpdate {
    enabled: bool,
    /// With `enabled: false`, restore the flag after this many seconds
    #[serde(default)]
    disable_for_secs: Option<u64>,
}

async fn set_feature_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(update): Json<FeatureUpdate>,
) -> Json<Value> {
    let flags = state.plane.flags();
    match (update.enabled, update.disable_for_secs) {
        (false, Some(secs)) => {
            flags.disable_temporarily(&name, std::time::Duration::from_secs(secs));
        }
        (enabled, _) => flags.set_flag(&name, enabled),
    }
    Json(json!({
        "name": name,
        "enabled": flags.is_enabled(&name),
    }))
}

/// Body of `POST /admin/degradation/trigger`
#[derive(Debug, Deserialize)]
struct TriggerRequest {
    level: DegradationLevel,
    #[serde(default)]
    reason: Option<String>,
}

async fn trigger_degradation_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> Json<DegradationState> {
    let reason = request.reason.as_deref().unwrap_or("operator request");
    let monitor = state.plane.monitor();
    monitor.trigger_degradation(request.level, reason).await;
    Json(monitor.state())
}

async fn recover_handler(State(state): State<Arc<AppState>>) -> Json<DegradationState> {
    let monitor = state.plane.monitor();
    monitor.trigger_recovery().await;
    Json(monitor.state())
}

async fn get_thresholds_handler(State(state): State<Arc<AppState>>) -> Json<ResourceThresholds> {
    Json(state.plane.monitor().thresholds())
}

async fn put_thresholds_handler(
    State(state): State<Arc<AppState>>,
    Json(thresholds): Json<ResourceThresholds>,
) -> Result<Json<ResourceThresholds>, Error> {
    state.plane.monitor().update_thresholds(thresholds)?;
    debug!("Thresholds replaced via admin API");
    Ok(Json(thresholds))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}
