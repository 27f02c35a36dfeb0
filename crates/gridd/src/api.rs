//! REST surface of the control plane.
//!
//! Public session/platform/billing routes plus the agent callback routes,
//! all on one axum router. Errors render as `{"error": kind, "detail": ...}`
//! with the status mapping of the error taxonomy.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use grid_billing::{BillingQuery, BillingReport, month_to_date_window, rollup};
use grid_orchestrator::{Orchestrator, OrchestratorError, SessionRequest};
use grid_placement::Requirements;
use grid_proto::{
    Coord, EndedEvent, HostRecord, IdleEvent, PlacementChoice, PlatformProfile, Provider,
    SaveEvent, SessionManifest, StartedEvent,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

pub struct AppState {
    pub orchestrator: Orchestrator,
}

// ─── Error envelope ──────────────────────────────────────────────────────────

pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            OrchestratorError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            OrchestratorError::UnknownPlatform(_) => (StatusCode::NOT_FOUND, "unknown_platform"),
            OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            OrchestratorError::Gone(_) => (StatusCode::GONE, "gone"),
            OrchestratorError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            OrchestratorError::InsufficientProviders(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "insufficient_providers")
            }
            OrchestratorError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
            OrchestratorError::Provider { .. } => (StatusCode::BAD_GATEWAY, "provider_error"),
            OrchestratorError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            warn!(kind, detail = %self.0, "request failed");
        }
        let body = ErrorBody { error: kind, detail: self.0.to_string() };
        (status, Json(body)).into_response()
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let cors = cors_layer(cors_origins);

    Router::new()
        .route("/health", get(daemon_health))
        // Public session API
        .route("/sessions", post(create_session))
        .route("/sessions/:host_id", get(get_session).delete(destroy_session))
        .route("/sessions/:host_id/stop", post(stop_session))
        // Platform profiles
        .route("/platforms", get(list_platforms))
        .route("/platforms/:platform", get(get_platform).put(put_platform))
        // Optimizer query
        .route("/placements/candidates", get(placement_candidates))
        // Billing rollup
        .route("/billing", get(billing))
        // Agent callbacks
        .route("/hosts/:vm_token/manifest", get(fetch_manifest))
        .route("/hosts/:host_id/started", post(agent_started))
        .route("/hosts/:host_id/save_event", post(agent_save_event))
        .route("/hosts/:host_id/idle", post(agent_idle))
        .route("/hosts/:host_id/ended", post(agent_ended))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn daemon_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "service": "gridd",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CoordBody {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    user_id: String,
    platform: String,
    #[serde(default)]
    user_coord: Option<CoordBody>,
    #[serde(default)]
    save_ref: Option<String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<HostRecord>), ApiError> {
    let request = SessionRequest {
        user_id: body.user_id,
        platform: body.platform,
        user_coord: body.user_coord.map(|c| Coord::new(c.lat, c.lon)),
        save_ref: body.save_ref,
    };
    let host = state.orchestrator.request_session(request).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<Json<HostRecord>, ApiError> {
    Ok(Json(state.orchestrator.describe_session(&host_id)?))
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.stop_session(&host_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn destroy_session(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.destroy_session(&host_id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ─── Platforms ───────────────────────────────────────────────────────────────

async fn list_platforms(State(state): State<Arc<AppState>>) -> Json<Vec<PlatformProfile>> {
    Json(state.orchestrator.profiles().all())
}

async fn get_platform(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
) -> Result<Json<PlatformProfile>, ApiError> {
    state
        .orchestrator
        .profiles()
        .get(&platform)
        .map(Json)
        .ok_or_else(|| OrchestratorError::UnknownPlatform(platform).into())
}

async fn put_platform(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    Json(profile): Json<PlatformProfile>,
) -> Result<StatusCode, ApiError> {
    if profile.platform != platform {
        return Err(OrchestratorError::BadRequest(format!(
            "body platform '{}' does not match path '{platform}'",
            profile.platform
        ))
        .into());
    }
    state
        .orchestrator
        .profiles()
        .put(profile)
        .map_err(OrchestratorError::BadRequest)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Placements ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CandidatesQuery {
    provider: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    platform: String,
}

async fn placement_candidates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandidatesQuery>,
) -> Result<Json<Vec<PlacementChoice>>, ApiError> {
    let provider = parse_provider(&query.provider)?;
    let coord = match (query.lat, query.lon) {
        (Some(lat), Some(lon)) => {
            let coord = Coord::new(lat, lon);
            if !coord.is_valid() {
                return Err(OrchestratorError::BadRequest(format!(
                    "coordinate out of domain: {lat}, {lon}"
                ))
                .into());
            }
            Some(coord)
        }
        (None, None) => None,
        _ => {
            return Err(OrchestratorError::BadRequest(
                "lat and lon must be supplied together".to_string(),
            )
            .into());
        }
    };

    let profile = state
        .orchestrator
        .profiles()
        .get(&query.platform)
        .ok_or(OrchestratorError::UnknownPlatform(query.platform.clone()))?;
    let requirements = Requirements {
        min_vcpu: profile.min_vcpu,
        min_memory_gib: profile.min_memory_gib,
        min_gpu_count: profile.min_gpu_count,
    };

    let candidates = state
        .orchestrator
        .optimizer()
        .candidates(provider, coord, requirements)
        .await
        .map_err(OrchestratorError::from)?;
    Ok(Json(candidates))
}

fn parse_provider(value: &str) -> Result<Provider, ApiError> {
    match value {
        "tensordock" => Ok(Provider::TensorDock),
        "fly" => Ok(Provider::Fly),
        other => Err(OrchestratorError::BadRequest(format!("unknown provider '{other}'")).into()),
    }
}

// ─── Billing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BillingQueryParams {
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

async fn billing(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BillingQueryParams>,
) -> Result<Json<BillingReport>, ApiError> {
    let (month_start, now) = month_to_date_window(Utc::now());
    let provider = params.provider.as_deref().map(parse_provider).transpose()?;
    let query = BillingQuery {
        from: params.from.unwrap_or(month_start),
        to: params.to.unwrap_or(now),
        provider,
        user_id: params.user_id,
    };
    if query.to < query.from {
        return Err(
            OrchestratorError::BadRequest("billing window ends before it starts".to_string())
                .into(),
        );
    }

    let hosts = state.orchestrator.hosts().all();
    let profiles = state.orchestrator.profiles().all();
    let report = rollup(&hosts, &profiles, &state.orchestrator.rates(), &query);
    Ok(Json(report))
}

// ─── Agent callbacks ─────────────────────────────────────────────────────────

async fn fetch_manifest(
    State(state): State<Arc<AppState>>,
    Path(vm_token): Path<String>,
) -> Result<Json<SessionManifest>, ApiError> {
    Ok(Json(state.orchestrator.manifest_for_token(&vm_token)?))
}

async fn agent_started(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
    Json(event): Json<StartedEvent>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.handle_started(&host_id, event).await?;
    Ok(StatusCode::OK)
}

async fn agent_save_event(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
    Json(event): Json<SaveEvent>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.handle_save_event(&host_id, event).await?;
    Ok(StatusCode::OK)
}

async fn agent_idle(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
    Json(event): Json<IdleEvent>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.handle_idle(&host_id, event).await?;
    Ok(StatusCode::OK)
}

async fn agent_ended(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
    Json(event): Json<EndedEvent>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.handle_ended(&host_id, event).await?;
    Ok(StatusCode::OK)
}
