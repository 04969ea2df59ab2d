//! # Admin and Admission HTTP Server
//!
//! A small axum application in front of the [`AdmissionGate`]. The request
//! handling layer calls the `/v1` endpoints around each upstream call;
//! operators use `/admin` to inspect and lift channel quarantines.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET | `/health` | liveness |
//! | POST | `/v1/admission` | admit or deny one request |
//! | POST | `/v1/completions` | report latency/duration of a finished call |
//! | POST | `/v1/credentials/resolve` | routing group for a credential secret |
//! | GET | `/admin/channels/disabled` | current quarantines |
//! | GET | `/admin/channels/:channel_id/models/:model/stats` | window statistics |
//! | DELETE | `/admin/channels/:channel_id/models/:model/disabled` | lift a quarantine |
//! | GET | `/v1/groups?user_group=` | groups a caller may choose, by priority |
//! | GET | `/admin/groups` | current group catalog |
//! | PUT | `/admin/groups` | replace the group catalog (either JSON form) |
//! | PUT | `/admin/groups/:name/priority` | change one group's priority |

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::{AdmissionDecision, AdmissionGate, AdmissionRequest};
use crate::core::error::{GatewayError, GatewayResult};
use crate::credential::{CatalogEntry, GroupCatalog, UsableGroup};
use crate::health::{DisabledEntry, MonitorSnapshot, Sample};

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub gate: AdmissionGate,
    pub catalog: Arc<GroupCatalog>,
}

impl AppState {
    /// State with the built-in group catalog
    pub fn new(gate: AdmissionGate) -> Self {
        Self {
            gate,
            catalog: Arc::new(GroupCatalog::default()),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<GroupCatalog>) -> Self {
        self.catalog = catalog;
        self
    }
}

/// Telemetry for one finished upstream call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub channel_id: i64,
    pub model: String,
    /// Negative when the first response time was not measured
    pub latency_ms: i64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub group: String,
    pub groups: Vec<String>,
    pub multi_group: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupsQuery {
    #[serde(default)]
    pub user_group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityUpdate {
    pub priority: i32,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/admission", post(admit))
        .route("/v1/completions", post(report_completion))
        .route("/v1/credentials/resolve", post(resolve_credential))
        .route("/admin/channels/disabled", get(list_disabled))
        .route(
            "/admin/channels/:channel_id/models/:model/stats",
            get(channel_stats),
        )
        .route(
            "/admin/channels/:channel_id/models/:model/disabled",
            delete(recover_channel),
        )
        .route("/v1/groups", get(usable_groups))
        .route("/admin/groups", get(group_catalog).put(replace_group_catalog))
        .route("/admin/groups/:name/priority", put(set_group_priority))
        .with_state(state)
}

/// Serve `router` on `addr` until `cancel` fires
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> GatewayResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::internal(format!("Failed to bind admin server to {}: {}", addr, e)))?;
    info!(%addr, "Admin HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| GatewayError::internal(format!("Admin server error: {}", e)))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn admit(
    State(state): State<AppState>,
    Json(request): Json<AdmissionRequest>,
) -> Result<Response, GatewayError> {
    match state.gate.admit(&request).await? {
        AdmissionDecision::Allow => Ok(Json(json!({ "decision": "allow" })).into_response()),
        AdmissionDecision::Deny(rejection) => Ok(rejection.into_response()),
    }
}

async fn report_completion(
    State(state): State<AppState>,
    Json(report): Json<CompletionReport>,
) -> StatusCode {
    let sample = Sample::from_raw(report.latency_ms, report.duration_secs);
    state
        .gate
        .report_completion(report.channel_id, &report.model, sample);
    StatusCode::NO_CONTENT
}

async fn resolve_credential(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, GatewayError> {
    let mut credential = state
        .gate
        .router()
        .load(&request.key)
        .await?
        .ok_or_else(|| GatewayError::not_found("credential"))?;

    let group = state.gate.resolve_group(&mut credential);
    Ok(Json(ResolveResponse {
        group,
        groups: credential.all_groups(),
        multi_group: credential.groups.is_multi(),
    }))
}

async fn list_disabled(State(state): State<AppState>) -> Json<Vec<DisabledEntry>> {
    Json(state.gate.health().disabled_entries())
}

async fn channel_stats(
    State(state): State<AppState>,
    Path((channel_id, model)): Path<(i64, String)>,
) -> Result<Json<MonitorSnapshot>, GatewayError> {
    state
        .gate
        .health()
        .monitor_stats(channel_id, &model)
        .map(Json)
        .ok_or_else(|| GatewayError::not_found(format!("no monitor for channel {} model {}", channel_id, model)))
}

async fn recover_channel(
    State(state): State<AppState>,
    Path((channel_id, model)): Path<(i64, String)>,
) -> Result<StatusCode, GatewayError> {
    state
        .gate
        .health()
        .recover(channel_id, &model)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| GatewayError::not_found(format!("channel {} model {} is not disabled", channel_id, model)))
}

async fn usable_groups(
    State(state): State<AppState>,
    Query(query): Query<GroupsQuery>,
) -> Json<Vec<UsableGroup>> {
    Json(state.catalog.sorted_for(&query.user_group))
}

async fn group_catalog(State(state): State<AppState>) -> Json<BTreeMap<String, CatalogEntry>> {
    Json(state.catalog.snapshot().as_ref().clone())
}

async fn replace_group_catalog(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let groups = state.catalog.reload_from_str(&body)?;
    Ok(Json(json!({ "groups": groups })))
}

async fn set_group_priority(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<PriorityUpdate>,
) -> Result<StatusCode, GatewayError> {
    if state.catalog.set_priority(&name, update.priority) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::not_found(format!("group {} is not in the catalog", name)))
    }
}
