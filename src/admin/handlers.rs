use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::config::validation::MAX_BLOCK_SECS;
use crate::error::{ShieldError, ShieldResult};
use crate::http::server::AppState;
use crate::security::abuse::{DeviceStatus, RecommendedAction};
use crate::security::incident::journal::SecurityEvent;
use crate::security::incident::response::{ResponseAction, ResponseReport};
use crate::security::incident::{BlockEntry, IdentityState, Incident, IncidentKind};
use crate::security::pipeline::StackStatus;
use crate::security::rate_limit::QuotaStatus;
use crate::security::session::Session;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub stack: StackStatus,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        stack: state.stack.status(),
    })
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

fn default_event_limit() -> usize {
    100
}

pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<SecurityEvent>> {
    Json(state.stack.coordinator().journal().recent(query.limit))
}

// Incidents

#[derive(Debug, Deserialize)]
pub struct IncidentQuery {
    #[serde(default)]
    pub unresolved: bool,
}

pub async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<IncidentQuery>,
) -> Json<Vec<Incident>> {
    Json(state.stack.coordinator().list_incidents(query.unresolved))
}

#[derive(Debug, Deserialize)]
pub struct CreateIncident {
    pub identity: String,
    pub kind: IncidentKind,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

pub async fn create_incident(
    State(state): State<AppState>,
    Json(body): Json<CreateIncident>,
) -> (StatusCode, Json<Incident>) {
    let incident = state
        .stack
        .coordinator()
        .create_incident(&body.identity, body.kind, body.details);
    (StatusCode::CREATED, Json(incident))
}

pub async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ShieldResult<Json<Incident>> {
    state.stack.coordinator().get_incident(&id).map(Json)
}

#[derive(Debug, Deserialize)]
pub struct RespondBody {
    pub actions: Vec<ResponseAction>,
}

pub async fn respond_to_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> ShieldResult<Json<ResponseReport>> {
    state
        .stack
        .coordinator()
        .respond(&id, &body.actions)
        .await
        .map(Json)
}

pub async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ShieldResult<Json<Incident>> {
    state.stack.coordinator().resolve_incident(&id).map(Json)
}

// Blocks

#[derive(Debug, Deserialize)]
pub struct CreateBlock {
    pub identity: String,
    /// Defaults to the configured block duration.
    pub duration_secs: Option<u64>,
    #[serde(default = "default_block_reason")]
    pub reason: String,
}

fn default_block_reason() -> String {
    "manual".to_string()
}

pub async fn create_block(
    State(state): State<AppState>,
    Json(body): Json<CreateBlock>,
) -> ShieldResult<(StatusCode, Json<BlockEntry>)> {
    let coordinator = state.stack.coordinator();
    let duration_secs = body
        .duration_secs
        .unwrap_or(coordinator.config().block_duration_minutes.saturating_mul(60));
    if duration_secs == 0 || duration_secs > MAX_BLOCK_SECS {
        return Err(ShieldError::invalid(
            "duration_secs",
            format!("must be within 1..={}", MAX_BLOCK_SECS),
        ));
    }
    let entry = coordinator.block(&body.identity, Duration::from_secs(duration_secs), &body.reason);
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Serialize)]
pub struct BlockView {
    pub state: IdentityState,
    pub violations: u32,
    pub remaining_secs: u64,
    pub block: BlockEntry,
}

pub async fn get_block(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ShieldResult<Json<BlockView>> {
    let coordinator = state.stack.coordinator();
    let block = coordinator
        .block_entry(&identity)
        .ok_or_else(|| ShieldError::not_found("block", identity.as_str()))?;
    Ok(Json(BlockView {
        state: coordinator.state(&identity),
        violations: coordinator.violation_count(&identity),
        remaining_secs: coordinator.block_remaining_secs(&identity).unwrap_or(0),
        block,
    }))
}

pub async fn delete_block(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ShieldResult<StatusCode> {
    state.stack.coordinator().unblock(&identity)?;
    Ok(StatusCode::NO_CONTENT)
}

// Devices

#[derive(Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub status: DeviceStatus,
    pub recommended_action: RecommendedAction,
    pub blocked_for_secs: Option<u64>,
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ShieldResult<Json<DeviceView>> {
    let detector = state.stack.detector();
    let status = detector
        .device_status(&identity)
        .ok_or_else(|| ShieldError::not_found("device", identity.as_str()))?;
    Ok(Json(DeviceView {
        status,
        recommended_action: detector.recommended_action(&identity),
        blocked_for_secs: detector.device_block_remaining_secs(&identity),
    }))
}

pub async fn reset_device(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ShieldResult<StatusCode> {
    state.stack.detector().reset_device(&identity)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unblock_device(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ShieldResult<StatusCode> {
    state.stack.detector().unblock_device(&identity)?;
    Ok(StatusCode::NO_CONTENT)
}

// Rate limits

pub async fn get_limit(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Json<QuotaStatus> {
    Json(state.stack.limiter().peek(&identity))
}

pub async fn reset_limit(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> StatusCode {
    state.stack.limiter().reset(&identity);
    StatusCode::NO_CONTENT
}

// Sessions

#[derive(Debug, Deserialize)]
pub struct CreateSession {
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub source_ip: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSession>,
) -> (StatusCode, Json<Session>) {
    let session = state.stack.sessions().create_session(
        &body.user_id,
        &body.access_token,
        &body.user_agent,
        &body.source_ip,
    );
    (StatusCode::CREATED, Json(session))
}

#[derive(Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    /// Evaluated now, including timeout.
    pub currently_valid: bool,
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ShieldResult<Json<SessionView>> {
    let sessions = state.stack.sessions();
    let session = sessions.get_session(&id)?;
    Ok(Json(SessionView {
        currently_valid: sessions.is_valid(&id),
        session,
    }))
}

pub async fn touch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ShieldResult<Json<serde_json::Value>> {
    let valid = state.stack.sessions().touch(&id)?;
    Ok(Json(serde_json::json!({ "valid": valid })))
}

pub async fn invalidate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ShieldResult<Json<serde_json::Value>> {
    let changed = state.stack.sessions().invalidate(&id)?;
    Ok(Json(serde_json::json!({ "invalidated": changed })))
}

pub async fn list_user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Vec<Session>> {
    Json(state.stack.sessions().sessions_for_user(&user_id))
}

pub async fn invalidate_user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let count = state.stack.sessions().invalidate_all_for_user(&user_id);
    Json(serde_json::json!({ "invalidated": count }))
}

// Tokens

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub token: String,
}

pub async fn revoke_token(
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> ShieldResult<StatusCode> {
    state.stack.sessions().revoke_token(&body.token)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn validate_token(
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> Json<serde_json::Value> {
    let valid = state.stack.sessions().is_token_valid(&body.token);
    Json(serde_json::json!({ "valid": valid }))
}
