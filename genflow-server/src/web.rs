//! HTTP surface: REST endpoints plus the SSE progress stream.
//!
//! REST calls authenticate with `Authorization: Bearer`. The stream endpoint
//! also accepts `?token=` or a one-time `?ticket=`, since browser
//! EventSource cannot set headers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::bearer_token;
use crate::db::StateCounts;
use crate::error::ApiError;
use crate::model::{
    GenerationId, GenerationKind, GenerationRecord, ModelParams, NewGeneration, Persona, now_secs,
};
use crate::rate::RateDecision;
use crate::server::SharedState;
use crate::stages::validate_request;

const MAX_PERSONA_NAME_CHARS: usize = 100;
const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 100;

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/personas", get(api_list_personas).post(api_create_persona))
        .route("/api/v1/personas/{id}/generations", get(api_persona_generations))
        .route("/api/v1/generations", post(api_create_generation))
        .route("/api/v1/generations/{id}", get(api_get_generation))
        .route("/api/v1/generations/{id}/ticket", post(api_stream_ticket))
        .route("/api/v1/generations/{id}/stream", get(api_stream))
        .layer({
            use axum::http::{Method, header};
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Helpers ────────────────────────────────────────────────────────────

/// Requester id from the bearer credential.
fn require_requester(state: &SharedState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    verify_token(state, token)
}

fn verify_token(state: &SharedState, token: &str) -> Result<String, ApiError> {
    state.auth.verify(token, now_secs()).map_err(|e| {
        tracing::debug!("Credential refused: {e}");
        ApiError::Unauthorized
    })
}

fn parse_generation_id(raw: &str) -> Result<GenerationId, ApiError> {
    GenerationId::parse(raw).ok_or_else(|| ApiError::Validation(format!("invalid generation id `{raw}`")))
}

/// A persona owned by `requester`. Someone else's persona reads as missing.
fn owned_persona(state: &SharedState, requester: &str, persona_id: &str) -> Result<Persona, ApiError> {
    match state.db.get_persona(persona_id)? {
        Some(p) if p.owner == requester => Ok(p),
        _ => Err(ApiError::NotFound("persona".to_string())),
    }
}

/// Load a generation and check the caller owns its persona.
fn authorized_generation(
    state: &SharedState,
    requester: &str,
    id: &GenerationId,
) -> Result<GenerationRecord, ApiError> {
    let rec = state
        .db
        .get_generation(id)?
        .ok_or_else(|| ApiError::NotFound("generation".to_string()))?;
    let owner = match state.db.get_persona(&rec.persona_id)? {
        Some(persona) => persona.owner,
        None => rec.requester.clone(),
    };
    if owner != requester {
        return Err(ApiError::Forbidden);
    }
    Ok(rec)
}

// ── Health ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    generations: StateCounts,
    pending_tickets: usize,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        generations: state.db.state_counts()?,
        pending_tickets: state.tickets.len(),
    }))
}

// ── Personas ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreatePersona {
    name: String,
}

async fn api_create_persona(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Result<Json<CreatePersona>, JsonRejection>,
) -> Result<(StatusCode, Json<Persona>), ApiError> {
    let requester = require_requester(&state, &headers)?;
    let Json(body) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let name = body.name.trim();
    if name.is_empty() || name.chars().count() > MAX_PERSONA_NAME_CHARS {
        return Err(ApiError::Validation(format!(
            "name must be 1 to {MAX_PERSONA_NAME_CHARS} characters"
        )));
    }
    let persona = state.db.insert_persona(&requester, name)?;
    tracing::info!(persona_id = %persona.id, owner = %requester, "Persona created");
    Ok((StatusCode::CREATED, Json(persona)))
}

async fn api_list_personas(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Persona>>, ApiError> {
    let requester = require_requester(&state, &headers)?;
    Ok(Json(state.db.list_personas(&requester)?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn api_persona_generations(
    Path(persona_id): Path<String>,
    Query(params): Query<HistoryQuery>,
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<GenerationRecord>>, ApiError> {
    let requester = require_requester(&state, &headers)?;
    owned_persona(&state, &requester, &persona_id)?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.db.list_generations(&persona_id, limit)?))
}

// ── Generations ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateGeneration {
    persona_id: String,
    kind: GenerationKind,
    prompt: String,
    #[serde(default)]
    params: ModelParams,
}

async fn api_create_generation(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Result<Json<CreateGeneration>, JsonRejection>,
) -> Result<(StatusCode, Json<GenerationRecord>), ApiError> {
    let requester = require_requester(&state, &headers)?;
    let Json(body) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let (prompt, _) = validate_request(&body.prompt, &body.params).map_err(ApiError::Validation)?;
    owned_persona(&state, &requester, &body.persona_id)?;

    if let RateDecision::Rejected { retry_after_secs } =
        state.rate_gate.check(&state.db, &body.persona_id, now_secs())?
    {
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let record = state.db.insert_generation(&NewGeneration {
        persona_id: body.persona_id,
        requester,
        kind: body.kind,
        prompt,
        params: body.params,
    })?;
    tracing::info!(
        generation_id = %record.id,
        persona_id = %record.persona_id,
        kind = %record.kind,
        "Generation created"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

async fn api_get_generation(
    Path(id): Path<String>,
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<GenerationRecord>, ApiError> {
    let requester = require_requester(&state, &headers)?;
    let id = parse_generation_id(&id)?;
    Ok(Json(authorized_generation(&state, &requester, &id)?))
}

#[derive(Serialize)]
struct TicketResponse {
    ticket: String,
    expires_in_secs: u64,
}

async fn api_stream_ticket(
    Path(id): Path<String>,
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<TicketResponse>, ApiError> {
    let requester = require_requester(&state, &headers)?;
    let id = parse_generation_id(&id)?;
    authorized_generation(&state, &requester, &id)?;
    Ok(Json(TicketResponse {
        ticket: state.tickets.issue(&id, &requester),
        expires_in_secs: state.config.ticket_ttl_secs,
    }))
}

#[derive(Deserialize)]
struct StreamQuery {
    ticket: Option<String>,
    token: Option<String>,
}

async fn api_stream(
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_generation_id(&id)?;
    let requester = if let Some(ticket) = &query.ticket {
        state.tickets.redeem(ticket, &id).ok_or(ApiError::Unauthorized)?
    } else if let Some(token) = &query.token {
        verify_token(&state, token)?
    } else {
        require_requester(&state, &headers)?
    };
    let record = authorized_generation(&state, &requester, &id)?;
    tracing::debug!(generation_id = %id, state = %record.state, "Stream attached");

    let rx = state.streams.attach(record);
    let events = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(event.to_sse()), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
