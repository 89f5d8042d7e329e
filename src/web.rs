//! HTTP API: `/api/current`, `/api/series` (streamed), `/api/diagnostics`,
//! `/api/config` (GET/POST), `/api/log_event`. All JSON, plain numeric
//! fields, integer epoch-second timestamps — no client-side unit
//! conversion required.
//!
//! The pipeline is single-writer: acquisition and every handler here
//! serialize through one `tokio::sync::Mutex`. Reads wait at most
//! `LOCK_TIMEOUT` for it before reporting a fault rather than blocking the
//! HTTP worker indefinitely behind a stalled acquisition cycle.

use crate::config::{ReferenceData, UserPreferences};
use crate::db::Db;
use crate::error::{AgriScanError, Result};
use crate::pipeline::Pipeline;
use crate::sample::{EventType, Sample};
use crate::state::{self, SharedState};
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub pipeline: Arc<Mutex<Pipeline>>,
    pub prefs: Arc<RwLock<UserPreferences>>,
    pub prefs_path: String,
    pub reference: Arc<ReferenceData>,
    pub db_path: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/current", get(current))
        .route("/api/series", get(series))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/config", get(get_config).post(post_config))
        .route("/api/log_event", post(log_event))
        .with_state(state)
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

async fn lock_pipeline(pipeline: &Mutex<Pipeline>) -> Result<tokio::sync::MutexGuard<'_, Pipeline>> {
    tokio::time::timeout(LOCK_TIMEOUT, pipeline.lock())
        .await
        .map_err(|_| AgriScanError::Fatal("pipeline lock timed out".to_string()))
}

// ---------------------------------------------------------------------------
// /api/current
// ---------------------------------------------------------------------------

#[derive(serde::Serialize)]
struct CurrentResponse {
    timestamp: i64,
    theta: f64,
    psi_kpa: f64,
    status: crate::sample::Status,
    urgency: crate::sample::Urgency,
    confidence: f64,
    theta_fc: f64,
    theta_refill: Option<f64>,
    stage: Option<String>,
    crop: String,
}

async fn current(State(state): State<AppState>) -> Result<Json<CurrentResponse>> {
    let guard = lock_pipeline(&state.pipeline).await?;
    let sample = guard
        .ring
        .latest()
        .cloned()
        .ok_or_else(|| AgriScanError::Protocol("no samples acquired yet".to_string()))?;
    drop(guard);

    let prefs = state.prefs.read().await;
    let days_after_planting = prefs
        .planting_ts
        .map(|planted| ((sample.timestamp - planted).max(0) / 86_400) as u32)
        .unwrap_or(0);
    let stage = state
        .reference
        .stage_for(&prefs.crop, days_after_planting)
        .map(|s| s.name.clone());

    Ok(Json(CurrentResponse {
        timestamp: sample.timestamp,
        theta: sample.theta,
        psi_kpa: sample.psi_kpa,
        status: sample.status,
        urgency: sample.urgency,
        confidence: sample.confidence,
        theta_fc: sample.theta_fc,
        theta_refill: sample.theta_refill,
        stage,
        crop: prefs.crop.clone(),
    }))
}

// ---------------------------------------------------------------------------
// /api/series — streamed range query
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SeriesParams {
    start: i64,
    end: i64,
}

#[derive(serde::Serialize)]
struct SeriesPoint {
    timestamp: i64,
    theta: f64,
}

async fn series(State(state): State<AppState>, Query(params): Query<SeriesParams>) -> Response {
    if params.end < params.start {
        return AgriScanError::Protocol("`end` must be >= `start`".to_string()).into_response();
    }

    let stream = state.db.samples_in_range(params.start, params.end).map(|res| {
        res.map(|sample| {
            let point = SeriesPoint {
                timestamp: sample.timestamp,
                theta: sample.theta,
            };
            let mut line = serde_json::to_vec(&point).unwrap_or_default();
            line.push(b'\n');
            axum::body::Bytes::from(line)
        })
    });

    let body = axum::body::Body::from_stream(stream);
    ([("content-type", "application/x-ndjson")], body).into_response()
}

// ---------------------------------------------------------------------------
// /api/diagnostics
// ---------------------------------------------------------------------------

async fn diagnostics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let guard = lock_pipeline(&state.pipeline).await?;
    let autocal_state = guard.autocal.state.as_str();
    let confidence = guard.autocal.confidence(&guard.cfg);
    let n_events = guard.autocal.n_events;
    drop(guard);

    let (free_gb, memory_free_kb) = state::system_snapshot(&state.db_path);
    let st = state.shared.read().await;
    Ok(Json(st.to_response(
        now_unix(),
        autocal_state,
        confidence,
        n_events,
        free_gb,
        memory_free_kb,
    )))
}

// ---------------------------------------------------------------------------
// /api/config — persisted operator preferences
// ---------------------------------------------------------------------------

async fn get_config(State(state): State<AppState>) -> Json<UserPreferences> {
    let prefs = state.prefs.read().await;
    Json(prefs.clone())
}

async fn post_config(
    State(state): State<AppState>,
    Json(update): Json<UserPreferences>,
) -> Result<Json<serde_json::Value>> {
    {
        let mut prefs = state.prefs.write().await;
        *prefs = update.clone();
    }
    update
        .save(&state.prefs_path)
        .map_err(|e| AgriScanError::Configuration(format!("save preferences: {e:#}")))?;
    info!(device = %update.device_name, "preferences updated");
    Ok(Json(serde_json::json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// /api/log_event — operator-logged irrigation/rainfall event
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LogEventRequest {
    #[serde(default)]
    note: String,
}

async fn log_event(
    State(state): State<AppState>,
    Json(req): Json<LogEventRequest>,
) -> Result<impl IntoResponse> {
    let now = now_unix();
    let metadata = serde_json::json!({ "source": "operator", "note": req.note }).to_string();
    state
        .db
        .insert_event(now, now, EventType::Wetting, 0.0, &metadata)
        .await?;
    info!(note = %req.note, "operator logged a wetting event");
    Ok(Json(serde_json::json!({ "ok": true, "ts": now })))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) {
    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, "failed to bind web server: {e}");
            return;
        }
    };
    info!(addr = %addr, "web server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!("web server exited: {e}");
    }
}
