use crate::error::Result;
use crate::models::Station;
use crate::services::{EventBus, Scheduler};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub struct AppState {
    pub pool: PgPool,
    pub scheduler: Arc<Scheduler>,
    pub bus: Arc<EventBus>,
}

#[derive(Debug, Serialize)]
struct StationView {
    #[serde(flatten)]
    station: Station,
    /// Wall clock of the most recent decoded chunk, when the pipeline runs.
    last_chunk_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct HealthView {
    status: &'static str,
    active_stations: usize,
    stations: Vec<StationHealth>,
}

#[derive(Debug, Serialize)]
struct StationHealth {
    station_id: Uuid,
    last_chunk_at: Option<DateTime<Utc>>,
}

pub fn station_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stations", get(list_stations))
        .route("/stations/:id/start", post(start_station))
        .route("/stations/:id/stop", post(stop_station))
        .route("/health", get(health))
}

async fn list_stations(State(state): State<Arc<AppState>>) -> Result<Json<Vec<StationView>>> {
    let stations: Vec<Station> = sqlx::query_as("SELECT * FROM stations ORDER BY name")
        .fetch_all(&state.pool)
        .await?;
    let health = state.scheduler.supervisor().health().await;

    let views = stations
        .into_iter()
        .map(|station| {
            let last_chunk_at = health.get(&station.id).copied().flatten();
            StationView {
                station,
                last_chunk_at,
            }
        })
        .collect();
    Ok(Json(views))
}

async fn start_station(
    State(state): State<Arc<AppState>>,
    Path(station_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state.scheduler.activate_station(station_id).await?;
    Ok(Json(serde_json::json!({ "status": "monitoring" })))
}

async fn stop_station(
    State(state): State<Arc<AppState>>,
    Path(station_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state.scheduler.deactivate_station(station_id).await?;
    Ok(Json(serde_json::json!({ "status": "idle" })))
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthView>> {
    let health = state.scheduler.supervisor().health().await;
    let mut stations: Vec<StationHealth> = health
        .into_iter()
        .map(|(station_id, last_chunk_at)| StationHealth {
            station_id,
            last_chunk_at,
        })
        .collect();
    stations.sort_by_key(|s| s.station_id);

    Ok(Json(HealthView {
        status: "ok",
        active_stations: stations.len(),
        stations,
    }))
}
