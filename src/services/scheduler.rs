//! Global orchestration: station admission, the periodic status broadcast,
//! and graceful shutdown.

use crate::error::{AppError, Result};
use crate::models::Station;
use crate::services::event_bus::{Event, StatusUpdateEvent};
use crate::services::supervisor::{PipelineContext, StationSupervisor};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

pub struct Scheduler {
    ctx: Arc<PipelineContext>,
    supervisor: Arc<StationSupervisor>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(ctx: Arc<PipelineContext>, supervisor: Arc<StationSupervisor>) -> Self {
        Self {
            ctx,
            supervisor,
            cancel: CancellationToken::new(),
        }
    }

    pub fn supervisor(&self) -> &Arc<StationSupervisor> {
        &self.supervisor
    }

    /// Start monitoring a provisioned station. Admission is capped by
    /// `max_stations`; past it the request is refused, not queued.
    pub async fn activate_station(&self, station_id: Uuid) -> Result<()> {
        let station: Station = sqlx::query_as("SELECT * FROM stations WHERE id = $1")
            .bind(station_id)
            .fetch_optional(&self.ctx.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Station not found".to_string()))?;
        self.supervisor.start_station(station).await
    }

    pub async fn deactivate_station(&self, station_id: Uuid) -> Result<()> {
        self.supervisor.stop_station(station_id).await
    }

    /// Broadcast a `status_update` every second until shutdown.
    pub fn spawn_status_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if let Err(e) = scheduler.broadcast_status().await {
                    error!("Status broadcast failed: {e}");
                }
            }
        })
    }

    async fn broadcast_status(&self) -> Result<()> {
        let (total_tracks,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tracks")
            .fetch_one(&self.ctx.pool)
            .await?;
        let (total_detections,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM detections")
            .fetch_one(&self.ctx.pool)
            .await?;

        self.ctx.bus.publish(&Event::StatusUpdate(StatusUpdateEvent {
            active_stations: self.supervisor.active_count().await,
            total_tracks,
            total_detections,
            updated_at: Utc::now(),
        }));
        Ok(())
    }

    /// Stop everything in dependency order: no new segments, trackers
    /// drained (each closes and persists its current play), then the status
    /// loop. Detection writes are transactional, so nothing needs flushing
    /// beyond the drain itself.
    pub async fn shutdown(&self) {
        info!("Shutting down: draining station pipelines");
        self.supervisor.shutdown().await;
        self.cancel.cancel();
        info!("Shutdown complete");
    }
}
