//! Station pipeline supervision.
//!
//! One task per active station owns the whole chain: puller → segmenter →
//! feature extraction → recognition → play tracking → recording. Failures
//! stay inside the station: the pipeline restarts with backoff and, past the
//! restart budget, the station is marked `error` and left alone. Feature
//! extraction is CPU-bound and shares a bounded set of blocking slots across
//! all stations.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Station, StationStatus};
use crate::services::event_bus::{Event, EventBus, StationErrorEvent, TrackDetectionEvent};
use crate::services::features::{FeatureExtractor, SegmentFeatures};
use crate::services::play_tracker::{MatchObservation, PlayTracker, SegmentSpan, TrackerOutput};
use crate::services::recognizer::{RecognitionOutcome, Recognizer};
use crate::services::segmenter::{Segment, Segmenter};
use crate::services::stats_recorder::StatsRecorder;
use crate::services::stream_puller::{StreamPuller, CHUNK_SAMPLES, SAMPLE_RATE};
use crate::services::track_registry::TrackRegistry;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Restart budget: give up on a station after this many pipeline failures
/// inside the window.
const MAX_RESTARTS_PER_WINDOW: usize = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(600);

/// Concurrent feature-extraction jobs across all stations.
const ANALYSIS_SLOTS: usize = 8;

/// Everything a station pipeline needs, shared across all of them.
pub struct PipelineContext {
    pub pool: PgPool,
    pub config: Config,
    pub extractor: Arc<FeatureExtractor>,
    pub recognizer: Recognizer,
    pub registry: Arc<TrackRegistry>,
    pub recorder: StatsRecorder,
    pub bus: Arc<EventBus>,
    analysis_slots: Semaphore,
}

impl PipelineContext {
    pub fn new(
        pool: PgPool,
        config: Config,
        recognizer: Recognizer,
        registry: Arc<TrackRegistry>,
        recorder: StatsRecorder,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            pool,
            config,
            extractor: Arc::new(FeatureExtractor::new()),
            recognizer,
            registry,
            recorder,
            bus,
            analysis_slots: Semaphore::new(ANALYSIS_SLOTS),
        }
    }
}

struct PipelineHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
    last_chunk: Arc<StdRwLock<Option<DateTime<Utc>>>>,
}

pub struct StationSupervisor {
    ctx: Arc<PipelineContext>,
    pipelines: RwLock<HashMap<Uuid, PipelineHandle>>,
    global_cancel: CancellationToken,
}

impl StationSupervisor {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            pipelines: RwLock::new(HashMap::new()),
            global_cancel: CancellationToken::new(),
        }
    }

    /// Start pipelines for every station marked active in the store.
    pub async fn load_active_stations(&self) -> Result<usize> {
        let stations: Vec<Station> =
            sqlx::query_as("SELECT * FROM stations WHERE active = true")
                .fetch_all(&self.ctx.pool)
                .await?;
        info!("Loading {} active stations", stations.len());

        let mut started = 0;
        for station in stations {
            match self.start_station(station).await {
                Ok(()) => started += 1,
                Err(e) => error!("Failed to start station: {e}"),
            }
        }
        Ok(started)
    }

    pub async fn start_station(&self, station: Station) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        if pipelines.contains_key(&station.id) {
            return Ok(());
        }
        if pipelines.len() >= self.ctx.config.max_stations {
            return Err(AppError::StationLimit(pipelines.len()));
        }

        sqlx::query("UPDATE stations SET active = true WHERE id = $1")
            .bind(station.id)
            .execute(&self.ctx.pool)
            .await?;

        let cancel = self.global_cancel.child_token();
        let last_chunk = Arc::new(StdRwLock::new(None));
        let join = tokio::spawn(supervise_station(
            self.ctx.clone(),
            station.clone(),
            cancel.clone(),
            last_chunk.clone(),
        ));
        pipelines.insert(
            station.id,
            PipelineHandle {
                cancel,
                join,
                last_chunk,
            },
        );
        info!(station_id = %station.id, name = %station.name, "Started station pipeline");
        Ok(())
    }

    pub async fn stop_station(&self, station_id: Uuid) -> Result<()> {
        let handle = {
            let mut pipelines = self.pipelines.write().await;
            pipelines.remove(&station_id)
        };
        let Some(handle) = handle else {
            return Err(AppError::NotFound("Station not active".to_string()));
        };

        handle.cancel.cancel();
        let _ = handle.join.await;

        sqlx::query("UPDATE stations SET active = false, status = $2 WHERE id = $1")
            .bind(station_id)
            .bind(StationStatus::Idle)
            .execute(&self.ctx.pool)
            .await?;
        info!(station_id = %station_id, "Stopped station pipeline");
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.pipelines.read().await.len()
    }

    /// Last-chunk timestamp per running station.
    pub async fn health(&self) -> HashMap<Uuid, Option<DateTime<Utc>>> {
        let pipelines = self.pipelines.read().await;
        pipelines
            .iter()
            .map(|(id, handle)| {
                (*id, *handle.last_chunk.read().expect("health lock poisoned"))
            })
            .collect()
    }

    /// Cancel every pipeline and wait for the trackers to drain.
    pub async fn shutdown(&self) {
        self.global_cancel.cancel();
        let mut pipelines = self.pipelines.write().await;
        for (station_id, handle) in pipelines.drain() {
            if let Err(e) = handle.join.await {
                warn!(%station_id, "Pipeline task ended abnormally: {e}");
            }
        }
        info!("All station pipelines drained");
    }
}

/// Restart loop around one station's pipeline.
async fn supervise_station(
    ctx: Arc<PipelineContext>,
    station: Station,
    cancel: CancellationToken,
    last_chunk: Arc<StdRwLock<Option<DateTime<Utc>>>>,
) {
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    loop {
        let result = run_pipeline(&ctx, &station, &cancel, &last_chunk).await;
        if cancel.is_cancelled() {
            return;
        }

        let err = match result {
            Ok(()) => return,
            Err(e) => e,
        };
        warn!(station_id = %station.id, "Pipeline failed: {err}");
        ctx.bus.publish(&Event::StationError(StationErrorEvent {
            station_id: station.id,
            message: err.to_string(),
        }));

        let now = Instant::now();
        restarts.push_back(now);
        while restarts
            .front()
            .is_some_and(|&t| now.duration_since(t) > RESTART_WINDOW)
        {
            restarts.pop_front();
        }
        if restarts.len() > MAX_RESTARTS_PER_WINDOW {
            error!(station_id = %station.id, "Restart budget exhausted; marking station error");
            if let Err(e) = set_status(&ctx.pool, station.id, StationStatus::Error).await {
                error!("Failed to mark station error: {e}");
            }
            return;
        }

        let delay = Duration::from_secs(5 * restarts.len() as u64);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One pipeline lifetime, from connect to cancellation or failure. A
/// cancelled pipeline always drains its tracker before returning.
async fn run_pipeline(
    ctx: &Arc<PipelineContext>,
    station: &Station,
    cancel: &CancellationToken,
    last_chunk: &Arc<StdRwLock<Option<DateTime<Utc>>>>,
) -> Result<()> {
    set_status(&ctx.pool, station.id, StationStatus::Monitoring).await?;

    let chunk_capacity = (ctx.config.puller.max_buffered_secs * SAMPLE_RATE as f64
        / CHUNK_SAMPLES as f64)
        .max(4.0) as usize;
    let (chunk_tx, mut chunk_rx) = mpsc::channel(chunk_capacity);

    let puller = StreamPuller::new(
        station.id,
        station.stream_url.clone(),
        ctx.config.puller.clone(),
    );
    let puller_cancel = cancel.clone();
    let mut puller_task = tokio::spawn(async move { puller.run(chunk_tx, puller_cancel).await });

    let mut segmenter = Segmenter::new(ctx.config.segmenter.clone());
    let mut tracker = PlayTracker::new(station.id, ctx.config.tracker.clone());
    let mut last_ts = f64::MIN;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(segment) = segmenter.flush() {
                    if let Err(e) = process_segment(ctx, station, &mut tracker, segment).await {
                        warn!(station_id = %station.id, "Error draining final segment: {e}");
                    }
                }
                break Ok(());
            }
            maybe_chunk = chunk_rx.recv() => {
                match maybe_chunk {
                    Some(chunk) => {
                        if chunk.ts < last_ts {
                            break Err(AppError::InvariantViolation(format!(
                                "chunk timestamp went backwards: {} < {last_ts}",
                                chunk.ts
                            )));
                        }
                        last_ts = chunk.ts;
                        *last_chunk.write().expect("health lock poisoned") = Some(chunk.wall);
                        for segment in segmenter.push(&chunk) {
                            process_segment(ctx, station, &mut tracker, segment).await?;
                        }
                    }
                    None => {
                        // Puller exited; its result says why.
                        let puller_result = (&mut puller_task)
                            .await
                            .map_err(|e| anyhow::anyhow!("puller task panicked: {e}"))?;
                        break puller_result;
                    }
                }
            }
            _ = tick.tick() => {
                let output = tracker.on_tick(Utc::now());
                handle_tracker_output(ctx, station, output).await?;
            }
        }
    };

    // Whatever happened, the in-flight play is closed and persisted.
    if let Some(closed) = tracker.drain() {
        let output = TrackerOutput {
            opened: None,
            closed: Some(closed),
        };
        if let Err(e) = handle_tracker_output(ctx, station, output).await {
            warn!(station_id = %station.id, "Failed to persist drained play: {e}");
        }
    }

    puller_task.abort();
    result
}

/// Feature extraction on the bounded blocking pool, then recognition, then
/// a tracker transition.
async fn process_segment(
    ctx: &Arc<PipelineContext>,
    station: &Station,
    tracker: &mut PlayTracker,
    segment: Segment,
) -> Result<()> {
    let _permit = ctx
        .analysis_slots
        .acquire()
        .await
        .map_err(|_| anyhow::anyhow!("analysis pool closed"))?;

    let extractor = ctx.extractor.clone();
    let (segment, features) = tokio::task::spawn_blocking(move || {
        let features = extractor.extract(&segment);
        (segment, features)
    })
    .await
    .map_err(|e| anyhow::anyhow!("feature extraction panicked: {e}"))?;
    let features = features?;
    drop(_permit);

    let span = SegmentSpan {
        start: segment.wall_start,
        end: segment.wall_end(),
    };

    if !features.is_music {
        let output = tracker.on_speech(span);
        return handle_tracker_output(ctx, station, output).await;
    }

    let output = match recognize_segment(ctx, &segment, &features).await {
        Ok(Some(observation)) => tracker.on_match(MatchObservation {
            span,
            ..observation
        }),
        Ok(None) => tracker.on_unknown(span),
        Err(e) => {
            // Recognition infrastructure trouble is not a station failure;
            // the segment counts as unrecognized.
            warn!(station_id = %station.id, "Recognition failed: {e}");
            tracker.on_unknown(span)
        }
    };
    handle_tracker_output(ctx, station, output).await
}

/// Run the recognition tiers and resolve the winner to a persistent track.
async fn recognize_segment(
    ctx: &Arc<PipelineContext>,
    segment: &Segment,
    features: &SegmentFeatures,
) -> Result<Option<MatchObservation>> {
    let outcome = ctx.recognizer.recognize(features, &segment.samples).await?;
    let placeholder_span = SegmentSpan {
        start: segment.wall_start,
        end: segment.wall_end(),
    };

    let observation = match outcome {
        RecognitionOutcome::NoMatch => None,
        RecognitionOutcome::LocalMatch {
            track_id,
            confidence,
        } => Some(MatchObservation {
            track_id,
            fp_hash: features.fingerprint_hash.clone(),
            confidence,
            method: crate::models::RecognitionMethod::Local,
            span: placeholder_span,
        }),
        RecognitionOutcome::ExternalMatch {
            descriptor,
            confidence,
            method,
        } => {
            let track = ctx
                .registry
                .resolve(&descriptor, &features.fingerprint, &features.fingerprint_hash)
                .await?;
            Some(MatchObservation {
                track_id: track.id,
                fp_hash: features.fingerprint_hash.clone(),
                confidence,
                method,
                span: placeholder_span,
            })
        }
    };
    Ok(observation)
}

/// Persist closes, publish open/close events.
async fn handle_tracker_output(
    ctx: &Arc<PipelineContext>,
    station: &Station,
    output: TrackerOutput,
) -> Result<()> {
    if let Some(closed) = output.closed {
        ctx.recorder.record(&closed).await?;
        let (title, artist) = ctx.registry.track_summary(closed.track_id).await?;
        ctx.bus.publish(&Event::TrackDetection(TrackDetectionEvent {
            station_id: station.id,
            track_id: closed.track_id,
            title,
            artist,
            confidence: closed.confidence,
            method: closed.method,
            started_at: closed.started_at,
            ended_at: Some(closed.ended_at),
            duration_s: closed.duration_s,
        }));
    }

    if let Some(opened) = output.opened {
        let (title, artist) = ctx.registry.track_summary(opened.track_id).await?;
        ctx.bus.publish(&Event::TrackDetection(TrackDetectionEvent {
            station_id: station.id,
            track_id: opened.track_id,
            title,
            artist,
            confidence: opened.confidence,
            method: opened.method,
            started_at: opened.started_at,
            ended_at: None,
            duration_s: 0.0,
        }));
    }
    Ok(())
}

async fn set_status(pool: &PgPool, station_id: Uuid, status: StationStatus) -> Result<()> {
    sqlx::query("UPDATE stations SET status = $2, last_checked = now() WHERE id = $1")
        .bind(station_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}
