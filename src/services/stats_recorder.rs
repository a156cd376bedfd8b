//! Durable recording of closed plays.
//!
//! A detection and the five rollup counters move in one transaction, so the
//! sum of detection durations always equals the rollup totals. Repeated
//! writes of the same play are no-ops, near-adjacent plays of the same track
//! merge into the previous row, and intervals are clamped so a station's
//! detections never overlap.

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::services::play_tracker::ClosedPlay;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

/// Detections starting within this of an existing one (same station and
/// track) are idempotent retries.
const DUPLICATE_WINDOW_S: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(Uuid),
    /// Extended the previous detection instead of writing a new row.
    Merged(Uuid),
    /// Same play already persisted; nothing written.
    Duplicate,
    /// Degenerate after overlap clamping or under the duration floor.
    Dropped,
}

pub struct StatsRecorder {
    pool: PgPool,
    config: TrackerConfig,
}

impl StatsRecorder {
    pub fn new(pool: PgPool, config: TrackerConfig) -> Self {
        Self { pool, config }
    }

    pub async fn record(&self, play: &ClosedPlay) -> Result<RecordOutcome> {
        let mut tx = self.pool.begin().await?;

        // Crash-restart and at-least-once delivery make duplicate closes
        // possible; the first write wins.
        let duplicate: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM detections
             WHERE station_id = $1 AND track_id = $2
               AND ABS(EXTRACT(EPOCH FROM (started_at - $3))) < $4",
        )
        .bind(play.station_id)
        .bind(play.track_id)
        .bind(play.started_at)
        .bind(DUPLICATE_WINDOW_S)
        .fetch_optional(&mut *tx)
        .await?;
        if duplicate.is_some() {
            tx.rollback().await?;
            debug!(station_id = %play.station_id, track_id = %play.track_id, "Duplicate detection ignored");
            return Ok(RecordOutcome::Duplicate);
        }

        let previous: Option<(Uuid, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, track_id, ended_at FROM detections
             WHERE station_id = $1
             ORDER BY ended_at DESC
             LIMIT 1",
        )
        .bind(play.station_id)
        .fetch_optional(&mut *tx)
        .await?;

        // Gap-merge: the same track resuming just after its previous
        // detection ended is one continuous play.
        if let Some((prev_id, prev_track, prev_ended)) = previous {
            let gap_s = (play.started_at - prev_ended).num_milliseconds() as f64 / 1000.0;
            if prev_track == play.track_id && gap_s >= 0.0 && gap_s < self.config.merge_gap {
                let delta_s = (play.ended_at - prev_ended).num_milliseconds() as f64 / 1000.0;
                if delta_s <= 0.0 {
                    tx.rollback().await?;
                    return Ok(RecordOutcome::Duplicate);
                }
                sqlx::query(
                    "UPDATE detections
                     SET ended_at = $1,
                         duration_s = EXTRACT(EPOCH FROM ($1 - started_at))
                     WHERE id = $2",
                )
                .bind(play.ended_at)
                .bind(prev_id)
                .execute(&mut *tx)
                .await?;

                // The play was counted when the row was first written; only
                // the extra coverage flows into the rollups.
                self.apply_rollups(&mut tx, play, 0, delta_s).await?;
                tx.commit().await?;
                info!(
                    station_id = %play.station_id,
                    track_id = %play.track_id,
                    delta_s,
                    "Merged detection into previous play"
                );
                return Ok(RecordOutcome::Merged(prev_id));
            }

            // Clamp to keep station intervals disjoint.
            let mut started_at = play.started_at;
            if started_at < prev_ended {
                started_at = prev_ended;
            }
            let duration_s = (play.ended_at - started_at).num_milliseconds() as f64 / 1000.0;
            if duration_s < self.config.min_detection_duration {
                tx.rollback().await?;
                debug!(station_id = %play.station_id, duration_s, "Dropped clamped detection");
                return Ok(RecordOutcome::Dropped);
            }
            let id = self
                .insert_detection(&mut tx, play, started_at, duration_s)
                .await?;
            self.apply_rollups(&mut tx, play, 1, duration_s).await?;
            tx.commit().await?;
            return Ok(RecordOutcome::Inserted(id));
        }

        let duration_s = (play.ended_at - play.started_at).num_milliseconds() as f64 / 1000.0;
        if duration_s < self.config.min_detection_duration {
            tx.rollback().await?;
            return Ok(RecordOutcome::Dropped);
        }
        let id = self
            .insert_detection(&mut tx, play, play.started_at, duration_s)
            .await?;
        self.apply_rollups(&mut tx, play, 1, duration_s).await?;
        tx.commit().await?;
        Ok(RecordOutcome::Inserted(id))
    }

    async fn insert_detection(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        play: &ClosedPlay,
        started_at: DateTime<Utc>,
        duration_s: f64,
    ) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO detections
                 (station_id, track_id, started_at, ended_at, duration_s,
                  confidence, method, fingerprint_snapshot)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(play.station_id)
        .bind(play.track_id)
        .bind(started_at)
        .bind(play.ended_at)
        .bind(duration_s)
        .bind(play.confidence)
        .bind(play.method)
        .bind(&play.fp_hash)
        .fetch_one(&mut **tx)
        .await?;

        info!(
            station_id = %play.station_id,
            track_id = %play.track_id,
            duration_s,
            method = %play.method,
            "Recorded detection"
        );
        Ok(id)
    }

    /// Update all five rollups. `count_inc` is 0 for merges.
    async fn apply_rollups(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        play: &ClosedPlay,
        count_inc: i64,
        duration_s: f64,
    ) -> Result<()> {
        let (artist_id, label_id): (Uuid, Option<Uuid>) =
            sqlx::query_as("SELECT artist_id, label_id FROM tracks WHERE id = $1")
                .bind(play.track_id)
                .fetch_one(&mut **tx)
                .await?;
        let seen = play.ended_at;

        upsert_rollup(tx, "track_stats", "track_id", play.track_id, count_inc, duration_s, seen)
            .await?;
        upsert_rollup(tx, "artist_stats", "artist_id", artist_id, count_inc, duration_s, seen)
            .await?;
        if let Some(label_id) = label_id {
            upsert_rollup(tx, "label_stats", "label_id", label_id, count_inc, duration_s, seen)
                .await?;
        }
        upsert_rollup(
            tx,
            "station_stats",
            "station_id",
            play.station_id,
            count_inc,
            duration_s,
            seen,
        )
        .await?;

        sqlx::query(
            "INSERT INTO station_track_stats
                 (station_id, track_id, play_count, total_duration_s, last_seen)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (station_id, track_id) DO UPDATE SET
                 play_count = station_track_stats.play_count + EXCLUDED.play_count,
                 total_duration_s = station_track_stats.total_duration_s + EXCLUDED.total_duration_s,
                 last_seen = GREATEST(station_track_stats.last_seen, EXCLUDED.last_seen)",
        )
        .bind(play.station_id)
        .bind(play.track_id)
        .bind(count_inc)
        .bind(duration_s)
        .bind(seen)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

async fn upsert_rollup(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    key_column: &str,
    key: Uuid,
    count_inc: i64,
    duration_s: f64,
    seen: DateTime<Utc>,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} ({key_column}, play_count, total_duration_s, last_seen)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT ({key_column}) DO UPDATE SET
             play_count = {table}.play_count + EXCLUDED.play_count,
             total_duration_s = {table}.total_duration_s + EXCLUDED.total_duration_s,
             last_seen = GREATEST({table}.last_seen, EXCLUDED.last_seen)"
    );
    sqlx::query(&sql)
        .bind(key)
        .bind(count_inc)
        .bind(duration_s)
        .bind(seen)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
