//! Idempotent resolution of recognized descriptors to persistent tracks.
//!
//! Identity precedence: ISRC, then fingerprint neighborhood, then a fresh
//! track. Creation uses select-then-insert inside a transaction and falls
//! back to select on conflict, so concurrent recognizers converge on one row.

use crate::error::Result;
use crate::models::track::normalize_name;
use crate::models::{Track, TrackDescriptor};
use crate::services::features::fingerprint_bytes;
use crate::services::local_matcher::LocalMatcher;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct TrackRegistry {
    pool: PgPool,
    matcher: Arc<LocalMatcher>,
}

impl TrackRegistry {
    pub fn new(pool: PgPool, matcher: Arc<LocalMatcher>) -> Self {
        Self { pool, matcher }
    }

    pub async fn find_track_by_isrc(&self, isrc: &str) -> Result<Option<Track>> {
        let track = sqlx::query_as::<_, Track>("SELECT * FROM tracks WHERE isrc = $1")
            .bind(isrc)
            .fetch_optional(&self.pool)
            .await?;
        Ok(track)
    }

    /// Title and artist name for event payloads.
    pub async fn track_summary(
        &self,
        track_id: Uuid,
    ) -> Result<(Option<String>, Option<String>)> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT t.title, a.name FROM tracks t
             JOIN artists a ON a.id = t.artist_id
             WHERE t.id = $1",
        )
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some((title, artist)) => (Some(title), Some(artist)),
            None => (None, None),
        })
    }

    pub async fn get_track(&self, track_id: Uuid) -> Result<Option<Track>> {
        let track = sqlx::query_as::<_, Track>("SELECT * FROM tracks WHERE id = $1")
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(track)
    }

    /// Resolve a descriptor to a track, creating artist/label/track rows as
    /// needed, and attach the observed fingerprint to it.
    pub async fn resolve(
        &self,
        descriptor: &TrackDescriptor,
        fingerprint: &[u32],
        fp_hash: &str,
    ) -> Result<Track> {
        let track = if let Some(isrc) = descriptor.isrc.as_deref() {
            match self.find_track_by_isrc(isrc).await? {
                Some(existing) => existing,
                None => self.create_track(descriptor).await?,
            }
        } else if let Some(neighbor) = self.matcher.best_match(fp_hash, fingerprint).await {
            // A close fingerprint neighbor already exists; this is the same
            // recording observed again.
            match self.get_track(neighbor.track_id).await? {
                Some(existing) => existing,
                None => self.create_track(descriptor).await?,
            }
        } else {
            self.create_track(descriptor).await?
        };

        self.attach_fingerprint(track.id, fp_hash, fingerprint)
            .await?;
        Ok(track)
    }

    async fn create_track(&self, descriptor: &TrackDescriptor) -> Result<Track> {
        let mut tx = self.pool.begin().await?;

        let artist_id = get_or_create_artist(&mut tx, &descriptor.artist).await?;
        let label_id = match descriptor.label.as_deref() {
            Some(label) if !label.trim().is_empty() => {
                Some(get_or_create_label(&mut tx, label).await?)
            }
            _ => None,
        };

        let inserted = sqlx::query_as::<_, Track>(
            "INSERT INTO tracks (title, artist_id, label_id, album, isrc)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (isrc) WHERE isrc IS NOT NULL DO NOTHING
             RETURNING *",
        )
        .bind(&descriptor.title)
        .bind(artist_id)
        .bind(label_id)
        .bind(&descriptor.album)
        .bind(&descriptor.isrc)
        .fetch_optional(&mut *tx)
        .await?;

        let track = match inserted {
            Some(track) => {
                info!(
                    track_id = %track.id,
                    title = %track.title,
                    isrc = track.isrc.as_deref().unwrap_or("-"),
                    "Registered new track"
                );
                track
            }
            None => {
                // Lost the insert race; the winner's row is authoritative.
                sqlx::query_as::<_, Track>("SELECT * FROM tracks WHERE isrc = $1")
                    .bind(&descriptor.isrc)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };

        tx.commit().await?;
        Ok(track)
    }

    /// Store the fingerprint for the track unless an identical one is
    /// already attached, and extend the in-memory index either way.
    async fn attach_fingerprint(
        &self,
        track_id: Uuid,
        fp_hash: &str,
        fingerprint: &[u32],
    ) -> Result<()> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM fingerprints WHERE track_id = $1 AND fp_hash = $2",
        )
        .bind(track_id)
        .bind(fp_hash)
        .fetch_optional(&self.pool)
        .await?;

        if existing.is_none() {
            sqlx::query(
                "INSERT INTO fingerprints (track_id, fp_hash, fp_blob) VALUES ($1, $2, $3)",
            )
            .bind(track_id)
            .bind(fp_hash)
            .bind(fingerprint_bytes(fingerprint))
            .execute(&self.pool)
            .await?;
            debug!(%track_id, fp_hash, "Attached fingerprint");
        }

        self.matcher
            .insert(track_id, fp_hash.to_string(), fingerprint.to_vec())
            .await;
        Ok(())
    }
}

async fn get_or_create_artist(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
) -> Result<Uuid> {
    get_or_create_named(tx, "artists", name).await
}

async fn get_or_create_label(tx: &mut Transaction<'_, Postgres>, name: &str) -> Result<Uuid> {
    get_or_create_named(tx, "labels", name).await
}

/// Select-then-insert on the normalized name; on conflict, select again.
async fn get_or_create_named(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    name: &str,
) -> Result<Uuid> {
    let normalized = normalize_name(name);

    let select = format!("SELECT id FROM {table} WHERE name_normalized = $1");
    if let Some((id,)) = sqlx::query_as::<_, (Uuid,)>(&select)
        .bind(&normalized)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }

    let insert = format!(
        "INSERT INTO {table} (name, name_normalized) VALUES ($1, $2)
         ON CONFLICT (name_normalized) DO NOTHING
         RETURNING id"
    );
    if let Some((id,)) = sqlx::query_as::<_, (Uuid,)>(&insert)
        .bind(name.trim())
        .bind(&normalized)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }

    // Another transaction created it between our select and insert.
    let (id,) = sqlx::query_as::<_, (Uuid,)>(&select)
        .bind(&normalized)
        .fetch_one(&mut **tx)
        .await?;
    Ok(id)
}
