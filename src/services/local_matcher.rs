//! Local fingerprint index.
//!
//! Exact lookups go through the fingerprint-hash map; otherwise a fuzzy pass
//! scores the query against stored fingerprints by best-alignment bit error.
//! The index is warmed from the store at startup and extended by the track
//! registry as new fingerprints are attached; lookups take read access only.

use crate::error::Result;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Alignments must cover at least this many fingerprint items (~2 s of
/// audio) before a score is trusted.
const MIN_OVERLAP: usize = 16;

/// Candidate returned by the index.
#[derive(Debug, Clone)]
pub struct LocalMatch {
    pub track_id: Uuid,
    pub confidence: f64,
}

struct IndexEntry {
    track_id: Uuid,
    items: Arc<Vec<u32>>,
}

#[derive(Default)]
struct Index {
    /// fp_hash → position in `entries`.
    by_hash: HashMap<String, usize>,
    entries: Vec<IndexEntry>,
}

pub struct LocalMatcher {
    min_confidence: f64,
    index: RwLock<Index>,
}

impl LocalMatcher {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence,
            index: RwLock::new(Index::default()),
        }
    }

    /// Load all persisted fingerprints. Returns how many entries are indexed.
    pub async fn warm(&self, pool: &PgPool) -> Result<usize> {
        let rows: Vec<(Uuid, String, Vec<u8>)> =
            sqlx::query_as("SELECT track_id, fp_hash, fp_blob FROM fingerprints")
                .fetch_all(pool)
                .await?;

        let mut index = self.index.write().await;
        for (track_id, fp_hash, blob) in rows {
            let items = crate::services::features::fingerprint_from_bytes(&blob);
            insert_entry(&mut index, track_id, fp_hash, items);
        }
        Ok(index.entries.len())
    }

    pub async fn insert(&self, track_id: Uuid, fp_hash: String, items: Vec<u32>) {
        let mut index = self.index.write().await;
        insert_entry(&mut index, track_id, fp_hash, items);
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.entries.len()
    }

    /// Best candidate for the query fingerprint, or None below the
    /// configured confidence floor.
    pub async fn best_match(&self, fp_hash: &str, items: &[u32]) -> Option<LocalMatch> {
        let index = self.index.read().await;

        if let Some(&pos) = index.by_hash.get(fp_hash) {
            return Some(LocalMatch {
                track_id: index.entries[pos].track_id,
                confidence: 1.0,
            });
        }

        let mut best: Option<(Uuid, f64)> = None;
        for entry in &index.entries {
            let Some(score) = alignment_score(items, &entry.items) else {
                continue;
            };
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((entry.track_id, score));
            }
        }

        let (track_id, confidence) = best?;
        if confidence < self.min_confidence {
            return None;
        }
        Some(LocalMatch {
            track_id,
            confidence,
        })
    }
}

fn insert_entry(index: &mut Index, track_id: Uuid, fp_hash: String, items: Vec<u32>) {
    if items.is_empty() || index.by_hash.contains_key(&fp_hash) {
        return;
    }
    index.by_hash.insert(fp_hash, index.entries.len());
    index.entries.push(IndexEntry {
        track_id,
        items: Arc::new(items),
    });
}

/// Best-alignment similarity between two fingerprints: 1 − bit error rate
/// over the overlapping region, maximized over relative offsets. Unrelated
/// chromaprint streams score ~0.5.
fn alignment_score(a: &[u32], b: &[u32]) -> Option<f64> {
    if a.len() < MIN_OVERLAP || b.len() < MIN_OVERLAP {
        return None;
    }

    let mut best = 0.0f64;
    let min_offset = -(b.len() as i64 - MIN_OVERLAP as i64);
    let max_offset = a.len() as i64 - MIN_OVERLAP as i64;
    for offset in min_offset..=max_offset {
        let (a_start, b_start) = if offset >= 0 {
            (offset as usize, 0)
        } else {
            (0, (-offset) as usize)
        };
        let overlap = (a.len() - a_start).min(b.len() - b_start);
        if overlap < MIN_OVERLAP {
            continue;
        }

        let mut error_bits = 0u64;
        for i in 0..overlap {
            error_bits += (a[a_start + i] ^ b[b_start + i]).count_ones() as u64;
        }
        let rate = error_bits as f64 / (overlap as f64 * 32.0);
        let score = 1.0 - rate;
        if score > best {
            best = score;
        }
    }
    Some(best)
}
