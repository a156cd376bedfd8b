use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which subsystem produced a match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMethod {
    Local,
    /// Service-A candidate whose ISRC was already registered locally.
    Isrc,
    ExternalA,
    ExternalB,
}

impl std::fmt::Display for RecognitionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecognitionMethod::Local => write!(f, "local"),
            RecognitionMethod::Isrc => write!(f, "isrc"),
            RecognitionMethod::ExternalA => write!(f, "external_a"),
            RecognitionMethod::ExternalB => write!(f, "external_b"),
        }
    }
}

/// One completed play interval, immutable once written.
///
/// Invariants: `ended_at >= started_at`, `duration_s > 0`, duration at least
/// the configured minimum, and intervals never overlap within a station.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Detection {
    pub id: Uuid,
    pub station_id: Uuid,
    pub track_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_s: f64,
    pub confidence: f64,
    pub method: RecognitionMethod,
    /// Hash of the fingerprint that produced the match.
    pub fingerprint_snapshot: String,
}
