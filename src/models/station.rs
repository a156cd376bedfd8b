use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Supervisor-maintained station state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    Idle,
    Monitoring,
    Error,
}

impl std::fmt::Display for StationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StationStatus::Idle => write!(f, "idle"),
            StationStatus::Monitoring => write!(f, "monitoring"),
            StationStatus::Error => write!(f, "error"),
        }
    }
}

/// A monitored radio station. Provisioned externally; the supervisor only
/// reads it and updates `status` / `last_checked`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Station {
    pub id: Uuid,
    pub name: String,
    pub stream_url: String,
    pub active: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub status: StationStatus,
}
