use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artist {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Label {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted track. `isrc`, when present, is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Track {
    pub id: Uuid,
    pub title: String,
    pub artist_id: Uuid,
    pub label_id: Option<Uuid>,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored acoustic fingerprint. A track accumulates several over time.
#[derive(Debug, Clone, FromRow)]
pub struct Fingerprint {
    pub id: Uuid,
    pub track_id: Uuid,
    pub fp_hash: String,
    pub fp_blob: Vec<u8>,
}

/// Metadata for a recognized recording, as returned by an external service
/// before it is resolved to a persistent [`Track`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub label: Option<String>,
    pub isrc: Option<String>,
    pub release_date: Option<NaiveDate>,
}

impl TrackDescriptor {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: None,
            label: None,
            isrc: None,
            release_date: None,
        }
    }
}

/// Artist/label names are deduplicated by this normalization: trimmed,
/// lowercased, inner whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  Youssou   N'Dour "), "youssou n'dour");
        assert_eq!(normalize_name("ORCHESTRA Baobab"), "orchestra baobab");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_name("Baaba  Maal");
        assert_eq!(normalize_name(&once), once);
    }
}
