//! Fingerprint lookup service client (AcoustID-compatible).
//!
//! Takes a chromaprint fingerprint plus its duration and returns candidate
//! recordings, each possibly carrying an ISRC. The request always goes out
//! as a form-encoded POST body: long fingerprints overflow URL length limits
//! when sent as query parameters.

use crate::config::RecognitionConfig;
use crate::error::{AppError, Result};
use crate::models::TrackDescriptor;
use crate::services::features::fingerprint_bytes;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

/// A recording candidate from an external service, before registry
/// resolution.
#[derive(Debug, Clone)]
pub struct ExternalCandidate {
    pub descriptor: TrackDescriptor,
    pub confidence: f64,
}

pub struct AcoustidClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    min_score: f64,
}

impl AcoustidClient {
    /// None when no API key is configured; the recognizer then skips this
    /// tier entirely.
    pub fn from_config(config: &RecognitionConfig) -> Option<Self> {
        let api_key = config.acoustid_api_key.clone()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Some(Self {
            http,
            base_url: config.acoustid_base_url.trim_end_matches('/').to_string(),
            api_key,
            min_score: config.external_min_confidence,
        })
    }

    /// Single lookup attempt. Candidates below the configured score floor
    /// are dropped; the list is otherwise unordered.
    pub async fn lookup(
        &self,
        fingerprint: &[u32],
        duration_s: f64,
    ) -> Result<Vec<ExternalCandidate>> {
        let fp = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(fingerprint_bytes(fingerprint));
        let duration = (duration_s.round() as i64).max(1).to_string();

        let response = self
            .http
            .post(format!("{}/lookup", self.base_url))
            .form(&[
                ("client", self.api_key.as_str()),
                ("duration", duration.as_str()),
                ("fingerprint", fp.as_str()),
                ("meta", "recordings"),
            ])
            .send()
            .await
            .map_err(|e| AppError::Stream(format!("fingerprint lookup request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AppError::Stream(format!(
                "fingerprint lookup returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalApi(format!(
                "fingerprint lookup returned {status}: {body}"
            )));
        }

        let parsed: LookupResponse = response.json().await.map_err(|e| {
            AppError::ExternalApi(format!("unparseable fingerprint lookup response: {e}"))
        })?;

        if parsed.status != "ok" {
            let message = parsed.error.map(|e| e.message).unwrap_or_default();
            return Err(AppError::ExternalApi(format!(
                "fingerprint lookup error: {message}"
            )));
        }

        let mut candidates = Vec::new();
        for result in parsed.results {
            if result.score < self.min_score {
                continue;
            }
            for recording in result.recordings.unwrap_or_default() {
                let Some(title) = recording.title else {
                    continue;
                };
                let artist = recording
                    .artists
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| a.name)
                    .collect::<Vec<_>>()
                    .join(", ");
                if artist.is_empty() {
                    continue;
                }
                let mut descriptor = TrackDescriptor::new(title, artist);
                descriptor.isrc = recording
                    .isrcs
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .map(|isrc| isrc.to_uppercase());
                candidates.push(ExternalCandidate {
                    descriptor,
                    confidence: result.score,
                });
            }
        }

        debug!(
            candidates = candidates.len(),
            "fingerprint lookup complete"
        );
        Ok(candidates)
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: String,
    #[serde(default)]
    results: Vec<LookupResult>,
    error: Option<LookupError>,
}

#[derive(Debug, Deserialize)]
struct LookupResult {
    score: f64,
    recordings: Option<Vec<Recording>>,
}

#[derive(Debug, Deserialize)]
struct Recording {
    title: Option<String>,
    artists: Option<Vec<RecordingArtist>>,
    isrcs: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RecordingArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LookupError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parsing_extracts_candidates() {
        let body = r#"{
            "status": "ok",
            "results": [{
                "score": 0.91,
                "id": "fp-1",
                "recordings": [{
                    "id": "rec-1",
                    "title": "Set Yaw",
                    "artists": [{"id": "a", "name": "Orchestra Baobab"}],
                    "isrcs": ["fr1234567890"]
                }]
            }]
        }"#;
        let parsed: LookupResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.status, "ok");
        let result = &parsed.results[0];
        assert_eq!(result.score, 0.91);
        let rec = &result.recordings.as_ref().unwrap()[0];
        assert_eq!(rec.title.as_deref(), Some("Set Yaw"));
        assert_eq!(rec.isrcs.as_ref().unwrap()[0], "fr1234567890");
    }

    #[test]
    fn error_response_parses() {
        let body = r#"{"status": "error", "error": {"code": 4, "message": "invalid API key"}}"#;
        let parsed: LookupResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.status, "error");
        assert_eq!(parsed.error.unwrap().message, "invalid API key");
    }
}
