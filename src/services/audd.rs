//! Audio identification service client (AudD-compatible).
//!
//! Uploads a short compressed clip of the segment and gets back at most one
//! candidate with full metadata. Used as the last recognition tier.

use crate::config::RecognitionConfig;
use crate::error::{AppError, Result};
use crate::models::TrackDescriptor;
use crate::services::acoustid::ExternalCandidate;
use crate::services::stream_puller::SAMPLE_RATE;
use chrono::NaiveDate;
use mp3lame_encoder::{Builder, FlushNoGap, MonoPcm};
use serde::Deserialize;
use std::mem::MaybeUninit;
use tracing::debug;

/// Clip encoding bitrate; also determines how many seconds fit the upload
/// size limit.
const CLIP_BITRATE_KBPS: usize = 128;

/// Confidence assumed when the service reports a match without a score.
const DEFAULT_MATCH_SCORE: f64 = 0.75;

pub struct AuddClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    min_score: f64,
    max_clip_bytes: usize,
}

impl AuddClient {
    pub fn from_config(config: &RecognitionConfig) -> Option<Self> {
        let api_key = config.audd_api_key.clone()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Some(Self {
            http,
            base_url: config.audd_base_url.trim_end_matches('/').to_string(),
            api_key,
            min_score: config.external_min_confidence,
            max_clip_bytes: config.audd_max_clip_bytes,
        })
    }

    pub fn max_clip_bytes(&self) -> usize {
        self.max_clip_bytes
    }

    /// Single identification attempt against a pre-encoded MP3 clip.
    pub async fn identify(&self, clip: Vec<u8>) -> Result<Option<ExternalCandidate>> {
        let part = reqwest::multipart::Part::bytes(clip)
            .file_name("sample.mp3")
            .mime_str("audio/mpeg")
            .map_err(|e| AppError::ExternalApi(format!("invalid clip part: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("api_token", self.api_key.clone())
            .text("return", "isrc")
            .part("file", part);

        let response = self
            .http
            .post(&self.base_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::Stream(format!("identification request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AppError::Stream(format!("identification returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalApi(format!(
                "identification returned {status}: {body}"
            )));
        }

        let parsed: IdentifyResponse = response.json().await.map_err(|e| {
            AppError::ExternalApi(format!("unparseable identification response: {e}"))
        })?;

        if parsed.status != "success" {
            let message = parsed.error.map(|e| e.error_message).unwrap_or_default();
            return Err(AppError::ExternalApi(format!(
                "identification error: {message}"
            )));
        }

        let Some(result) = parsed.result else {
            debug!("identification found no candidate");
            return Ok(None);
        };

        let confidence = result.score.unwrap_or(DEFAULT_MATCH_SCORE);
        if confidence < self.min_score {
            return Ok(None);
        }

        let mut descriptor = TrackDescriptor::new(result.title, result.artist);
        descriptor.album = result.album;
        descriptor.label = result.label;
        descriptor.isrc = result.isrc.map(|isrc| isrc.to_uppercase());
        descriptor.release_date = result
            .release_date
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

        Ok(Some(ExternalCandidate {
            descriptor,
            confidence,
        }))
    }
}

/// Encode a mono PCM clip to MP3, trimming the input so the result stays
/// under `max_bytes`.
pub fn encode_clip(samples: &[i16], max_bytes: usize) -> Result<Vec<u8>> {
    let max_secs = (max_bytes * 8) / (CLIP_BITRATE_KBPS * 1000);
    let max_samples = max_secs.max(1) * SAMPLE_RATE as usize;
    let pcm = &samples[..samples.len().min(max_samples)];

    let mut builder =
        Builder::new().ok_or_else(|| AppError::Decode("failed to create MP3 encoder".into()))?;
    builder
        .set_num_channels(1)
        .map_err(|e| AppError::Decode(format!("encoder channels: {e:?}")))?;
    builder
        .set_sample_rate(SAMPLE_RATE)
        .map_err(|e| AppError::Decode(format!("encoder sample rate: {e:?}")))?;
    builder
        .set_brate(mp3lame_encoder::Birtate::Kbps128)
        .map_err(|e| AppError::Decode(format!("encoder bitrate: {e:?}")))?;
    builder
        .set_quality(mp3lame_encoder::Quality::Best)
        .map_err(|e| AppError::Decode(format!("encoder quality: {e:?}")))?;
    let mut encoder = builder
        .build()
        .map_err(|e| AppError::Decode(format!("encoder build: {e:?}")))?;

    let buffer_size = pcm.len() * 5 / 4 + 7200;
    let mut mp3_buffer: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); buffer_size];

    let written = encoder
        .encode(MonoPcm(pcm), &mut mp3_buffer)
        .map_err(|e| AppError::Decode(format!("MP3 encode: {e:?}")))?;
    let flushed = encoder
        .flush::<FlushNoGap>(&mut mp3_buffer[written..])
        .map_err(|e| AppError::Decode(format!("MP3 flush: {e:?}")))?;

    let total = (written + flushed).min(buffer_size);
    let mut clip = Vec::with_capacity(total);
    unsafe {
        clip.extend_from_slice(std::slice::from_raw_parts(
            mp3_buffer.as_ptr() as *const u8,
            total,
        ));
    }
    clip.truncate(max_bytes);
    Ok(clip)
}

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    status: String,
    result: Option<IdentifyResult>,
    error: Option<IdentifyError>,
}

#[derive(Debug, Deserialize)]
struct IdentifyResult {
    title: String,
    artist: String,
    album: Option<String>,
    label: Option<String>,
    release_date: Option<String>,
    isrc: Option<String>,
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IdentifyError {
    error_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_response_parses_full_metadata() {
        let body = r#"{
            "status": "success",
            "result": {
                "artist": "Youssou N'Dour",
                "title": "Birima",
                "album": "Joko",
                "label": "Nonesuch",
                "release_date": "2000-04-04",
                "isrc": "USNO10000123"
            }
        }"#;
        let parsed: IdentifyResponse = serde_json::from_str(body).unwrap();
        let result = parsed.result.unwrap();
        assert_eq!(result.title, "Birima");
        assert_eq!(result.isrc.as_deref(), Some("USNO10000123"));
        assert_eq!(result.release_date.as_deref(), Some("2000-04-04"));
        assert!(result.score.is_none());
    }

    #[test]
    fn empty_result_means_no_match() {
        let body = r#"{"status": "success", "result": null}"#;
        let parsed: IdentifyResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.result.is_none());
    }

    #[test]
    fn clip_is_bounded_by_size_budget() {
        let samples = vec![0i16; SAMPLE_RATE as usize * 30];
        let clip = encode_clip(&samples, 64 * 1024).unwrap();
        assert!(!clip.is_empty());
        assert!(clip.len() <= 64 * 1024);
    }
}
