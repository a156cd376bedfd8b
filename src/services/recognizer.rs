//! Hierarchical recognition: local index, then the fingerprint lookup
//! service, then audio identification. External tiers share token-bucket
//! rate limits across all stations and retry transient failures with
//! backoff. Total external unavailability degrades to `NoMatch`; ingestion
//! never stops because a service is down.

use crate::config::RecognitionConfig;
use crate::error::Result;
use crate::models::{RecognitionMethod, TrackDescriptor};
use crate::services::acoustid::{AcoustidClient, ExternalCandidate};
use crate::services::audd::{encode_clip, AuddClient};
use crate::services::features::SegmentFeatures;
use crate::services::local_matcher::LocalMatcher;
use crate::services::track_registry::TrackRegistry;
use governor::{Quota, RateLimiter};
use rand::Rng;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Result of recognizing one segment. Expected outcomes are values, not
/// errors; only infrastructure failures (e.g. the database) surface as `Err`.
#[derive(Debug, Clone)]
pub enum RecognitionOutcome {
    NoMatch,
    LocalMatch {
        track_id: Uuid,
        confidence: f64,
    },
    ExternalMatch {
        descriptor: TrackDescriptor,
        confidence: f64,
        method: RecognitionMethod,
    },
}

pub struct Recognizer {
    local: Arc<LocalMatcher>,
    registry: Arc<TrackRegistry>,
    acoustid: Option<(AcoustidClient, DirectLimiter)>,
    audd: Option<(AuddClient, DirectLimiter)>,
    max_retries: u32,
}

impl Recognizer {
    pub fn new(
        config: &RecognitionConfig,
        local: Arc<LocalMatcher>,
        registry: Arc<TrackRegistry>,
    ) -> Self {
        let acoustid = AcoustidClient::from_config(config)
            .map(|client| (client, direct_limiter(config.acoustid_rate_per_sec)));
        let audd = AuddClient::from_config(config)
            .map(|client| (client, direct_limiter(config.audd_rate_per_sec)));
        if acoustid.is_none() {
            warn!("Fingerprint lookup service disabled - no API key configured");
        }
        if audd.is_none() {
            warn!("Audio identification service disabled - no API key configured");
        }
        Self {
            local,
            registry,
            acoustid,
            audd,
            max_retries: config.max_retries,
        }
    }

    /// Recognize one music segment.
    pub async fn recognize(
        &self,
        features: &SegmentFeatures,
        samples: &[i16],
    ) -> Result<RecognitionOutcome> {
        if features.fingerprint.is_empty() {
            return Ok(RecognitionOutcome::NoMatch);
        }

        if let Some(hit) = self
            .local
            .best_match(&features.fingerprint_hash, &features.fingerprint)
            .await
        {
            debug!(track_id = %hit.track_id, confidence = hit.confidence, "Local index hit");
            return Ok(RecognitionOutcome::LocalMatch {
                track_id: hit.track_id,
                confidence: hit.confidence,
            });
        }

        let mut candidates: Vec<(ExternalCandidate, RecognitionMethod)> = Vec::new();

        if let Some((client, limiter)) = &self.acoustid {
            let lookup = with_retry(limiter, self.max_retries, || {
                client.lookup(&features.fingerprint, features.duration_s)
            })
            .await;
            match lookup {
                Ok(found) => {
                    // A candidate whose ISRC is already registered settles the
                    // identity outright; the audio-identification tier is not
                    // consulted.
                    for candidate in &found {
                        let Some(isrc) = candidate.descriptor.isrc.as_deref() else {
                            continue;
                        };
                        if self.registry.find_track_by_isrc(isrc).await?.is_some() {
                            return Ok(RecognitionOutcome::ExternalMatch {
                                descriptor: candidate.descriptor.clone(),
                                confidence: candidate.confidence,
                                method: RecognitionMethod::Isrc,
                            });
                        }
                    }
                    candidates
                        .extend(found.into_iter().map(|c| (c, RecognitionMethod::ExternalA)));
                }
                Err(e) => warn!("Fingerprint lookup unavailable: {e}"),
            }
        }

        if let Some((client, limiter)) = &self.audd {
            match self.identify_clip(client, limiter, samples).await {
                Ok(Some(candidate)) => candidates.push((candidate, RecognitionMethod::ExternalB)),
                Ok(None) => {}
                Err(e) => warn!("Audio identification unavailable: {e}"),
            }
        }

        Ok(match pick_best(candidates) {
            Some((candidate, method)) => RecognitionOutcome::ExternalMatch {
                descriptor: candidate.descriptor,
                confidence: candidate.confidence,
                method,
            },
            None => RecognitionOutcome::NoMatch,
        })
    }

    async fn identify_clip(
        &self,
        client: &AuddClient,
        limiter: &DirectLimiter,
        samples: &[i16],
    ) -> Result<Option<ExternalCandidate>> {
        let owned = samples.to_vec();
        let max_bytes = client.max_clip_bytes();
        let clip = tokio::task::spawn_blocking(move || encode_clip(&owned, max_bytes))
            .await
            .map_err(|e| anyhow::anyhow!("clip encoding task panicked: {e}"))??;

        with_retry(limiter, self.max_retries, || client.identify(clip.clone())).await
    }
}

fn direct_limiter(per_second: u32) -> DirectLimiter {
    let rate = NonZeroU32::new(per_second.max(1)).unwrap();
    RateLimiter::direct(Quota::per_second(rate))
}

/// Take a token, call, and retry transient failures with jittered
/// exponential backoff. Permanent failures (4xx) return immediately.
async fn with_retry<T, F, Fut>(limiter: &DirectLimiter, max_retries: u32, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        limiter.until_ready().await;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0..250);
                let delay = Duration::from_millis(500 * 2u64.pow(attempt) + jitter);
                debug!("Retrying external call in {delay:?} ({attempt}/{max_retries}): {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Candidate order: an ISRC outranks any score, then higher confidence wins.
fn pick_best(
    candidates: Vec<(ExternalCandidate, RecognitionMethod)>,
) -> Option<(ExternalCandidate, RecognitionMethod)> {
    candidates.into_iter().max_by(|(a, _), (b, _)| {
        let a_key = (a.descriptor.isrc.is_some(), a.confidence);
        let b_key = (b.descriptor.isrc.is_some(), b.confidence);
        a_key
            .partial_cmp(&b_key)
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}
