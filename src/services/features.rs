//! Per-segment analysis: play duration, music/speech discrimination, and the
//! acoustic fingerprint used for matching.

use crate::error::{AppError, Result};
use crate::services::segmenter::Segment;
use crate::services::stream_puller::SAMPLE_RATE;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use rusty_chromaprint::{Configuration, Fingerprinter};
use std::sync::Arc;

/// Analysis frame for the discriminator; ~46 ms at 44.1 kHz.
const FRAME: usize = 2048;

/// Segments scoring at or above this are treated as music.
const DEFAULT_MUSIC_THRESHOLD: f32 = 0.5;

/// Everything downstream stages need to know about a segment.
#[derive(Debug, Clone)]
pub struct SegmentFeatures {
    /// Authoritative play-duration source: samples / sample rate.
    pub duration_s: f64,
    pub is_music: bool,
    pub music_score: f32,
    /// Chromaprint items; empty when the segment was too short or too quiet
    /// to fingerprint.
    pub fingerprint: Vec<u32>,
    /// Short digest of the fingerprint bytes, the index key.
    pub fingerprint_hash: String,
}

pub struct FeatureExtractor {
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    chromaprint_config: Configuration,
    music_threshold: f32,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FRAME);
        let hann: Vec<f32> = (0..FRAME)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / FRAME as f32).cos()))
            .collect();
        Self {
            fft,
            hann,
            chromaprint_config: Configuration::preset_test1(),
            music_threshold: DEFAULT_MUSIC_THRESHOLD,
        }
    }

    pub fn with_music_threshold(mut self, threshold: f32) -> Self {
        self.music_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// CPU-bound; callers run it on the blocking pool.
    pub fn extract(&self, segment: &Segment) -> Result<SegmentFeatures> {
        let duration_s = segment.samples.len() as f64 / SAMPLE_RATE as f64;
        let music_score = self.music_score(&segment.samples);
        let is_music = music_score >= self.music_threshold;

        // Speech and silence segments are never matched; skip the
        // fingerprint work for them.
        let (fingerprint, fingerprint_hash) = if is_music {
            let fp = self.fingerprint(&segment.samples)?;
            let hash = fingerprint_hash(&fp);
            (fp, hash)
        } else {
            (Vec::new(), String::new())
        };

        Ok(SegmentFeatures {
            duration_s,
            is_music,
            music_score,
            fingerprint,
            fingerprint_hash,
        })
    }

    fn fingerprint(&self, samples: &[i16]) -> Result<Vec<u32>> {
        let mut printer = Fingerprinter::new(&self.chromaprint_config);
        printer
            .start(SAMPLE_RATE, 1)
            .map_err(|e| AppError::Decode(format!("fingerprinter start failed: {e:?}")))?;
        printer.consume(samples);
        printer.finish();
        Ok(printer.fingerprint().to_vec())
    }

    /// Blend of tonality, zero-crossing stability, and energy steadiness.
    /// Music is tonal and steady; speech alternates voiced/unvoiced frames
    /// and pulses at syllable rate.
    fn music_score(&self, samples: &[i16]) -> f32 {
        let frames: Vec<&[i16]> = samples.chunks_exact(FRAME).collect();
        if frames.is_empty() {
            return 0.0;
        }

        let mut flatness = Vec::with_capacity(frames.len());
        let mut zcr = Vec::with_capacity(frames.len());
        let mut energy = Vec::with_capacity(frames.len());
        for frame in &frames {
            let (f, z, e) = self.frame_features(frame);
            flatness.push(f);
            zcr.push(z);
            energy.push(e);
        }

        let mean_energy = mean(&energy);
        if mean_energy < 1e-5 {
            return 0.0;
        }

        let tonality = 1.0 - mean(&flatness).min(1.0);
        let zcr_stability = 1.0 / (1.0 + 40.0 * std_dev(&zcr));
        // Syllabic pulsing shows up as a large energy deviation relative to
        // the mean; steady program material stays near 1.0.
        let energy_stability = 1.0 / (1.0 + 4.0 * std_dev(&energy) / mean_energy);

        0.4 * tonality + 0.2 * zcr_stability + 0.4 * energy_stability
    }

    /// (spectral flatness, zero-crossing rate, energy) for one frame.
    fn frame_features(&self, frame: &[i16]) -> (f32, f32, f32) {
        let mut crossings = 0u32;
        let mut energy = 0.0f64;
        let mut fft_in: Vec<Complex<f32>> = Vec::with_capacity(FRAME);
        for (i, &s) in frame.iter().enumerate() {
            let v = s as f32 / 32768.0;
            energy += (v * v) as f64;
            if i > 0 && (frame[i - 1] < 0) != (s < 0) {
                crossings += 1;
            }
            fft_in.push(Complex::new(v * self.hann[i], 0.0));
        }
        self.fft.process(&mut fft_in);

        // Spectral flatness: geometric / arithmetic mean of the power
        // spectrum. 1.0 is white noise, ~0 is a pure tone.
        let mut log_sum = 0.0f64;
        let mut lin_sum = 0.0f64;
        let bins = FRAME / 2;
        for c in &fft_in[..bins] {
            let power = (c.norm_sqr() as f64).max(1e-12);
            log_sum += power.ln();
            lin_sum += power;
        }
        let geo = (log_sum / bins as f64).exp();
        let arith = lin_sum / bins as f64;
        let flatness = (geo / arith.max(1e-12)) as f32;

        let zcr = crossings as f32 / frame.len() as f32;
        let rms = (energy / frame.len() as f64).sqrt() as f32;
        (flatness, zcr, rms)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex md5 of the fingerprint's little-endian bytes.
pub fn fingerprint_hash(fingerprint: &[u32]) -> String {
    format!("{:x}", md5::compute(fingerprint_bytes(fingerprint)))
}

/// Fingerprint items as bytes, for persistence and upload.
pub fn fingerprint_bytes(fingerprint: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(fingerprint.len() * 4);
    for item in fingerprint {
        bytes.extend_from_slice(&item.to_le_bytes());
    }
    bytes
}

/// Bytes back to fingerprint items; the inverse of [`fingerprint_bytes`].
pub fn fingerprint_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn std_dev(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f32>() / values.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::segmenter::CloseReason;
    use chrono::{TimeZone, Utc};

    fn segment(samples: Vec<i16>) -> Segment {
        let duration = samples.len() as f64 / SAMPLE_RATE as f64;
        Segment {
            start_ts: 0.0,
            end_ts: duration,
            wall_start: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            samples,
            close_reason: CloseReason::Silence,
        }
    }

    fn tone(freq: f32, secs: f64) -> Vec<i16> {
        let n = (secs * SAMPLE_RATE as f64) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (0.5 * (2.0 * std::f32::consts::PI * freq * t).sin() * 32767.0) as i16
            })
            .collect()
    }

    /// Noise bursts with pauses, shaped like syllabic speech.
    fn speech_like(secs: f64) -> Vec<i16> {
        let n = (secs * SAMPLE_RATE as f64) as usize;
        let mut state = 0x12345678u32;
        (0..n)
            .map(|i| {
                // Cheap xorshift noise.
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                let noise = (state as f32 / u32::MAX as f32) * 2.0 - 1.0;
                // ~4 Hz on/off envelope.
                let t = i as f32 / SAMPLE_RATE as f32;
                let envelope = if (t * 4.0).fract() < 0.5 { 0.6 } else { 0.02 };
                (noise * envelope * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn tonal_signal_is_music() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&segment(tone(440.0, 6.0))).unwrap();
        assert!(features.is_music, "score was {}", features.music_score);
        assert!((features.duration_s - 6.0).abs() < 0.01);
        assert!(!features.fingerprint.is_empty());
        assert!(!features.fingerprint_hash.is_empty());
    }

    #[test]
    fn bursty_noise_is_not_music() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&segment(speech_like(6.0))).unwrap();
        assert!(!features.is_music, "score was {}", features.music_score);
        assert!(features.fingerprint.is_empty());
    }

    #[test]
    fn silence_is_not_music() {
        let extractor = FeatureExtractor::new();
        let features = extractor
            .extract(&segment(vec![0i16; SAMPLE_RATE as usize * 4]))
            .unwrap();
        assert!(!features.is_music);
    }

    #[test]
    fn hash_is_deterministic_and_order_sensitive() {
        let a = fingerprint_hash(&[1, 2, 3, 4]);
        let b = fingerprint_hash(&[1, 2, 3, 4]);
        let c = fingerprint_hash(&[4, 3, 2, 1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn fingerprint_bytes_round_trip() {
        let fp = vec![0u32, 1, 0xdead_beef, u32::MAX];
        assert_eq!(fingerprint_from_bytes(&fingerprint_bytes(&fp)), fp);
    }
}
