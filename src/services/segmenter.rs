//! Variable-length audio segmentation.
//!
//! Buffers canonical PCM from the puller and cuts analysis segments at
//! natural content boundaries: sustained silence, an abrupt move of the
//! spectral centroid away from the segment's rolling mean, or the maximum
//! segment length as a safety cap.

use crate::config::SegmenterConfig;
use crate::services::stream_puller::{PcmChunk, SAMPLE_RATE};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Analysis window; ~46 ms at 44.1 kHz.
const WINDOW: usize = 2048;

/// Windows observed before the spectral-change detector arms itself.
const CHANGE_WARMUP_WINDOWS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Silence,
    SpectralChange,
    MaxLength,
    /// End of stream; whatever was buffered is emitted.
    Flush,
}

/// One analysis segment. Segments from one station are strictly ordered and
/// non-overlapping.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Monotonic stream time of the first sample, seconds.
    pub start_ts: f64,
    /// Monotonic stream time one past the last sample, seconds.
    pub end_ts: f64,
    /// Wall clock at the first sample, recorded once and carried along.
    pub wall_start: DateTime<Utc>,
    pub samples: Vec<i16>,
    pub close_reason: CloseReason,
}

impl Segment {
    pub fn duration_s(&self) -> f64 {
        self.end_ts - self.start_ts
    }

    pub fn wall_end(&self) -> DateTime<Utc> {
        self.wall_start + ChronoDuration::milliseconds((self.duration_s() * 1000.0) as i64)
    }
}

pub struct Segmenter {
    config: SegmenterConfig,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,

    buf: Vec<i16>,
    /// Samples of `buf` already run through the window analysis.
    analyzed: usize,
    seg_start_ts: f64,
    /// Wall clock minus monotonic time, refreshed from each chunk so that a
    /// reconnect re-anchors subsequent segments.
    wall_anchor: Option<DateTime<Utc>>,

    trailing_silence_s: f64,
    centroid_sum: f64,
    centroid_windows: u32,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(WINDOW);
        let hann: Vec<f32> = (0..WINDOW)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / WINDOW as f32).cos()))
            .collect();
        Self {
            config,
            fft,
            hann,
            buf: Vec::new(),
            analyzed: 0,
            seg_start_ts: 0.0,
            wall_anchor: None,
            trailing_silence_s: 0.0,
            centroid_sum: 0.0,
            centroid_windows: 0,
        }
    }

    /// Feed one PCM chunk; returns any segments it completed, in order.
    pub fn push(&mut self, chunk: &PcmChunk) -> Vec<Segment> {
        if self.buf.is_empty() {
            self.seg_start_ts = chunk.ts;
        }
        self.wall_anchor =
            Some(chunk.wall - ChronoDuration::milliseconds((chunk.ts * 1000.0) as i64));
        self.buf.extend_from_slice(&chunk.samples);

        let mut out = Vec::new();
        while self.analyzed + WINDOW <= self.buf.len() {
            let window = &self.buf[self.analyzed..self.analyzed + WINDOW];
            let (rms, centroid) = self.analyze_window(window);
            self.analyzed += WINDOW;

            let window_s = WINDOW as f64 / SAMPLE_RATE as f64;
            if rms < self.config.silence_threshold {
                self.trailing_silence_s += window_s;
            } else {
                self.trailing_silence_s = 0.0;
                self.centroid_sum += centroid as f64;
                self.centroid_windows += 1;
            }

            if let Some(reason) = self.close_reason(rms, centroid) {
                if let Some(segment) = self.cut(reason) {
                    out.push(segment);
                }
            }
        }
        out
    }

    /// End-of-stream drain.
    pub fn flush(&mut self) -> Option<Segment> {
        self.analyzed = self.buf.len();
        self.cut(CloseReason::Flush)
    }

    fn analyzed_duration_s(&self) -> f64 {
        self.analyzed as f64 / SAMPLE_RATE as f64
    }

    fn close_reason(&self, rms: f32, centroid: f32) -> Option<CloseReason> {
        let len_s = self.analyzed_duration_s();
        if len_s >= self.config.max_segment {
            return Some(CloseReason::MaxLength);
        }
        if len_s < self.config.min_segment {
            return None;
        }
        if rms < self.config.silence_threshold && self.trailing_silence_s >= self.config.silence_hold
        {
            return Some(CloseReason::Silence);
        }
        if self.centroid_windows >= CHANGE_WARMUP_WINDOWS && rms >= self.config.silence_threshold {
            let mean = self.centroid_sum / self.centroid_windows as f64;
            if mean > 0.0 && ((centroid as f64 - mean).abs() / mean) > self.config.change_threshold as f64 {
                return Some(CloseReason::SpectralChange);
            }
        }
        None
    }

    /// Emit the analyzed prefix of the buffer as a segment and restart
    /// accumulation at the cut point.
    fn cut(&mut self, reason: CloseReason) -> Option<Segment> {
        let cut_len = self.analyzed;
        let duration_s = cut_len as f64 / SAMPLE_RATE as f64;
        if duration_s < self.config.min_segment && reason != CloseReason::Flush {
            return None;
        }

        let samples: Vec<i16> = self.buf.drain(..cut_len).collect();
        self.analyzed = 0;
        let start_ts = self.seg_start_ts;
        self.seg_start_ts += duration_s;
        self.trailing_silence_s = 0.0;
        self.centroid_sum = 0.0;
        self.centroid_windows = 0;

        if samples.is_empty() || duration_s < 0.5 {
            // A flush of a near-empty buffer is not worth analyzing.
            return None;
        }

        let wall_start = self.wall_anchor? + ChronoDuration::milliseconds((start_ts * 1000.0) as i64);
        Some(Segment {
            start_ts,
            end_ts: start_ts + duration_s,
            wall_start,
            samples,
            close_reason: reason,
        })
    }

    fn analyze_window(&self, window: &[i16]) -> (f32, f32) {
        let mut energy = 0.0f64;
        let mut fft_in: Vec<Complex<f32>> = Vec::with_capacity(WINDOW);
        for (i, &s) in window.iter().enumerate() {
            let v = s as f32 / 32768.0;
            energy += (v * v) as f64;
            fft_in.push(Complex::new(v * self.hann[i], 0.0));
        }
        let rms = (energy / window.len() as f64).sqrt() as f32;

        self.fft.process(&mut fft_in);

        // Spectral centroid over the first half of the spectrum, in Hz.
        let bin_hz = SAMPLE_RATE as f32 / WINDOW as f32;
        let mut weighted = 0.0f32;
        let mut total = 0.0f32;
        for (i, c) in fft_in[..WINDOW / 2].iter().enumerate() {
            let mag = c.norm();
            weighted += mag * (i as f32 * bin_hz);
            total += mag;
        }
        let centroid = if total > 0.0 { weighted / total } else { 0.0 };
        (rms, centroid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chunk(ts: f64, samples: Vec<i16>) -> PcmChunk {
        PcmChunk {
            ts,
            wall: Utc.timestamp_opt(1_700_000_000, 0).unwrap()
                + ChronoDuration::milliseconds((ts * 1000.0) as i64),
            samples,
        }
    }

    fn sine(freq: f32, secs: f64, amplitude: f32) -> Vec<i16> {
        let n = (secs * SAMPLE_RATE as f64) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (amplitude * (2.0 * std::f32::consts::PI * freq * t).sin() * 32767.0) as i16
            })
            .collect()
    }

    fn config() -> SegmenterConfig {
        SegmenterConfig {
            max_segment: 20.0,
            ..SegmenterConfig::default()
        }
    }

    #[test]
    fn silence_closes_segment() {
        let mut seg = Segmenter::new(config());
        let mut samples = sine(440.0, 6.0, 0.5);
        samples.extend(vec![0i16; (3.0 * SAMPLE_RATE as f64) as usize]);

        let segments = seg.push(&chunk(0.0, samples));
        assert_eq!(segments.len(), 1);
        let s = &segments[0];
        assert_eq!(s.close_reason, CloseReason::Silence);
        assert!(s.duration_s() >= 6.0 && s.duration_s() <= 9.5);
        assert_eq!(s.start_ts, 0.0);
    }

    #[test]
    fn max_length_caps_segment() {
        let mut seg = Segmenter::new(config());
        let segments = seg.push(&chunk(0.0, sine(440.0, 25.0, 0.5)));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].close_reason, CloseReason::MaxLength);
        assert!((segments[0].duration_s() - 20.0).abs() < 0.1);
    }

    #[test]
    fn short_accumulation_is_carried_forward() {
        let mut seg = Segmenter::new(config());
        // 2 s of audio and a pause shorter than silence_hold: nothing yet.
        let mut samples = sine(440.0, 2.0, 0.5);
        samples.extend(vec![0i16; (1.5 * SAMPLE_RATE as f64) as usize]);
        assert!(seg.push(&chunk(0.0, samples)).is_empty());

        // More audio arrives; the earlier material rides along.
        let segments = seg.push(&chunk(3.5, sine(440.0, 18.0, 0.5)));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_ts, 0.0);
    }

    #[test]
    fn segments_are_ordered_and_contiguous() {
        let mut seg = Segmenter::new(config());
        let mut all = Vec::new();
        for i in 0..5 {
            let ts = i as f64 * 10.0;
            all.extend(seg.push(&chunk(ts, sine(440.0, 10.0, 0.5))));
        }
        if let Some(last) = seg.flush() {
            all.push(last);
        }
        assert!(all.len() >= 2);
        for pair in all.windows(2) {
            assert!(pair[0].end_ts <= pair[1].start_ts + 1e-9);
            assert!(pair[0].start_ts < pair[1].start_ts);
        }
    }

    #[test]
    fn spectral_change_closes_segment() {
        let mut seg = Segmenter::new(config());
        let mut samples = sine(300.0, 8.0, 0.5);
        // Content switches to a much brighter signal.
        samples.extend(sine(8000.0, 8.0, 0.5));
        let segments = seg.push(&chunk(0.0, samples));
        assert!(!segments.is_empty());
        assert_eq!(segments[0].close_reason, CloseReason::SpectralChange);
        assert!(segments[0].duration_s() < 10.0);
    }

    #[test]
    fn flush_emits_remainder() {
        let mut seg = Segmenter::new(config());
        assert!(seg.push(&chunk(0.0, sine(440.0, 4.0, 0.5))).is_empty());
        let s = seg.flush().expect("flush emits buffered audio");
        assert_eq!(s.close_reason, CloseReason::Flush);
        assert!((s.duration_s() - 4.0).abs() < 0.1);
    }
}
