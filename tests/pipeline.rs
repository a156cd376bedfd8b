//! End-to-end pipeline behavior over synthetic PCM: segmentation, feature
//! extraction, and play tracking wired together the way a station pipeline
//! wires them. Recognition is driven by a time-range oracle so the timing
//! semantics under test do not depend on fingerprint matching luck; the
//! local index is exercised with real chromaprint fingerprints separately.

use airwave_monitor::config::{SegmenterConfig, TrackerConfig};
use airwave_monitor::models::RecognitionMethod;
use airwave_monitor::services::features::FeatureExtractor;
use airwave_monitor::services::local_matcher::LocalMatcher;
use airwave_monitor::services::play_tracker::{
    ClosedPlay, MatchObservation, PlayTracker, SegmentSpan,
};
use airwave_monitor::services::segmenter::{CloseReason, Segment, Segmenter};
use airwave_monitor::services::stream_puller::{PcmChunk, CHUNK_SAMPLES, SAMPLE_RATE};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use uuid::Uuid;

fn base_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// A steady chord; classifies as music.
fn tonal(freqs: &[f32], secs: f64) -> Vec<i16> {
    let n = (secs * SAMPLE_RATE as f64) as usize;
    let scale = 0.6 / freqs.len() as f32;
    (0..n)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let v: f32 = freqs
                .iter()
                .map(|f| scale * (2.0 * std::f32::consts::PI * f * t).sin())
                .sum();
            (v * 32767.0) as i16
        })
        .collect()
}

/// Noise bursts at syllable rate; classifies as speech.
fn speech_like(secs: f64) -> Vec<i16> {
    let n = (secs * SAMPLE_RATE as f64) as usize;
    let mut state = 0x2468_ace1u32;
    (0..n)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let noise = (state as f32 / u32::MAX as f32) * 2.0 - 1.0;
            let t = i as f32 / SAMPLE_RATE as f32;
            let envelope = if (t * 4.0).fract() < 0.5 { 0.6 } else { 0.02 };
            (noise * envelope * 32767.0) as i16
        })
        .collect()
}

fn track_a(secs: f64) -> Vec<i16> {
    tonal(&[220.0, 277.0, 330.0], secs)
}

fn other_music(secs: f64) -> Vec<i16> {
    tonal(&[523.0, 659.0, 784.0], secs)
}

/// Which track (if any) is "really" broadcasting at a given stream time.
struct Oracle {
    ranges: Vec<(f64, f64, Option<Uuid>)>,
}

impl Oracle {
    fn lookup(&self, ts: f64) -> Option<Uuid> {
        self.ranges
            .iter()
            .find(|(start, end, _)| ts >= *start && ts < *end)
            .and_then(|(_, _, track)| *track)
    }
}

struct Simulation {
    closed: Vec<ClosedPlay>,
    opened: usize,
    segments: Vec<(f64, f64, CloseReason)>,
}

/// Push a whole signal through segmenter → features → oracle-driven
/// recognition → tracker, then drain.
fn simulate(signal: Vec<i16>, oracle: &Oracle) -> Simulation {
    let station = Uuid::new_v4();
    let seg_config = SegmenterConfig {
        max_segment: 10.0,
        ..SegmenterConfig::default()
    };
    let mut segmenter = Segmenter::new(seg_config);
    let extractor = FeatureExtractor::new();
    let mut tracker = PlayTracker::new(station, TrackerConfig::default());

    let mut sim = Simulation {
        closed: Vec::new(),
        opened: 0,
        segments: Vec::new(),
    };

    let mut process = |segment: Segment, tracker: &mut PlayTracker, sim: &mut Simulation| {
        sim.segments
            .push((segment.start_ts, segment.end_ts, segment.close_reason));
        let features = extractor.extract(&segment).expect("feature extraction");
        let span = SegmentSpan {
            start: segment.wall_start,
            end: segment.wall_end(),
        };
        let midpoint = (segment.start_ts + segment.end_ts) / 2.0;

        let output = if !features.is_music {
            tracker.on_speech(span)
        } else if let Some(track_id) = oracle.lookup(midpoint) {
            tracker.on_match(MatchObservation {
                track_id,
                fp_hash: features.fingerprint_hash.clone(),
                confidence: 0.85,
                method: RecognitionMethod::Local,
                span,
            })
        } else {
            tracker.on_unknown(span)
        };

        if output.opened.is_some() {
            sim.opened += 1;
        }
        if let Some(closed) = output.closed {
            sim.closed.push(closed);
        }
    };

    for (i, chunk_samples) in signal.chunks(CHUNK_SAMPLES).enumerate() {
        let ts = (i * CHUNK_SAMPLES) as f64 / SAMPLE_RATE as f64;
        let chunk = PcmChunk {
            ts,
            wall: base_time() + ChronoDuration::milliseconds((ts * 1000.0) as i64),
            samples: chunk_samples.to_vec(),
        };
        for segment in segmenter.push(&chunk) {
            process(segment, &mut tracker, &mut sim);
        }
    }
    if let Some(segment) = segmenter.flush() {
        process(segment, &mut tracker, &mut sim);
    }
    if let Some(closed) = tracker.drain() {
        sim.closed.push(closed);
    }
    sim
}

#[test]
fn clean_single_track_yields_one_detection() {
    let t1 = Uuid::new_v4();
    let oracle = Oracle {
        ranges: vec![(0.0, 45.0, Some(t1))],
    };
    let sim = simulate(track_a(45.0), &oracle);

    assert_eq!(sim.closed.len(), 1, "segments: {:?}", sim.segments);
    let play = &sim.closed[0];
    assert_eq!(play.track_id, t1);
    assert!(
        play.duration_s >= 44.0 && play.duration_s <= 46.0,
        "duration {}",
        play.duration_s
    );
    assert_eq!(play.method, RecognitionMethod::Local);
    assert!(play.confidence >= 0.80);
    assert_eq!(sim.opened, 1);
}

#[test]
fn speech_interruption_splits_the_play() {
    let t1 = Uuid::new_v4();
    let mut signal = track_a(20.0);
    signal.extend(speech_like(10.0));
    signal.extend(track_a(20.0));
    let oracle = Oracle {
        ranges: vec![(0.0, 20.0, Some(t1)), (30.0, 50.0, Some(t1))],
    };

    let sim = simulate(signal, &oracle);

    assert_eq!(sim.closed.len(), 2, "segments: {:?}", sim.segments);
    for play in &sim.closed {
        assert_eq!(play.track_id, t1);
        assert!(
            (play.duration_s - 20.0).abs() < 2.0,
            "duration {}",
            play.duration_s
        );
    }
    let gap = (sim.closed[1].started_at - sim.closed[0].ended_at).num_seconds();
    assert!(gap >= 5, "plays should be separated past the merge gap, got {gap}s");
}

#[test]
fn one_unknown_segment_does_not_split_the_play() {
    let t1 = Uuid::new_v4();
    let mut signal = track_a(20.0);
    signal.extend(other_music(6.0));
    signal.extend(track_a(20.0));
    // The middle block is music the oracle does not recognize.
    let oracle = Oracle {
        ranges: vec![(0.0, 20.0, Some(t1)), (26.0, 46.0, Some(t1))],
    };

    let sim = simulate(signal, &oracle);

    assert_eq!(sim.closed.len(), 1, "segments: {:?}", sim.segments);
    let play = &sim.closed[0];
    assert_eq!(play.track_id, t1);
    assert!(
        play.duration_s >= 44.0 && play.duration_s <= 47.0,
        "gap should be bridged into one play, duration {}",
        play.duration_s
    );
}

#[test]
fn segments_from_one_station_never_overlap() {
    let t1 = Uuid::new_v4();
    let mut signal = track_a(25.0);
    signal.extend(speech_like(8.0));
    signal.extend(other_music(12.0));
    let oracle = Oracle {
        ranges: vec![(0.0, 25.0, Some(t1))],
    };

    let sim = simulate(signal, &oracle);

    for pair in sim.segments.windows(2) {
        assert!(pair[0].1 <= pair[1].0 + 1e-9, "{pair:?}");
    }
}

#[tokio::test]
async fn chromaprint_excerpt_matches_indexed_track() {
    let extractor = FeatureExtractor::new();
    let t1 = Uuid::new_v4();

    let full = segment_of(track_a(30.0));
    let full_features = extractor.extract(&full).unwrap();
    assert!(full_features.is_music);

    let matcher = LocalMatcher::new(0.8);
    matcher
        .insert(
            t1,
            full_features.fingerprint_hash.clone(),
            full_features.fingerprint.clone(),
        )
        .await;

    // An aligned excerpt of the same audio, as a pulled stream would
    // produce at the top of the track.
    let excerpt = segment_of(track_a(12.0));
    let excerpt_features = extractor.extract(&excerpt).unwrap();
    let hit = matcher
        .best_match(
            &excerpt_features.fingerprint_hash,
            &excerpt_features.fingerprint,
        )
        .await
        .expect("excerpt should match the indexed track");
    assert_eq!(hit.track_id, t1);
    assert!(hit.confidence >= 0.8, "confidence {}", hit.confidence);
}

fn segment_of(samples: Vec<i16>) -> Segment {
    let duration = samples.len() as f64 / SAMPLE_RATE as f64;
    Segment {
        start_ts: 0.0,
        end_ts: duration,
        wall_start: base_time(),
        samples,
        close_reason: CloseReason::MaxLength,
    }
}
