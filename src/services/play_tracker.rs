//! Per-station play tracking.
//!
//! Converts the intermittent stream of per-segment recognition results into
//! closed "track X played from T0 to T1" intervals. One tracker per station,
//! owned by that station's pipeline task; the tracker itself does no I/O.

use crate::config::TrackerConfig;
use crate::models::RecognitionMethod;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Wall-clock span covered by one analysis segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SegmentSpan {
    pub fn duration_s(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }
}

/// A segment recognized as a known track.
#[derive(Debug, Clone)]
pub struct MatchObservation {
    pub track_id: Uuid,
    pub fp_hash: String,
    pub confidence: f64,
    pub method: RecognitionMethod,
    pub span: SegmentSpan,
}

/// The track currently believed to be broadcasting on this station.
#[derive(Debug, Clone)]
pub struct CurrentPlay {
    pub track_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_confirm: DateTime<Utc>,
    pub accumulated_s: f64,
    pub fp_hash: String,
    pub confidence: f64,
    pub method: RecognitionMethod,
    pub confirms: u32,
}

/// A play interval ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPlay {
    pub station_id: Uuid,
    pub track_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_s: f64,
    pub confidence: f64,
    pub method: RecognitionMethod,
    pub fp_hash: String,
}

/// Candidate track change awaiting its second confirming segment.
#[derive(Debug, Clone)]
struct PendingSwitch {
    track_id: Uuid,
    fp_hash: String,
    confidence: f64,
    method: RecognitionMethod,
    /// Start of the first segment that disagreed with the current play; the
    /// replacement play opens here if the switch is confirmed.
    first_start: DateTime<Utc>,
    /// Where the current play closes if the switch is confirmed.
    prev_last_confirm: DateTime<Utc>,
}

/// What one input did to the tracker. At most one play closes and at most
/// one opens per input.
#[derive(Debug, Default)]
pub struct TrackerOutput {
    pub opened: Option<CurrentPlay>,
    pub closed: Option<ClosedPlay>,
}

pub struct PlayTracker {
    station_id: Uuid,
    config: TrackerConfig,
    current: Option<CurrentPlay>,
    pending: Option<PendingSwitch>,
    /// Seconds of consecutive music-but-unrecognized segments.
    unknown_secs: f64,
}

impl PlayTracker {
    pub fn new(station_id: Uuid, config: TrackerConfig) -> Self {
        Self {
            station_id,
            config,
            current: None,
            pending: None,
            unknown_secs: 0.0,
        }
    }

    pub fn current(&self) -> Option<&CurrentPlay> {
        self.current.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Segment recognized as music matching a track.
    pub fn on_match(&mut self, obs: MatchObservation) -> TrackerOutput {
        self.unknown_secs = 0.0;

        let Some(current) = self.current.as_mut() else {
            self.pending = None;
            return TrackerOutput {
                opened: self.open(&obs),
                closed: None,
            };
        };

        if current.track_id == obs.track_id {
            // Confirmation: accumulate the wall-clock delta since the last
            // confirmation, not the segment's own measured duration.
            self.pending = None;
            let delta = (obs.span.end - current.last_confirm).num_milliseconds() as f64 / 1000.0;
            if delta > 0.0 {
                current.accumulated_s += delta;
                current.last_confirm = obs.span.end;
            }
            current.confirms += 1;
            if obs.confidence > current.confidence {
                current.confidence = obs.confidence;
            }
            return TrackerOutput::default();
        }

        // A different track. One disagreeing segment starts probation; the
        // switch takes effect only on the second consecutive confirmation.
        match self.pending.take() {
            Some(pending) if pending.track_id == obs.track_id => {
                let closed = self.close_at(pending.prev_last_confirm);
                let opened = CurrentPlay {
                    track_id: pending.track_id,
                    started_at: pending.first_start,
                    last_confirm: obs.span.end,
                    accumulated_s: (obs.span.end - pending.first_start).num_milliseconds() as f64
                        / 1000.0,
                    fp_hash: pending.fp_hash,
                    confidence: pending.confidence.max(obs.confidence),
                    method: pending.method,
                    confirms: 2,
                };
                self.current = Some(opened.clone());
                TrackerOutput {
                    opened: Some(opened),
                    closed,
                }
            }
            _ => {
                self.pending = Some(PendingSwitch {
                    track_id: obs.track_id,
                    fp_hash: obs.fp_hash,
                    confidence: obs.confidence,
                    method: obs.method,
                    first_start: obs.span.start,
                    prev_last_confirm: current.last_confirm,
                });
                // The old play keeps accumulating through probation.
                let delta =
                    (obs.span.end - current.last_confirm).num_milliseconds() as f64 / 1000.0;
                if delta > 0.0 {
                    current.accumulated_s += delta;
                    current.last_confirm = obs.span.end;
                }
                TrackerOutput::default()
            }
        }
    }

    /// Segment classified as music but matching nothing.
    pub fn on_unknown(&mut self, span: SegmentSpan) -> TrackerOutput {
        self.pending = None;
        let Some(current) = self.current.as_mut() else {
            return TrackerOutput::default();
        };

        self.unknown_secs += span.duration_s();
        if self.unknown_secs > self.config.gap_tolerance {
            self.unknown_secs = 0.0;
            return TrackerOutput {
                opened: None,
                closed: self.close_current(),
            };
        }

        // The track is probably still playing; bridge the gap.
        let delta = (span.end - current.last_confirm).num_milliseconds() as f64 / 1000.0;
        if delta > 0.0 {
            current.accumulated_s += delta;
            current.last_confirm = span.end;
        }
        TrackerOutput::default()
    }

    /// Segment classified as speech or silence.
    pub fn on_speech(&mut self, _span: SegmentSpan) -> TrackerOutput {
        self.pending = None;
        self.unknown_secs = 0.0;
        TrackerOutput {
            opened: None,
            closed: self.close_current(),
        }
    }

    /// Periodic tick; closes a play whose confirmations stopped arriving.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> TrackerOutput {
        let timed_out = self
            .current
            .as_ref()
            .map(|c| (now - c.last_confirm).num_milliseconds() as f64 / 1000.0 > self.config.playing_timeout)
            .unwrap_or(false);
        if !timed_out {
            return TrackerOutput::default();
        }
        self.pending = None;
        self.unknown_secs = 0.0;
        TrackerOutput {
            opened: None,
            closed: self.close_current(),
        }
    }

    /// Shutdown drain: close whatever is playing with its accumulated span.
    pub fn drain(&mut self) -> Option<ClosedPlay> {
        self.pending = None;
        self.unknown_secs = 0.0;
        self.close_current()
    }

    fn open(&mut self, obs: &MatchObservation) -> Option<CurrentPlay> {
        if obs.confidence < self.config.record_min_confidence {
            return None;
        }
        let play = CurrentPlay {
            track_id: obs.track_id,
            started_at: obs.span.start,
            last_confirm: obs.span.end,
            accumulated_s: obs.span.duration_s(),
            fp_hash: obs.fp_hash.clone(),
            confidence: obs.confidence,
            method: obs.method,
            confirms: 1,
        };
        self.current = Some(play.clone());
        Some(play)
    }

    fn close_current(&mut self) -> Option<ClosedPlay> {
        let end = self.current.as_ref()?.last_confirm;
        self.close_at(end)
    }

    /// Close the current play at `end`, dropping intervals under the
    /// minimum detection duration.
    fn close_at(&mut self, end: DateTime<Utc>) -> Option<ClosedPlay> {
        let current = self.current.take()?;
        let duration_s = (end - current.started_at).num_milliseconds() as f64 / 1000.0;
        if duration_s < self.config.min_detection_duration {
            return None;
        }
        Some(ClosedPlay {
            station_id: self.station_id,
            track_id: current.track_id,
            started_at: current.started_at,
            ended_at: end,
            duration_s,
            confidence: current.confidence,
            method: current.method,
            fp_hash: current.fp_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + chrono::Duration::milliseconds((secs * 1000.0) as i64)
    }

    fn span(start: f64, end: f64) -> SegmentSpan {
        SegmentSpan {
            start: t(start),
            end: t(end),
        }
    }

    fn m(track: Uuid, start: f64, end: f64) -> MatchObservation {
        MatchObservation {
            track_id: track,
            fp_hash: "abc123".to_string(),
            confidence: 0.9,
            method: RecognitionMethod::Local,
            span: span(start, end),
        }
    }

    fn tracker() -> PlayTracker {
        PlayTracker::new(Uuid::new_v4(), TrackerConfig::default())
    }

    #[test]
    fn open_then_confirm_accumulates_wall_delta() {
        let mut tr = tracker();
        let track = Uuid::new_v4();

        let out = tr.on_match(m(track, 0.0, 10.0));
        assert!(out.opened.is_some());
        assert!(out.closed.is_none());

        tr.on_match(m(track, 10.0, 20.0));
        tr.on_match(m(track, 20.0, 30.0));

        let cur = tr.current().unwrap();
        assert_eq!(cur.confirms, 3);
        assert_eq!(cur.accumulated_s, 30.0);
        assert_eq!(cur.last_confirm, t(30.0));
    }

    #[test]
    fn low_confidence_open_is_discarded() {
        let mut tr = tracker();
        let mut obs = m(Uuid::new_v4(), 0.0, 10.0);
        obs.confidence = 0.3;
        let out = tr.on_match(obs);
        assert!(out.opened.is_none());
        assert!(!tr.is_playing());
    }

    #[test]
    fn late_sample_does_not_shrink_accumulation() {
        let mut tr = tracker();
        let track = Uuid::new_v4();
        tr.on_match(m(track, 0.0, 10.0));
        // A retried recognition for an already-covered span.
        tr.on_match(m(track, 4.0, 8.0));
        let cur = tr.current().unwrap();
        assert_eq!(cur.accumulated_s, 10.0);
        assert_eq!(cur.last_confirm, t(10.0));
    }

    #[test]
    fn speech_closes_the_play() {
        let mut tr = tracker();
        let track = Uuid::new_v4();
        tr.on_match(m(track, 0.0, 20.0));
        let out = tr.on_speech(span(20.0, 25.0));
        let closed = out.closed.unwrap();
        assert_eq!(closed.track_id, track);
        assert_eq!(closed.duration_s, 20.0);
        assert!(!tr.is_playing());
    }

    #[test]
    fn short_play_is_dropped_on_close() {
        let mut tr = tracker();
        tr.on_match(m(Uuid::new_v4(), 0.0, 4.0));
        let out = tr.on_speech(span(4.0, 6.0));
        assert!(out.closed.is_none(), "4 s play is under the minimum");
        assert!(!tr.is_playing());
    }

    #[test]
    fn one_unknown_segment_is_bridged() {
        let mut tr = tracker();
        let track = Uuid::new_v4();
        tr.on_match(m(track, 0.0, 20.0));
        let out = tr.on_unknown(span(20.0, 26.0));
        assert!(out.closed.is_none());
        tr.on_match(m(track, 26.0, 46.0));
        let cur = tr.current().unwrap();
        assert_eq!(cur.accumulated_s, 46.0);
    }

    #[test]
    fn unknown_streak_past_tolerance_closes() {
        let mut tr = tracker();
        let track = Uuid::new_v4();
        tr.on_match(m(track, 0.0, 20.0));
        assert!(tr.on_unknown(span(20.0, 26.0)).closed.is_none());
        // 6 + 6 > gap_tolerance (10 s): closes at the last bridged confirm.
        let out = tr.on_unknown(span(26.0, 32.0));
        let closed = out.closed.unwrap();
        assert_eq!(closed.ended_at, t(26.0));
        assert!(!tr.is_playing());
    }

    #[test]
    fn track_change_requires_two_consecutive_confirmations() {
        let mut tr = tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tr.on_match(m(a, 0.0, 20.0));

        // First disagreeing segment: probation, old play continues.
        let out = tr.on_match(m(b, 20.0, 30.0));
        assert!(out.closed.is_none());
        assert_eq!(tr.current().unwrap().track_id, a);
        assert_eq!(tr.current().unwrap().last_confirm, t(30.0));

        // Second consecutive: old closes at its pre-probation confirm, new
        // opens at the probation start.
        let out = tr.on_match(m(b, 30.0, 40.0));
        let closed = out.closed.unwrap();
        assert_eq!(closed.track_id, a);
        assert_eq!(closed.ended_at, t(20.0));
        assert_eq!(closed.duration_s, 20.0);

        let opened = out.opened.unwrap();
        assert_eq!(opened.track_id, b);
        assert_eq!(opened.started_at, t(20.0));
        assert_eq!(opened.confirms, 2);
        assert!(closed.ended_at <= opened.started_at);
    }

    #[test]
    fn single_misidentification_does_not_switch() {
        let mut tr = tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tr.on_match(m(a, 0.0, 20.0));
        tr.on_match(m(b, 20.0, 30.0));
        // The original track returns: probation is abandoned.
        tr.on_match(m(a, 30.0, 40.0));
        let cur = tr.current().unwrap();
        assert_eq!(cur.track_id, a);
        assert_eq!(cur.accumulated_s, 40.0);
    }

    #[test]
    fn unknown_breaks_probation_consecutiveness() {
        let mut tr = tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tr.on_match(m(a, 0.0, 20.0));
        tr.on_match(m(b, 20.0, 28.0));
        tr.on_unknown(span(28.0, 32.0));
        // This is again the *first* consecutive confirmation for b.
        let out = tr.on_match(m(b, 32.0, 40.0));
        assert!(out.closed.is_none());
        assert_eq!(tr.current().unwrap().track_id, a);
    }

    #[test]
    fn tick_timeout_closes_stale_play() {
        let mut tr = tracker();
        let track = Uuid::new_v4();
        tr.on_match(m(track, 0.0, 30.0));
        assert!(tr.on_tick(t(40.0)).closed.is_none());
        let out = tr.on_tick(t(100.0));
        let closed = out.closed.unwrap();
        assert_eq!(closed.ended_at, t(30.0));
        assert_eq!(closed.duration_s, 30.0);
    }

    #[test]
    fn drain_closes_current_play() {
        let mut tr = tracker();
        let track = Uuid::new_v4();
        tr.on_match(m(track, 0.0, 25.0));
        let closed = tr.drain().unwrap();
        assert_eq!(closed.track_id, track);
        assert_eq!(closed.duration_s, 25.0);
        assert!(tr.drain().is_none());
    }

    #[test]
    fn at_most_one_open_and_close_per_input() {
        let mut tr = tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let outs = vec![
            tr.on_match(m(a, 0.0, 10.0)),
            tr.on_match(m(a, 10.0, 20.0)),
            tr.on_match(m(b, 20.0, 30.0)),
            tr.on_match(m(b, 30.0, 40.0)),
            tr.on_speech(span(40.0, 42.0)),
        ];
        for out in outs {
            let opens = out.opened.is_some() as u8;
            let closes = out.closed.is_some() as u8;
            assert!(opens <= 1 && closes <= 1);
        }
    }
}
