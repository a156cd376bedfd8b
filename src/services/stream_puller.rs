//! Live stream ingestion.
//!
//! Opens an HTTP/ICY audio stream, decodes whatever codec it carries to the
//! canonical analysis form (mono, 44.1 kHz, signed 16-bit), and emits
//! timestamped PCM chunks. Symphonia is synchronous, so each connection gets
//! a dedicated decode task on the blocking pool, bridged to the async side
//! with bounded channels; a full chunk queue throttles the socket read and
//! keeps ingestion at real-time rate.

use crate::config::PullerConfig;
use crate::error::{AppError, Result};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use rand::Rng;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Canonical analysis sample rate.
pub const SAMPLE_RATE: u32 = 44_100;

/// Emitted chunk size: half a second of mono PCM.
pub const CHUNK_SAMPLES: usize = SAMPLE_RATE as usize / 2;

/// One decoded chunk of canonical PCM.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// Monotonic stream time of the first sample, seconds. Advanced by
    /// sample count, not wall clock, so it cannot drift.
    pub ts: f64,
    /// Wall clock of the first sample, re-anchored at each reconnect.
    pub wall: DateTime<Utc>,
    pub samples: Vec<i16>,
}

pub struct StreamPuller {
    station_id: Uuid,
    url: String,
    config: PullerConfig,
    client: reqwest::Client,
}

impl StreamPuller {
    pub fn new(station_id: Uuid, url: String, config: PullerConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            station_id,
            url,
            config,
            client,
        }
    }

    /// Pull until cancelled. Transient failures reconnect with jittered
    /// exponential backoff; too many failures inside the window surface as
    /// `StreamDead` and end the pull.
    pub async fn run(&self, tx: mpsc::Sender<PcmChunk>, cancel: CancellationToken) -> Result<()> {
        let sample_pos = Arc::new(AtomicU64::new(0));
        let mut failures: VecDeque<Instant> = VecDeque::new();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.pull_once(&tx, &cancel, sample_pos.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() || matches!(e, AppError::Decode(_)) => {
                    let now = Instant::now();
                    failures.push_back(now);
                    while let Some(&front) = failures.front() {
                        if now.duration_since(front) > self.config.failure_window {
                            failures.pop_front();
                        } else {
                            break;
                        }
                    }
                    if failures.len() as u32 >= self.config.dead_after_failures {
                        return Err(AppError::StreamDead(format!(
                            "{} failures within {:?}: {e}",
                            failures.len(),
                            self.config.failure_window
                        )));
                    }

                    attempt += 1;
                    let delay = backoff_delay(attempt, self.config.backoff_cap);
                    warn!(
                        station_id = %self.station_id,
                        attempt,
                        "Stream pull failed ({e}); reconnecting in {delay:?}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One connection lifetime: connect, bridge bytes to the decoder, stop
    /// on cancellation or error.
    async fn pull_once(
        &self,
        tx: &mpsc::Sender<PcmChunk>,
        cancel: &CancellationToken,
        sample_pos: Arc<AtomicU64>,
    ) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AppError::Stream(format!("connect failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::Stream(format!(
                "stream endpoint returned {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        info!(
            station_id = %self.station_id,
            content_type = content_type.as_deref().unwrap_or("-"),
            "Connected to stream"
        );

        // Anchor wall clock once per connection; chunk timestamps advance
        // from here by sample count alone.
        let start_pos = sample_pos.load(Ordering::Acquire);
        let anchor = Utc::now()
            - ChronoDuration::milliseconds((start_pos as f64 / SAMPLE_RATE as f64 * 1000.0) as i64);

        let (byte_tx, byte_rx) = mpsc::channel::<Bytes>(64);
        let decoder_tx = tx.clone();
        let decoder_pos = sample_pos.clone();
        let fail_streak = self.config.decode_fail_streak;
        let decoder = tokio::task::spawn_blocking(move || {
            decode_stream(byte_rx, decoder_tx, decoder_pos, anchor, content_type, fail_streak)
        });

        let mut stream = response.bytes_stream();
        let feed_result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = tokio::time::timeout(self.config.read_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => break Err(AppError::Stream("read timeout".to_string())),
                Ok(None) => break Err(AppError::Stream("stream ended".to_string())),
                Ok(Some(Err(e))) => break Err(AppError::Stream(format!("read failed: {e}"))),
                Ok(Some(Ok(bytes))) => {
                    if byte_tx.send(bytes).await.is_err() {
                        // Decoder exited; its join result carries the reason.
                        break Ok(());
                    }
                }
            }
        };

        drop(byte_tx);
        let decode_result = decoder
            .await
            .map_err(|e| anyhow::anyhow!("decoder task panicked: {e}"))?;

        match (feed_result, decode_result) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let base = Duration::from_millis(500).saturating_mul(2u32.saturating_pow(attempt.min(10)));
    let capped = base.min(cap);
    // Jitter shaves up to a quarter off so reconnecting stations spread out.
    let jitter_ms = rand::thread_rng().gen_range(0..=(capped.as_millis() as u64 / 4).max(1));
    capped - Duration::from_millis(jitter_ms.min(capped.as_millis() as u64))
}

/// Synchronous decode loop for one connection. Runs on the blocking pool;
/// `blocking_send` into the bounded chunk channel provides backpressure.
fn decode_stream(
    byte_rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<PcmChunk>,
    sample_pos: Arc<AtomicU64>,
    anchor: DateTime<Utc>,
    content_type: Option<String>,
    decode_fail_streak: u32,
) -> Result<()> {
    let reader = ChannelReader::new(byte_rx);
    let source = ReadOnlySource::new(reader);
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    match content_type.as_deref() {
        Some(ct) if ct.contains("mpeg") || ct.contains("mp3") => {
            hint.mime_type("audio/mpeg");
        }
        Some(ct) if ct.contains("aac") => {
            hint.mime_type("audio/aac");
        }
        Some(ct) if ct.contains("ogg") => {
            hint.mime_type("audio/ogg");
        }
        _ => {}
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AppError::Decode(format!("failed to probe stream: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AppError::Decode("no audio track in stream".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| AppError::Decode(format!("failed to create decoder: {e}")))?;

    let source_rate = codec_params.sample_rate.unwrap_or(SAMPLE_RATE);
    let mut resampler = if source_rate != SAMPLE_RATE {
        Some(StreamResampler::new(source_rate)?)
    } else {
        None
    };

    let mut chunk_buf: Vec<i16> = Vec::with_capacity(CHUNK_SAMPLES);
    let mut error_streak = 0u32;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                error_streak += 1;
                if error_streak >= decode_fail_streak {
                    return Err(AppError::Decode(format!(
                        "{error_streak} consecutive packet errors: {e}"
                    )));
                }
                continue;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                // Mid-stream metadata blocks and damaged frames land here;
                // the next frame sync recovers.
                error_streak += 1;
                if error_streak >= decode_fail_streak {
                    return Err(AppError::Decode(format!(
                        "{error_streak} consecutive decode errors: {e}"
                    )));
                }
                debug!("Dropped undecodable packet: {e}");
                continue;
            }
        };
        error_streak = 0;

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        // Downmix interleaved frames to mono.
        let mono: Vec<f32> = sample_buf
            .samples()
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        let canonical: Vec<f32> = match resampler.as_mut() {
            Some(rs) => rs.process(&mono)?,
            None => mono,
        };

        for sample in canonical {
            chunk_buf.push((sample.clamp(-1.0, 1.0) * 32767.0) as i16);
            if chunk_buf.len() >= CHUNK_SAMPLES {
                if !emit_chunk(&tx, &sample_pos, anchor, &mut chunk_buf) {
                    return Ok(());
                }
            }
        }
    }

    if !chunk_buf.is_empty() {
        emit_chunk(&tx, &sample_pos, anchor, &mut chunk_buf);
    }
    Ok(())
}

/// Send the buffered samples as one chunk; false when the receiver is gone.
fn emit_chunk(
    tx: &mpsc::Sender<PcmChunk>,
    sample_pos: &AtomicU64,
    anchor: DateTime<Utc>,
    chunk_buf: &mut Vec<i16>,
) -> bool {
    let pos = sample_pos.load(Ordering::Acquire);
    let ts = pos as f64 / SAMPLE_RATE as f64;
    let chunk = PcmChunk {
        ts,
        wall: anchor + ChronoDuration::milliseconds((ts * 1000.0) as i64),
        samples: std::mem::take(chunk_buf),
    };
    let len = chunk.samples.len() as u64;
    if tx.blocking_send(chunk).is_err() {
        return false;
    }
    sample_pos.store(pos + len, Ordering::Release);
    true
}

/// Blocking `Read` over the byte bridge; returns EOF once the async side
/// hangs up.
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(bytes) => self.current = bytes,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

/// Streaming wrapper around `SincFixedIn`, which wants fixed-size input
/// blocks; the remainder is carried between calls.
struct StreamResampler {
    inner: SincFixedIn<f32>,
    pending: Vec<f32>,
    block: usize,
}

impl StreamResampler {
    fn new(source_rate: u32) -> Result<Self> {
        const BLOCK: usize = 1024;
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = SAMPLE_RATE as f64 / source_rate as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, params, BLOCK, 1)
            .map_err(|e| AppError::Decode(format!("resampler init: {e}")))?;
        Ok(Self {
            inner,
            pending: Vec::new(),
            block: BLOCK,
        })
    }

    fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.block {
            let input: Vec<f32> = self.pending.drain(..self.block).collect();
            let waves = self
                .inner
                .process(&[input], None)
                .map_err(|e| AppError::Decode(format!("resample: {e}")))?;
            out.extend_from_slice(&waves[0]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_reader_concatenates_and_terminates() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(Bytes::from_static(b"hello ")).unwrap();
        tx.try_send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt, Duration::from_secs(60));
            assert!(d <= Duration::from_secs(61), "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn resampler_scales_sample_count() {
        let mut rs = StreamResampler::new(22_050).unwrap();
        let input = vec![0.0f32; 22_050];
        let out = rs.process(&input).unwrap();
        // 22.05 kHz -> 44.1 kHz roughly doubles the count; block-boundary
        // remainders stay pending.
        assert!(out.len() > 40_000 && out.len() < 46_000, "{}", out.len());
    }

    #[tokio::test]
    async fn decode_stream_emits_monotonic_chunks() {
        // A WAV container exercises the same probe/decode path as a live
        // stream, without the network.
        let mut wav = Vec::new();
        {
            let spec = hound::WavSpec {
                channels: 2,
                sample_rate: SAMPLE_RATE,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer =
                hound::WavWriter::new(std::io::Cursor::new(&mut wav), spec).unwrap();
            for i in 0..SAMPLE_RATE as usize * 2 {
                let t = i as f32 / SAMPLE_RATE as f32;
                let v = (0.4 * (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 32767.0) as i16;
                writer.write_sample(v).unwrap();
                writer.write_sample(v).unwrap();
            }
            writer.finalize().unwrap();
        }

        let (byte_tx, byte_rx) = mpsc::channel(8);
        let (pcm_tx, mut pcm_rx) = mpsc::channel(256);
        let pos = Arc::new(AtomicU64::new(0));
        let anchor = Utc::now();

        let decoder_pos = pos.clone();
        let handle = tokio::task::spawn_blocking(move || {
            decode_stream(byte_rx, pcm_tx, decoder_pos, anchor, None, 10)
        });
        for piece in wav.chunks(4096) {
            byte_tx.send(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        drop(byte_tx);
        handle.await.unwrap().unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = pcm_rx.recv().await {
            chunks.push(chunk);
        }
        assert!(!chunks.is_empty());
        let total: usize = chunks.iter().map(|c| c.samples.len()).sum();
        // Stereo input downmixes to ~2 s of mono.
        assert!((total as i64 - (SAMPLE_RATE as i64 * 2)).abs() < CHUNK_SAMPLES as i64);
        for pair in chunks.windows(2) {
            assert!(pair[1].ts > pair[0].ts);
        }
        assert_eq!(pos.load(Ordering::Acquire), total as u64);
    }
}
