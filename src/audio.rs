//! Audio capture using CPAL for cross-platform audio input
//!
//! One `AudioCaptureSession` per dictation attempt. The hardware stream is
//! owned by a dedicated thread (CPAL streams are not `Send`); samples are
//! downmixed to mono, resampled inline to the fixed target rate, appended to
//! a mutex-guarded buffer, and fanned out to an optional per-chunk callback
//! for live streaming consumers.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::capabilities::{Capability, PromptGate};
use crate::error::{Error, Result};

/// Callback invoked with every resampled mono chunk as it is captured
pub type ChunkCallback = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioCaptureConfig {
    /// Target sample rate in Hz (16000 for speech recognition)
    pub sample_rate: u32,
    /// Target channel count (mono)
    pub channels: u16,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self { sample_rate: 16_000, channels: 1 }
    }
}

/// Streaming linear resampler, stateful across callback chunks so chunk
/// boundaries don't produce discontinuities.
pub struct LinearResampler {
    src_rate: u32,
    dst_rate: u32,
    /// Position of the next output sample in input-sample units, relative to
    /// the start of the next chunk; negative values point into `carry`
    offset: f64,
    carry: f32,
    primed: bool,
}

impl LinearResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self { src_rate, dst_rate, offset: 0.0, carry: 0.0, primed: false }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.src_rate == self.dst_rate {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let step = self.src_rate as f64 / self.dst_rate as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / step).ceil() as usize + 1);

        let mut pos = if self.primed { self.offset } else { 0.0 };
        self.primed = true;

        while pos <= (input.len() - 1) as f64 {
            let value = if pos < 0.0 {
                // between the carried tail of the previous chunk and input[0]
                let frac = (pos + 1.0) as f32;
                self.carry + (input[0] - self.carry) * frac
            } else {
                let idx = pos as usize;
                let frac = (pos - idx as f64) as f32;
                if idx + 1 < input.len() {
                    input[idx] + (input[idx + 1] - input[idx]) * frac
                } else {
                    input[idx]
                }
            };
            out.push(value);
            pos += step;
        }

        self.offset = pos - input.len() as f64;
        self.carry = input[input.len() - 1];
        out
    }
}

/// Average interleaved frames down to mono
fn downmix_into(samples: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels == 1 {
        out.extend_from_slice(samples);
        return;
    }
    for frame in samples.chunks_exact(channels) {
        let sum: f32 = frame.iter().sum();
        out.push(sum / channels as f32);
    }
}

/// RMS amplitude of the trailing `window` samples, scaled for display
fn rms_level(samples: &[f32], window: usize) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let start = samples.len().saturating_sub(window.max(1));
    let recent = &samples[start..];
    let sum_squares: f32 = recent.iter().map(|&s| s * s).sum();
    let rms = (sum_squares / recent.len() as f32).sqrt();
    // typical speech is quiet; boost for indicator UI
    (rms * 3.0).min(1.0)
}

/// Handles audio capture from the default input device for one attempt
pub struct AudioCaptureSession {
    config: AudioCaptureConfig,
    on_chunk: Option<ChunkCallback>,
    buffer: Arc<Mutex<Vec<f32>>>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<std::thread::JoinHandle<()>>,
    started_at: Option<Instant>,
}

impl AudioCaptureSession {
    pub fn new(config: AudioCaptureConfig) -> Self {
        Self {
            config,
            on_chunk: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stop_tx: None,
            worker: None,
            started_at: None,
        }
    }

    /// Register a live per-chunk consumer (streaming transcription)
    pub fn with_chunk_callback(mut self, callback: ChunkCallback) -> Self {
        self.on_chunk = Some(callback);
        self
    }

    /// Open a fresh capture stream. Errors from device/stream setup surface
    /// here synchronously. Idempotent while running.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.buffer.lock().clear();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let buffer = Arc::clone(&self.buffer);
        let on_chunk = self.on_chunk.clone();
        let target_rate = self.config.sample_rate;

        let worker = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(target_rate, buffer, on_chunk) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // hold the stream alive until stop
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Capture("capture thread died during startup".to_string()))??;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        self.started_at = Some(Instant::now());
        info!("Audio capture started ({}Hz mono)", target_rate);
        Ok(())
    }

    /// Close the stream and drain the accumulated buffer.
    ///
    /// Returns `None` if the session was never started.
    pub fn stop(&mut self) -> Option<(Vec<f32>, Duration)> {
        let worker = self.worker.take()?;
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = worker.join();

        let samples = std::mem::take(&mut *self.buffer.lock());
        let elapsed = self.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
        info!("Audio capture stopped, {} samples in {:?}", samples.len(), elapsed);
        Some((samples, elapsed))
    }

    /// Current audio level (RMS of the last ~50ms), 0.0..=1.0
    pub fn level(&self) -> f32 {
        let window = (self.config.sample_rate as usize / 20).max(1);
        rms_level(&self.buffer.lock(), window)
    }

    /// Duration of audio buffered so far
    pub fn buffered_duration(&self) -> Duration {
        let samples = self.buffer.lock().len() as u64;
        Duration::from_millis(samples * 1000 / self.config.sample_rate as u64)
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn open_input_stream(
    target_rate: u32,
    buffer: Arc<Mutex<Vec<f32>>>,
    on_chunk: Option<ChunkCallback>,
) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Capture("No input device available".to_string()))?;

    // note: device.name() is deprecated in cpal 0.17+, but works
    #[allow(deprecated)]
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using input device: {}", device_name);

    let supported_configs: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| Error::Capture(format!("Failed to get supported configs: {e}")))?
        .collect();

    if supported_configs.is_empty() {
        return Err(Error::Capture("No supported input configs".to_string()));
    }

    let (supported_config, input_channels, sample_format, native_rate) =
        select_supported_config(&supported_configs, target_rate, 1)
            .ok_or_else(|| Error::Capture("No supported input config found".to_string()))?;

    let stream_config = supported_config.config();

    debug!(
        "Stream config: {:?} (input channels: {}, format: {:?}, native rate: {})",
        stream_config, input_channels, sample_format, native_rate
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::I24 => build_stream::<cpal::I24>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::U24 => build_stream::<cpal::U24>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::U32 => build_stream::<u32>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::I8 => build_stream::<i8>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::U8 => build_stream::<u8>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::F64 => build_stream::<f64>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::I64 => build_stream::<i64>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        SampleFormat::U64 => build_stream::<u64>(&device, &stream_config, input_channels, native_rate, target_rate, buffer, on_chunk)?,
        other => {
            return Err(Error::Capture(format!("Unsupported sample format: {other:?}")));
        }
    };

    stream
        .play()
        .map_err(|e| Error::Capture(format!("Failed to start stream: {e}")))?;

    Ok(stream)
}

fn build_stream<T>(
    device: &Device,
    stream_config: &StreamConfig,
    input_channels: u16,
    native_rate: u32,
    target_rate: u32,
    buffer: Arc<Mutex<Vec<f32>>>,
    on_chunk: Option<ChunkCallback>,
) -> Result<Stream>
where
    T: Sample + SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = input_channels as usize;
    let mut resampler = LinearResampler::new(native_rate, target_rate);
    let mut interleaved: Vec<f32> = Vec::new();
    let mut mono: Vec<f32> = Vec::new();

    let err_fn = |err| error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            stream_config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                interleaved.clear();
                interleaved.extend(data.iter().map(|sample| sample.to_sample::<f32>()));

                mono.clear();
                downmix_into(&interleaved, channels, &mut mono);

                let chunk = resampler.process(&mono);
                if chunk.is_empty() {
                    return;
                }
                buffer.lock().extend_from_slice(&chunk);
                if let Some(cb) = &on_chunk {
                    cb(&chunk);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Capture(format!("Failed to build stream: {e}")))
}

fn select_supported_config(
    ranges: &[cpal::SupportedStreamConfigRange],
    preferred_rate: u32,
    preferred_channels: u16,
) -> Option<(cpal::SupportedStreamConfig, u16, SampleFormat, u32)> {
    let preferred_formats = [
        SampleFormat::F32,
        SampleFormat::I16,
        SampleFormat::U16,
        SampleFormat::I32,
        SampleFormat::U32,
        SampleFormat::F64,
        SampleFormat::I24,
        SampleFormat::U24,
        SampleFormat::I8,
        SampleFormat::U8,
        SampleFormat::I64,
        SampleFormat::U64,
    ];

    for format in preferred_formats {
        let mut candidates: Vec<_> = ranges
            .iter()
            .copied()
            .filter(|range| {
                range.sample_format() == format && range.channels() == preferred_channels
            })
            .collect();

        if candidates.is_empty() {
            candidates = ranges
                .iter()
                .copied()
                .filter(|range| range.sample_format() == format)
                .collect();
        }

        if candidates.is_empty() {
            continue;
        }

        let best = candidates
            .into_iter()
            .min_by_key(|range| sample_rate_distance(*range, preferred_rate))?;

        let sample_rate = choose_sample_rate(best, preferred_rate);
        let supported = best.with_sample_rate(sample_rate);

        return Some((supported, best.channels(), format, sample_rate));
    }

    None
}

fn sample_rate_distance(range: cpal::SupportedStreamConfigRange, preferred_rate: u32) -> u32 {
    let min_rate = range.min_sample_rate();
    let max_rate = range.max_sample_rate();
    if preferred_rate < min_rate {
        min_rate.saturating_sub(preferred_rate)
    } else if preferred_rate > max_rate {
        preferred_rate.saturating_sub(max_rate)
    } else {
        0
    }
}

fn choose_sample_rate(range: cpal::SupportedStreamConfigRange, preferred_rate: u32) -> u32 {
    let min_rate = range.min_sample_rate();
    let max_rate = range.max_sample_rate();
    if preferred_rate < min_rate {
        min_rate
    } else if preferred_rate > max_rate {
        max_rate
    } else {
        preferred_rate
    }
}

/// Seam between the orchestrator and the capture hardware, so attempts can
/// be driven in tests without a microphone.
pub trait CaptureBackend: Send + Sync {
    /// Open a fresh capture session for one attempt.
    fn begin(&self, on_chunk: Option<ChunkCallback>) -> Result<Box<dyn ActiveCapture>>;
}

/// A running capture owned by one attempt
pub trait ActiveCapture: Send {
    /// Close the stream; returns the accumulated samples and elapsed time,
    /// or `None` if capture never started.
    fn finish(self: Box<Self>) -> Option<(Vec<f32>, Duration)>;

    /// Current input level for indicator UI
    fn level(&self) -> f32 {
        0.0
    }
}

impl ActiveCapture for AudioCaptureSession {
    fn finish(mut self: Box<Self>) -> Option<(Vec<f32>, Duration)> {
        self.stop()
    }

    fn level(&self) -> f32 {
        AudioCaptureSession::level(self)
    }
}

/// CPAL-backed capture factory used in production
pub struct CpalCaptureBackend {
    config: AudioCaptureConfig,
    permissions: Arc<PromptGate>,
}

impl CpalCaptureBackend {
    pub fn new(config: AudioCaptureConfig, permissions: Arc<PromptGate>) -> Self {
        Self { config, permissions }
    }
}

impl CaptureBackend for CpalCaptureBackend {
    fn begin(&self, on_chunk: Option<ChunkCallback>) -> Result<Box<dyn ActiveCapture>> {
        if !self.permissions.check_or_prompt(Capability::Microphone) {
            return Err(Error::Permission("microphone".to_string()));
        }

        let mut session = AudioCaptureSession::new(self.config.clone());
        if let Some(cb) = on_chunk {
            session = session.with_chunk_callback(cb);
        }
        session.start()?;
        Ok(Box::new(session))
    }
}
