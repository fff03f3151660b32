//! Cross-platform audio endpoints over cpal.
//!
//! The pipeline wants blocking pull/push at fixed rates (capture at 8 kHz,
//! playback at 16 kHz, both mono f32), while cpal delivers callback-driven
//! streams in whatever format and rate the device actually runs. Each
//! endpoint reconciles the two itself. The callback side downmixes to mono
//! (arithmetic mean) and hands native-rate samples to the worker through a
//! lock-free ring. The worker side runs a streaming linear-interpolation
//! resampler whose fractional phase carries across calls, so there are no
//! clicks at buffer boundaries.
//!
//! cpal streams are not `Send`, so each endpoint parks its stream on a
//! dedicated owner thread for the lifetime of the session; `close` signals
//! that thread and joins it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use crate::{Result, RxError};

/// How long `flush` waits for queued playback samples to be discarded.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// One enumerable capture endpoint.
///
/// `id` is the platform-stable handle used to reopen the device; treat it
/// as opaque. `description` is for display only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub id: String,
    pub description: String,
}

/// List capture devices with at least one input channel.
///
/// Enumeration problems degrade to an empty list (logged) rather than an
/// error; the control surface just shows no devices.
pub fn enumerate_inputs() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let devices = match host.input_devices() {
        Ok(d) => d,
        Err(e) => {
            log::warn!("input enumeration failed: {e}");
            return Vec::new();
        }
    };
    devices
        .filter_map(|dev| {
            let has_input = dev
                .supported_input_configs()
                .map(|mut cfgs| cfgs.any(|c| c.channels() >= 1))
                .unwrap_or(false);
            if !has_input {
                return None;
            }
            let name = dev.name().ok()?;
            Some(AudioDevice {
                id: name.clone(),
                description: name,
            })
        })
        .collect()
}

/// Blocking mono capture endpoint.
pub trait AudioCapture: Send {
    /// Open `device_id` (empty string = default device) delivering mono
    /// f32 at `sample_rate`. A failed open leaves the endpoint closed.
    fn open(&mut self, device_id: &str, sample_rate: u32, channels: u16) -> Result<()>;
    /// Fill `buf` completely, blocking until enough samples arrive or the
    /// stream fails.
    fn read(&mut self, buf: &mut [f32]) -> Result<()>;
    /// Idempotent.
    fn close(&mut self);
}

/// Blocking mono playback endpoint.
pub trait AudioPlayback: Send {
    fn open(&mut self, sample_rate: u32, channels: u16) -> Result<()>;
    /// Queue `buf` for playback, blocking while the device buffer is full.
    fn write(&mut self, buf: &[f32]) -> Result<()>;
    /// Discard queued samples (bounded wait).
    fn flush(&mut self);
    /// Idempotent.
    fn close(&mut self);
}

// ─────────────────────── streaming resampler ───────────────────────

/// Linear-interpolation resampler fed one input sample at a time.
///
/// Keeps its fractional read position and the previous input sample across
/// calls, so chunk boundaries are inaudible.
struct StreamResampler {
    /// Input samples per output sample.
    step: f64,
    /// Position of the next output between `prev` (0.0) and the incoming
    /// sample (1.0).
    t: f64,
    prev: f32,
    primed: bool,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate as f64,
            t: 0.0,
            prev: 0.0,
            primed: false,
        }
    }

    /// Feed one input sample; emit any due output samples.
    fn push(&mut self, sample: f32, out: &mut VecDeque<f32>) {
        if !self.primed {
            self.prev = sample;
            self.primed = true;
            return;
        }
        while self.t < 1.0 {
            out.push_back(self.prev + self.t as f32 * (sample - self.prev));
            self.t += self.step;
        }
        self.t -= 1.0;
        self.prev = sample;
    }
}

// ───────────────────────── stream owner ─────────────────────────

/// Holds a cpal stream alive on its own thread until told to stop.
struct StreamWorker {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl StreamWorker {
    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

// ─────────────────────────── capture ───────────────────────────

/// cpal-backed [`AudioCapture`].
pub struct CpalCapture {
    worker: Option<StreamWorker>,
    consumer: Option<HeapConsumer<f32>>,
    resampler: Option<StreamResampler>,
    pending: VecDeque<f32>,
    failed: Arc<AtomicBool>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self {
            worker: None,
            consumer: None,
            resampler: None,
            pending: VecDeque::new(),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCapture for CpalCapture {
    fn open(&mut self, device_id: &str, sample_rate: u32, channels: u16) -> Result<()> {
        self.close();
        if channels != 1 {
            return Err(RxError::Device("capture is mono only".into()));
        }

        let failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let id = device_id.to_string();
        let failed_cb = failed.clone();

        let join = thread::spawn(move || {
            let stream = match open_capture_stream(&id, sample_rate, failed_cb) {
                Ok((stream, consumer, native_rate)) => {
                    let _ = ready_tx.send(Ok((consumer, native_rate)));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // park until close(); dropping the stream stops capture
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok((consumer, native_rate))) => {
                log::info!(
                    "capture open: {} ({native_rate} Hz native -> {sample_rate} Hz)",
                    if device_id.is_empty() { "(default)" } else { device_id },
                );
                self.consumer = Some(consumer);
                self.resampler = Some(StreamResampler::new(native_rate, sample_rate));
                self.failed = failed;
                self.worker = Some(StreamWorker {
                    shutdown: shutdown_tx,
                    join: Some(join),
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(RxError::Device("capture stream thread died".into()))
            }
        }
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<()> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| RxError::Stream("capture not open".into()))?;
        let resampler = self.resampler.as_mut().expect("paired with consumer");

        let mut filled = 0;
        let mut staging = [0.0f32; 256];
        while filled < buf.len() {
            while filled < buf.len() {
                match self.pending.pop_front() {
                    Some(s) => {
                        buf[filled] = s;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if filled == buf.len() {
                break;
            }
            if self.failed.load(Ordering::Relaxed) {
                return Err(RxError::Stream("capture stream failed".into()));
            }
            let n = consumer.pop_slice(&mut staging);
            if n == 0 {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            for &s in &staging[..n] {
                resampler.push(s, &mut self.pending);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
        self.consumer = None;
        self.resampler = None;
        self.pending.clear();
        self.failed.store(false, Ordering::Relaxed);
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs on the stream-owner thread: resolve the device, pick the closest
/// native config, and start the input stream.
fn open_capture_stream(
    device_id: &str,
    target_rate: u32,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, HeapConsumer<f32>, u32)> {
    let host = cpal::default_host();
    let device = if device_id.is_empty() {
        host.default_input_device()
            .ok_or_else(|| RxError::Device("no default input device".into()))?
    } else {
        let mut found = None;
        let devices = host
            .input_devices()
            .map_err(|e| RxError::Device(format!("input enumeration failed: {e}")))?;
        for dev in devices {
            if dev.name().map(|n| n == device_id).unwrap_or(false) {
                found = Some(dev);
                break;
            }
        }
        found.ok_or_else(|| RxError::Device(format!("capture device not found: {device_id}")))?
    };

    let config = choose_input_config(&device, target_rate)?;
    let native_rate = config.sample_rate().0;
    let native_channels = config.channels() as usize;

    let rb = HeapRb::<f32>::new(native_rate as usize * 2);
    let (producer, consumer) = rb.split();

    let stream_config: cpal::StreamConfig = config.clone().into();
    let build = match config.sample_format() {
        cpal::SampleFormat::F32 => build_capture_stream::<f32>,
        cpal::SampleFormat::I16 => build_capture_stream::<i16>,
        cpal::SampleFormat::U16 => build_capture_stream::<u16>,
        other => {
            return Err(RxError::Device(format!(
                "unsupported capture sample format: {other:?}"
            )))
        }
    };
    let stream = build(&device, &stream_config, native_channels, producer, failed)?;
    stream
        .play()
        .map_err(|e| RxError::Device(format!("capture start failed: {e}")))?;
    Ok((stream, consumer, native_rate))
}

/// Prefer the requested rate and f32; otherwise the nearest supported.
fn choose_input_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| RxError::Device(format!("no input configs: {e}")))?;

    let mut best: Option<cpal::SupportedStreamConfig> = None;
    let mut best_score = i32::MIN;
    for range in ranges {
        let min = range.min_sample_rate().0;
        let max = range.max_sample_rate().0;
        let rate = target_rate.clamp(min, max);
        let cfg = range.with_sample_rate(cpal::SampleRate(rate));

        let mut score = 0;
        if cfg.sample_rate().0 == target_rate {
            score += 2;
        }
        if cfg.sample_format() == cpal::SampleFormat::F32 {
            score += 1;
        }
        if score > best_score {
            best_score = score;
            best = Some(cfg);
        }
    }
    best.ok_or_else(|| RxError::Device("no supported input config".into()))
}

fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut producer: HeapProducer<f32>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: Sample + SizedSample,
    f32: FromSample<T>,
{
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                for frame in data.chunks(channels) {
                    let mut sum = 0.0f32;
                    for &s in frame {
                        sum += s.to_sample::<f32>();
                    }
                    // overflow drops samples; the worker is behind anyway
                    let _ = producer.push(sum / channels as f32);
                }
            },
            move |err| {
                log::error!("capture stream error: {err}");
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| RxError::Device(format!("capture stream build failed: {e}")))?;
    Ok(stream)
}

// ─────────────────────────── playback ───────────────────────────

/// cpal-backed [`AudioPlayback`].
pub struct CpalPlayback {
    worker: Option<StreamWorker>,
    producer: Option<HeapProducer<f32>>,
    resampler: Option<StreamResampler>,
    queue: VecDeque<f32>,
    failed: Arc<AtomicBool>,
    clear: Arc<AtomicBool>,
}

impl CpalPlayback {
    pub fn new() -> Self {
        Self {
            worker: None,
            producer: None,
            resampler: None,
            queue: VecDeque::new(),
            failed: Arc::new(AtomicBool::new(false)),
            clear: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for CpalPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlayback for CpalPlayback {
    fn open(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        self.close();
        if channels != 1 {
            return Err(RxError::Device("playback is mono only".into()));
        }

        let failed = Arc::new(AtomicBool::new(false));
        let clear = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let failed_cb = failed.clone();
        let clear_cb = clear.clone();

        let join = thread::spawn(move || {
            let stream = match open_playback_stream(failed_cb, clear_cb) {
                Ok((stream, producer, native_rate)) => {
                    let _ = ready_tx.send(Ok((producer, native_rate)));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok((producer, native_rate))) => {
                log::info!("playback open: {sample_rate} Hz -> {native_rate} Hz native");
                self.producer = Some(producer);
                self.resampler = Some(StreamResampler::new(sample_rate, native_rate));
                self.failed = failed;
                self.clear = clear;
                self.worker = Some(StreamWorker {
                    shutdown: shutdown_tx,
                    join: Some(join),
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(RxError::Device("playback stream thread died".into()))
            }
        }
    }

    fn write(&mut self, buf: &[f32]) -> Result<()> {
        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| RxError::Stream("playback not open".into()))?;
        let resampler = self.resampler.as_mut().expect("paired with producer");

        for &s in buf {
            resampler.push(s, &mut self.queue);
        }
        while let Some(&s) = self.queue.front() {
            if self.failed.load(Ordering::Relaxed) {
                return Err(RxError::Stream("playback stream failed".into()));
            }
            if producer.push(s).is_ok() {
                self.queue.pop_front();
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.queue.clear();
        let Some(producer) = self.producer.as_ref() else {
            return;
        };
        self.clear.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while producer.len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn close(&mut self) {
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
        self.producer = None;
        self.resampler = None;
        self.queue.clear();
        self.failed.store(false, Ordering::Relaxed);
        self.clear.store(false, Ordering::Relaxed);
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_playback_stream(
    failed: Arc<AtomicBool>,
    clear: Arc<AtomicBool>,
) -> Result<(cpal::Stream, HeapProducer<f32>, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| RxError::Device("no default output device".into()))?;
    let config = device
        .default_output_config()
        .map_err(|e| RxError::Device(format!("no output config: {e}")))?;

    let native_rate = config.sample_rate().0;
    let native_channels = config.channels() as usize;

    let rb = HeapRb::<f32>::new(native_rate as usize * 2);
    let (producer, consumer) = rb.split();

    let stream_config: cpal::StreamConfig = config.clone().into();
    let build = match config.sample_format() {
        cpal::SampleFormat::F32 => build_playback_stream::<f32>,
        cpal::SampleFormat::I16 => build_playback_stream::<i16>,
        cpal::SampleFormat::U16 => build_playback_stream::<u16>,
        other => {
            return Err(RxError::Device(format!(
                "unsupported playback sample format: {other:?}"
            )))
        }
    };
    let stream = build(&device, &stream_config, native_channels, consumer, failed, clear)?;
    stream
        .play()
        .map_err(|e| RxError::Device(format!("playback start failed: {e}")))?;
    Ok((stream, producer, native_rate))
}

fn build_playback_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut consumer: HeapConsumer<f32>,
    failed: Arc<AtomicBool>,
    clear: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: Sample + SizedSample + FromSample<f32>,
{
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if clear.swap(false, Ordering::Relaxed) {
                    while consumer.pop().is_some() {}
                }
                for frame in data.chunks_mut(channels) {
                    // underrun plays silence
                    let s = consumer.pop().unwrap_or(0.0);
                    for d in frame.iter_mut() {
                        *d = T::from_sample(s);
                    }
                }
            },
            move |err| {
                log::error!("playback stream error: {err}");
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| RxError::Device(format!("playback stream build failed: {e}")))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(out: &mut VecDeque<f32>) -> Vec<f32> {
        out.drain(..).collect()
    }

    #[test]
    fn resampler_unity_ratio_passes_through() {
        let mut rs = StreamResampler::new(8000, 8000);
        let mut out = VecDeque::new();
        for s in [1.0f32, 2.0, 3.0, 4.0] {
            rs.push(s, &mut out);
        }
        // one sample of latency, then 1:1
        assert_eq!(drain(&mut out), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn resampler_downsample_length() {
        let mut rs = StreamResampler::new(48000, 8000);
        let mut out = VecDeque::new();
        for i in 0..48000 {
            rs.push(i as f32, &mut out);
        }
        let n = out.len() as i64;
        assert!((n - 8000).abs() <= 1, "got {n} samples");
    }

    #[test]
    fn resampler_upsample_length() {
        let mut rs = StreamResampler::new(16000, 48000);
        let mut out = VecDeque::new();
        for i in 0..16000 {
            rs.push(i as f32, &mut out);
        }
        let n = out.len() as i64;
        assert!((n - 48000).abs() <= 3, "got {n} samples");
    }

    #[test]
    fn resampler_phase_continuous_across_chunks() {
        // identical input split differently must give identical output
        let input: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.1).sin()).collect();

        let mut one = VecDeque::new();
        let mut rs = StreamResampler::new(44100, 8000);
        for &s in &input {
            rs.push(s, &mut one);
        }

        let mut two = VecDeque::new();
        let mut rs = StreamResampler::new(44100, 8000);
        for chunk in input.chunks(37) {
            for &s in chunk {
                rs.push(s, &mut two);
            }
        }
        assert_eq!(drain(&mut one), drain(&mut two));
    }

    #[test]
    fn resampler_interpolates_ramp() {
        let mut rs = StreamResampler::new(8000, 16000);
        let mut out = VecDeque::new();
        for s in [0.0f32, 1.0, 2.0, 3.0] {
            rs.push(s, &mut out);
        }
        let got = drain(&mut out);
        for (i, &v) in got.iter().enumerate() {
            assert!((v - i as f32 * 0.5).abs() < 1e-6, "sample {i}: {v}");
        }
    }

    #[test]
    fn enumerate_does_not_panic() {
        // machines without audio hardware return an empty list
        let _ = enumerate_inputs();
    }

    #[test]
    fn open_missing_device_fails_closed() {
        let mut cap = CpalCapture::new();
        let err = cap.open("definitely-not-a-real-device-9a7f", 8000, 1);
        assert!(err.is_err());
        // read on a closed endpoint errors instead of blocking
        let mut buf = [0.0f32; 4];
        assert!(cap.read(&mut buf).is_err());
        cap.close();
        cap.close();
    }
}
