//! Session lifecycle and the per-cycle worker loop.
//!
//! [`RadeDecoder`] is the crate's public entry point. It owns one optional
//! session (audio endpoints, engine, vocoder, DSP state) and one optional
//! worker thread. The worker is the single writer of all telemetry;
//! control-surface threads only read atomics or copy snapshots under short
//! locks, so no caller ever blocks on DSP.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use num_complex::Complex32;

use crate::audio::{AudioCapture, AudioPlayback, CpalCapture, CpalPlayback};
use crate::continuity::{Continuity, Feed};
use crate::engine::{DecodeEngine, Vocoder};
use crate::hilbert::Hilbert;
use crate::spectrum::SpectrumAnalyzer;
use crate::wav::FileSource;
use crate::{
    Result, FEATURES_PER_FRAME, FFT_SIZE, MODEM_RATE, SPECTRUM_BINS, SPEECH_FRAME_SIZE,
    SPEECH_RATE,
};

/// Samples per blocking capture read. Small enough to keep stop latency
/// low, large enough that the ring hand-off is not per-sample.
const READ_FRAMES: usize = 512;

/// Silence written to playback when warmup completes, before the first
/// synthesized frame. Covers the jitter between decode cycles so the
/// output stream never starves right after it starts.
const PREFILL_SAMPLES: usize = 2 * 12 * SPEECH_FRAME_SIZE;

/// Per-cycle decay applied to the published output level when a cycle
/// produces no audio, so meters fall instead of freezing.
const LEVEL_DECAY: f32 = 0.9;

/// Where modem samples come from.
pub enum Source {
    Live(Box<dyn AudioCapture>),
    File(FileSource),
}

/// Everything the worker needs for one session. Owned by the session
/// mutex; the worker holds that lock for the whole run.
struct Pipeline {
    source: Source,
    playback: Box<dyn AudioPlayback>,
    engine: Box<dyn DecodeEngine>,
    vocoder: Box<dyn Vocoder>,
    hilbert: Hilbert,
    analyzer: SpectrumAnalyzer,
    continuity: Continuity,
    /// Modem samples accumulated toward the engine's next `nin`.
    acc: Vec<f32>,
}

/// Telemetry and control flags shared between worker and callers.
///
/// f32 values travel as `to_bits`/`from_bits` through `AtomicU32`; the
/// worker is the only writer, so relaxed ordering is enough.
struct Shared {
    running: AtomicBool,
    synced: AtomicBool,
    recording: AtomicBool,
    snr_db: AtomicU32,
    freq_offset_hz: AtomicU32,
    input_level: AtomicU32,
    output_level: AtomicU32,
    input_gain: AtomicU32,
    spectrum: Mutex<[f32; SPECTRUM_BINS]>,
    rec_sink: Mutex<Option<BufWriter<File>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            snr_db: AtomicU32::new(0.0f32.to_bits()),
            freq_offset_hz: AtomicU32::new(0.0f32.to_bits()),
            input_level: AtomicU32::new(0.0f32.to_bits()),
            output_level: AtomicU32::new(0.0f32.to_bits()),
            input_gain: AtomicU32::new(1.0f32.to_bits()),
            spectrum: Mutex::new([0.0; SPECTRUM_BINS]),
            rec_sink: Mutex::new(None),
        }
    }

    fn load_f32(a: &AtomicU32) -> f32 {
        f32::from_bits(a.load(Ordering::Relaxed))
    }

    fn store_f32(a: &AtomicU32, v: f32) {
        a.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Clear telemetry back to idle values. Gain is a user setting and
    /// survives.
    fn reset_telemetry(&self) {
        self.synced.store(false, Ordering::Relaxed);
        Self::store_f32(&self.snr_db, 0.0);
        Self::store_f32(&self.freq_offset_hz, 0.0);
        Self::store_f32(&self.input_level, 0.0);
        Self::store_f32(&self.output_level, 0.0);
        *self.spectrum.lock().unwrap_or_else(PoisonError::into_inner) = [0.0; SPECTRUM_BINS];
    }
}

/// The receiver: open a source, start, poll telemetry, stop, close.
///
/// All methods are cheap except [`stop`](Self::stop), which joins the
/// worker (bounded by one blocking device read), and the `open_*` family,
/// which touch the audio hardware.
pub struct RadeDecoder {
    shared: Arc<Shared>,
    session: Arc<Mutex<Option<Pipeline>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl RadeDecoder {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            session: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Open a live session on `device_id` (empty = default capture device)
    /// with default playback. Any prior session is closed first.
    pub fn open(
        &mut self,
        device_id: &str,
        engine: Box<dyn DecodeEngine>,
        vocoder: Box<dyn Vocoder>,
    ) -> Result<()> {
        self.close();
        let mut capture = CpalCapture::new();
        capture.open(device_id, MODEM_RATE, 1)?;
        let mut playback = CpalPlayback::new();
        playback.open(SPEECH_RATE, 1)?;
        self.install(Source::Live(Box::new(capture)), Box::new(playback), engine, vocoder);
        Ok(())
    }

    /// Open a file-sourced session with default playback. The file is
    /// decoded and resampled up front; draining it stops the session as if
    /// the user had called [`stop`](Self::stop).
    pub fn open_file(
        &mut self,
        path: &Path,
        engine: Box<dyn DecodeEngine>,
        vocoder: Box<dyn Vocoder>,
    ) -> Result<()> {
        self.close();
        let source = FileSource::load(path)?;
        let mut playback = CpalPlayback::new();
        playback.open(SPEECH_RATE, 1)?;
        self.install(Source::File(source), Box::new(playback), engine, vocoder);
        Ok(())
    }

    /// Open with caller-supplied endpoints. `playback` must already be
    /// open. This is how headless and test deployments wire the pipeline.
    pub fn open_with(
        &mut self,
        source: Source,
        playback: Box<dyn AudioPlayback>,
        engine: Box<dyn DecodeEngine>,
        vocoder: Box<dyn Vocoder>,
    ) {
        self.close();
        self.install(source, playback, engine, vocoder);
    }

    fn install(
        &mut self,
        source: Source,
        playback: Box<dyn AudioPlayback>,
        engine: Box<dyn DecodeEngine>,
        vocoder: Box<dyn Vocoder>,
    ) {
        let acc = Vec::with_capacity(2 * engine.nin_max());
        let pipeline = Pipeline {
            source,
            playback,
            engine,
            vocoder,
            hilbert: Hilbert::new(),
            analyzer: SpectrumAnalyzer::new(),
            continuity: Continuity::new(),
            acc,
        };
        *self.lock_session() = Some(pipeline);
    }

    /// Tear down the session: stop the worker, end any recording, drop the
    /// endpoints, and reset telemetry. Idempotent.
    pub fn close(&mut self) {
        self.stop();
        self.stop_recording();
        if let Some(mut p) = self.lock_session().take() {
            p.playback.close();
            if let Source::Live(ref mut cap) = p.source {
                cap.close();
            }
        }
        self.shared.reset_telemetry();
    }

    /// Start the worker. No-op when already running or nothing is open.
    pub fn start(&mut self) {
        if self.shared.running.load(Ordering::Relaxed) {
            return;
        }
        if self.lock_session().is_none() {
            return;
        }
        // reap a worker that stopped on its own (file drained, device lost)
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }

        self.shared.running.store(true, Ordering::Relaxed);
        let shared = self.shared.clone();
        let session = self.session.clone();
        self.worker = Some(thread::spawn(move || {
            let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pipeline) = guard.as_mut() {
                run_loop(&shared, pipeline);
            }
            shared.running.store(false, Ordering::Relaxed);
            shared.synced.store(false, Ordering::Relaxed);
        }));
        log::info!("receiver started");
    }

    /// Stop the worker and discard queued playback. Level meters drop to
    /// zero. Idempotent; safe to call whether or not the worker already
    /// stopped on its own.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.worker.take() {
            let _ = h.join();
            log::info!("receiver stopped");
        }
        if let Some(p) = self.lock_session().as_mut() {
            p.playback.flush();
        }
        self.shared.synced.store(false, Ordering::Relaxed);
        Shared::store_f32(&self.shared.input_level, 0.0);
        Shared::store_f32(&self.shared.output_level, 0.0);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Relaxed)
    }

    /// Last SNR estimate in dB. Stale while unsynced; gate on
    /// [`is_synced`](Self::is_synced) before displaying.
    pub fn snr_db(&self) -> f32 {
        Shared::load_f32(&self.shared.snr_db)
    }

    /// Last frequency-offset estimate in Hz. Same staleness as
    /// [`snr_db`](Self::snr_db).
    pub fn freq_offset_hz(&self) -> f32 {
        Shared::load_f32(&self.shared.freq_offset_hz)
    }

    /// RMS of the conditioned modem input, updated every decode cycle.
    pub fn input_level(&self) -> f32 {
        Shared::load_f32(&self.shared.input_level)
    }

    /// RMS of the synthesized speech, decayed on silent cycles.
    pub fn output_level(&self) -> f32 {
        Shared::load_f32(&self.shared.output_level)
    }

    /// Linear gain applied to modem input ahead of everything except the
    /// recording tap. Takes effect on the next cycle.
    pub fn set_input_gain(&self, gain: f32) {
        Shared::store_f32(&self.shared.input_gain, gain);
    }

    pub fn input_gain(&self) -> f32 {
        Shared::load_f32(&self.shared.input_gain)
    }

    /// Copy the latest spectrum snapshot (dB per bin) into `out`.
    pub fn spectrum(&self, out: &mut [f32; SPECTRUM_BINS]) {
        *out = *self
            .shared
            .spectrum
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn spectrum_bins(&self) -> usize {
        SPECTRUM_BINS
    }

    /// Rate the spectrum was computed at; bins span 0 to half this.
    pub fn spectrum_sample_rate(&self) -> f32 {
        MODEM_RATE as f32
    }

    /// Tap the raw (pre-gain) modem input to `path` as headerless 16-bit
    /// little-endian PCM at [`MODEM_RATE`]. Ignored while a recording is
    /// already in progress; call [`stop_recording`](Self::stop_recording)
    /// first to switch files.
    pub fn start_recording(&self, path: &Path) -> Result<()> {
        if self.shared.recording.load(Ordering::Relaxed) {
            return Ok(());
        }
        let file = File::create(path)?;
        *self
            .shared
            .rec_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(BufWriter::new(file));
        self.shared.recording.store(true, Ordering::Relaxed);
        log::info!("recording to {}", path.display());
        Ok(())
    }

    /// Flush and close the recording sink. Idempotent.
    pub fn stop_recording(&self) {
        self.shared.recording.store(false, Ordering::Relaxed);
        let mut sink = self
            .shared
            .rec_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(mut w) = sink.take() {
            if let Err(e) = w.flush() {
                log::error!("recording flush failed: {e}");
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Relaxed)
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Pipeline>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RadeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RadeDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

// ───────────────────────── worker loop ─────────────────────────

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// One decode cycle per iteration, until stopped, drained, or failed.
fn run_loop(shared: &Shared, p: &mut Pipeline) {
    let nin_max = p.engine.nin_max();
    let mut iq = vec![Complex32::new(0.0, 0.0); nin_max];
    let mut features = vec![0.0f32; p.engine.n_features_out()];
    let mut eoo_bits = vec![0.0f32; p.engine.n_eoo_bits()];
    let mut pcm = [0.0f32; SPEECH_FRAME_SIZE];
    let mut spectrum = [0.0f32; SPECTRUM_BINS];
    let mut spec_hist: Vec<f32> = Vec::with_capacity(FFT_SIZE + nin_max);
    let mut read_buf = [0.0f32; READ_FRAMES];
    let mut chunk: Vec<f32> = Vec::with_capacity(nin_max + READ_FRAMES);
    let mut was_synced = false;

    while shared.running.load(Ordering::Relaxed) {
        let nin = p.engine.nin();
        debug_assert!(nin <= nin_max);

        // gather exactly nin modem samples
        while p.acc.len() < nin {
            if !shared.running.load(Ordering::Relaxed) {
                return;
            }
            match p.source {
                Source::File(ref mut src) => {
                    let got = src.take(nin - p.acc.len());
                    if got.is_empty() {
                        log::info!("input file drained");
                        return;
                    }
                    p.acc.extend_from_slice(got);
                }
                Source::Live(ref mut cap) => {
                    if let Err(e) = cap.read(&mut read_buf) {
                        log::error!("capture read failed: {e}");
                        return;
                    }
                    p.acc.extend_from_slice(&read_buf);
                }
            }
        }
        chunk.clear();
        chunk.extend(p.acc.drain(..nin));

        // recording taps the input before gain
        if shared.recording.load(Ordering::Relaxed) {
            write_recording(shared, &chunk);
        }

        let gain = Shared::load_f32(&shared.input_gain);
        if gain != 1.0 {
            for s in chunk.iter_mut() {
                *s *= gain;
            }
        }

        // spectrum runs over the most recent FFT window of gained input
        spec_hist.extend_from_slice(&chunk);
        if spec_hist.len() > FFT_SIZE {
            spec_hist.drain(..spec_hist.len() - FFT_SIZE);
        }
        if p.analyzer.process(&spec_hist, &mut spectrum) {
            *shared
                .spectrum
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = spectrum;
        }

        Shared::store_f32(&shared.input_level, rms(&chunk));

        p.hilbert.process(&chunk, &mut iq[..nin]);
        let out = p.engine.decode(&mut features, &mut eoo_bits, &iq[..nin]);

        let synced = p.engine.is_synced();
        shared.synced.store(synced, Ordering::Relaxed);
        // the estimators emit live noise while unsynced; sample them only
        // under sync and let the published values go stale otherwise
        if synced {
            Shared::store_f32(&shared.snr_db, p.engine.snr_db());
            Shared::store_f32(&shared.freq_offset_hz, p.engine.freq_offset_hz());
        }

        if was_synced && !synced {
            log::debug!("sync lost, rearming vocoder warmup");
            p.continuity.reset(p.vocoder.as_mut());
        }
        was_synced = synced;

        if out.end_of_over {
            // payload is received but not interpreted here
            log::debug!("end-of-over marker ({} bits)", eoo_bits.len());
        }

        if out.n_features == 0 {
            let decayed = Shared::load_f32(&shared.output_level) * LEVEL_DECAY;
            Shared::store_f32(&shared.output_level, decayed);
            continue;
        }

        debug_assert_eq!(out.n_features % FEATURES_PER_FRAME, 0);
        // one RMS over everything synthesized this cycle, not per frame
        let mut out_sum_sq = 0.0f32;
        let mut out_samples = 0usize;
        for frame in features[..out.n_features].chunks_exact(FEATURES_PER_FRAME) {
            match p.continuity.feed(p.vocoder.as_mut(), frame, &mut pcm) {
                Feed::Buffering => {}
                Feed::Primed => {
                    let silence = vec![0.0f32; PREFILL_SAMPLES];
                    if let Err(e) = p.playback.write(&silence) {
                        log::error!("playback write failed: {e}");
                        return;
                    }
                }
                Feed::Audio => {
                    if let Err(e) = p.playback.write(&pcm) {
                        log::error!("playback write failed: {e}");
                        return;
                    }
                    out_sum_sq += pcm.iter().map(|s| s * s).sum::<f32>();
                    out_samples += pcm.len();
                }
            }
        }
        if out_samples > 0 {
            let level = (out_sum_sq / out_samples as f32).sqrt();
            Shared::store_f32(&shared.output_level, level);
        }
    }
}

/// Append one chunk as 16-bit little-endian PCM. A write failure ends the
/// recording, not the session.
fn write_recording(shared: &Shared, chunk: &[f32]) {
    let mut sink = shared
        .rec_sink
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let Some(w) = sink.as_mut() else {
        return;
    };
    let mut bytes = Vec::with_capacity(chunk.len() * 2);
    for &s in chunk {
        let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    if let Err(e) = w.write_all(&bytes) {
        log::error!("recording write failed: {e}");
        *sink = None;
        shared.recording.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn defaults_before_open() {
        let rx = RadeDecoder::new();
        assert!(!rx.is_running());
        assert!(!rx.is_synced());
        assert_eq!(rx.snr_db(), 0.0);
        assert_eq!(rx.input_gain(), 1.0);
        assert!(!rx.is_recording());
        let mut spec = [1.0f32; SPECTRUM_BINS];
        rx.spectrum(&mut spec);
        assert!(spec.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn start_recording_is_first_wins() {
        let first = std::env::temp_dir().join("rade_rx_rec_first.raw");
        let second = std::env::temp_dir().join("rade_rx_rec_second.raw");
        let _ = std::fs::remove_file(&first);
        let _ = std::fs::remove_file(&second);

        let rx = RadeDecoder::new();
        rx.start_recording(&first).unwrap();
        assert!(rx.is_recording());
        // ignored while the first recording is still open
        rx.start_recording(&second).unwrap();
        assert!(first.exists());
        assert!(!second.exists());

        rx.stop_recording();
        rx.start_recording(&second).unwrap();
        assert!(second.exists());
        rx.stop_recording();
        let _ = std::fs::remove_file(&first);
        let _ = std::fs::remove_file(&second);
    }

    #[test]
    fn start_without_session_is_noop() {
        let mut rx = RadeDecoder::new();
        rx.start();
        assert!(!rx.is_running());
        rx.stop();
        rx.close();
        rx.close();
    }
}
