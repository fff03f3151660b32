//! # rade-rx
//!
//! Real-time receiver pipeline for RADE digital voice: capture (or a WAV
//! file) → Hilbert transform → RADE receiver → vocoder → playback, with
//! synchronization and quality telemetry published for a control surface.
//!
//! The heavy math lives outside this crate: the demodulator/decoder and the
//! neural vocoder are opaque collaborators behind the [`DecodeEngine`] and
//! [`Vocoder`] traits. This crate owns everything around them: signal
//! conditioning, spectrum estimation, the vocoder warmup state machine,
//! the audio backends with their format/rate reconciliation, and the
//! single worker thread that ties a decode cycle together.
//!
//! ## Quick start
//!
//! ```ignore
//! use rade_rx::RadeDecoder;
//!
//! let mut rx = RadeDecoder::new();
//! rx.open("", engine, vocoder)?;   // "" = default capture device
//! rx.start();
//! // ... poll rx.is_synced() / rx.snr_db() / rx.spectrum(..) from the UI ...
//! rx.stop();
//! rx.close();
//! ```
//!
//! ## Audio requirements
//!
//! - Modem input: 8 kHz mono f32 (backends resample from the device's
//!   native rate when the host does not).
//! - Decoded speech: 16 kHz mono f32, 160-sample frames.
//!
//! ## Thread safety
//!
//! One dedicated worker thread performs all DSP and blocking device I/O.
//! Status fields are single-writer atomics; the spectrum snapshot and the
//! recording sink are each guarded by their own mutex. See [`RadeDecoder`].

use thiserror::Error;

pub mod audio;
pub mod continuity;
pub mod engine;
pub mod hilbert;
mod ring;
pub mod spectrum;
pub mod wav;

mod decoder;

pub use audio::{
    enumerate_inputs, AudioCapture, AudioDevice, AudioPlayback, CpalCapture, CpalPlayback,
};
pub use continuity::{Continuity, Feed};
pub use decoder::{RadeDecoder, Source};
pub use engine::{DecodeEngine, DecodeOutput, Vocoder};
pub use hilbert::Hilbert;
pub use spectrum::SpectrumAnalyzer;
pub use wav::FileSource;

/// Modem sample rate: everything upstream of the decode engine runs here.
pub const MODEM_RATE: u32 = 8000;
/// Decoded speech sample rate produced by the vocoder.
pub const SPEECH_RATE: u32 = 16000;

/// Hilbert FIR length. Odd, fixed per build.
pub const HILBERT_TAPS: usize = 127;
/// Group delay of the Hilbert FIR, applied to the real leg as well.
pub const HILBERT_DELAY: usize = (HILBERT_TAPS - 1) / 2;

/// Spectrum FFT size (power of two).
pub const FFT_SIZE: usize = 512;
/// Published spectrum bins: the first half of the FFT.
pub const SPECTRUM_BINS: usize = FFT_SIZE / 2;

/// Length of one decoded feature vector.
pub const FEATURES_PER_FRAME: usize = 36;
/// Leading features per frame consumed by the vocoder continuity call.
pub const VOCODER_FEATURE_STRIDE: usize = 20;
/// Feature frames buffered before the vocoder may synthesize.
pub const WARMUP_FRAMES: usize = 5;
/// Silent-history seed length handed to the vocoder when priming.
pub const VOCODER_CONT_SAMPLES: usize = 320;
/// One synthesized PCM frame: 10 ms at 16 kHz.
pub const SPEECH_FRAME_SIZE: usize = 160;

/// Receiver pipeline errors.
///
/// All failures are local to the call that detected them; nothing here
/// aborts the process or retries. End-of-file is not an error: a drained
/// [`FileSource`] stops the session like a user-initiated stop.
#[derive(Error, Debug)]
pub enum RxError {
    /// Capture or playback endpoint could not be opened (missing device,
    /// busy device, unsupported format). The session stays fully closed.
    #[error("audio device error: {0}")]
    Device(String),
    /// A live capture/playback call failed mid-session.
    #[error("audio stream error: {0}")]
    Stream(String),
    /// Malformed or unsupported WAV container.
    #[error("WAV format error: {0}")]
    WavFormat(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RxError>;

// Compile-time check: everything handed to the worker must be Send.
fn _assert_send<T: Send>() {}
fn _assert_pipeline_parts_send() {
    _assert_send::<CpalCapture>();
    _assert_send::<CpalPlayback>();
    _assert_send::<FileSource>();
    _assert_send::<RadeDecoder>();
}
