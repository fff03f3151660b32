//! Contracts for the external demodulator/decoder and the neural vocoder.
//!
//! Both are opaque collaborators: this crate never assumes anything about
//! their internals, only the fixed call shape below. Real deployments bind
//! these traits to the native RADE receiver and FARGAN vocoder libraries;
//! tests drive the pipeline with scripted implementations.

use num_complex::Complex32;

/// Result of one decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutput {
    /// Number of feature values written, always a multiple of
    /// [`FEATURES_PER_FRAME`](crate::FEATURES_PER_FRAME). Zero is valid
    /// (no speech decoded this cycle) and is not an error.
    pub n_features: usize,
    /// End-of-over marker was detected; `eoo_bits_out` holds the payload.
    pub end_of_over: bool,
}

/// The external demodulation/decoding engine, one instance per session.
///
/// The engine dictates its own input pacing: [`nin`](Self::nin) is the
/// exact complex-sample count required for the next [`decode`](Self::decode)
/// call and may change from cycle to cycle, bounded by
/// [`nin_max`](Self::nin_max).
pub trait DecodeEngine: Send {
    /// Largest chunk [`nin`](Self::nin) can ever request.
    fn nin_max(&self) -> usize;
    /// Exact input chunk size required this cycle.
    fn nin(&self) -> usize;
    /// Capacity required of the `features_out` buffer.
    fn n_features_out(&self) -> usize;
    /// Capacity required of the `eoo_bits_out` buffer.
    fn n_eoo_bits(&self) -> usize;

    /// Feed exactly [`nin`](Self::nin) analytic samples; receive decoded
    /// feature frames and, possibly, end-of-over bits.
    fn decode(
        &mut self,
        features_out: &mut [f32],
        eoo_bits_out: &mut [f32],
        samples_in: &[Complex32],
    ) -> DecodeOutput;

    /// Whether the demodulator is locked onto a valid transmission.
    fn is_synced(&self) -> bool;
    /// Live SNR estimate in dB. Only meaningful while synced; the real
    /// estimator keeps producing (noise) values when unsynced, so the
    /// pipeline samples this only under sync and holds the last reading.
    fn snr_db(&self) -> f32;
    /// Live frequency offset estimate in Hz. Same caveat as
    /// [`snr_db`](Self::snr_db).
    fn freq_offset_hz(&self) -> f32;
}

/// The external neural vocoder, one instance per session.
pub trait Vocoder: Send {
    /// Reinitialize internal state, discarding any synthesis history.
    fn reset(&mut self);

    /// Prime continuity before synthesis may begin.
    ///
    /// `history_pcm` is [`VOCODER_CONT_SAMPLES`](crate::VOCODER_CONT_SAMPLES)
    /// samples of prior audio (silence at warmup); `packed_features` is
    /// [`WARMUP_FRAMES`](crate::WARMUP_FRAMES) frames repacked to the
    /// [`VOCODER_FEATURE_STRIDE`](crate::VOCODER_FEATURE_STRIDE) stride.
    fn prime(&mut self, history_pcm: &[f32], packed_features: &[f32]);

    /// Synthesize one [`SPEECH_FRAME_SIZE`](crate::SPEECH_FRAME_SIZE)-sample
    /// PCM frame from one feature frame.
    fn synthesize(&mut self, pcm_out: &mut [f32], features: &[f32]);
}
