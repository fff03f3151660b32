//! Vocoder warmup/continuity state machine.
//!
//! A stateful neural vocoder asked to synthesize from an incoherent history
//! produces garbage, so the first [`WARMUP_FRAMES`] feature frames after
//! (re)synchronization are buffered instead of synthesized. Completing the
//! buffer primes the vocoder once with that history plus a silent PCM seed;
//! only then does per-frame synthesis start. Any loss of sync throws the
//! machine back to warmup.

use crate::engine::Vocoder;
use crate::{
    FEATURES_PER_FRAME, SPEECH_FRAME_SIZE, VOCODER_CONT_SAMPLES, VOCODER_FEATURE_STRIDE,
    WARMUP_FRAMES,
};

/// Outcome of feeding one feature frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Frame buffered for warmup; no audio produced.
    Buffering,
    /// This frame completed warmup and the vocoder was primed; no audio
    /// produced. Emitted exactly once per warmup completion; the caller
    /// should pre-fill the playback sink with silence on it.
    Primed,
    /// `pcm_out` holds one synthesized speech frame.
    Audio,
}

/// WARMUP → READY gate in front of the vocoder.
pub struct Continuity {
    warmup: Vec<f32>,
    count: usize,
    ready: bool,
}

impl Continuity {
    pub fn new() -> Self {
        Self {
            warmup: vec![0.0; WARMUP_FRAMES * FEATURES_PER_FRAME],
            count: 0,
            ready: false,
        }
    }

    /// Whether synthesis is active (warmup complete, sync not lost since).
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Frames accumulated toward warmup. Saturates at [`WARMUP_FRAMES`].
    pub fn warmup_count(&self) -> usize {
        self.count
    }

    /// Feed one decoded feature frame.
    ///
    /// `features` must hold at least [`FEATURES_PER_FRAME`] values and
    /// `pcm_out` at least [`SPEECH_FRAME_SIZE`] samples; `pcm_out` is only
    /// written when the result is [`Feed::Audio`].
    pub fn feed(
        &mut self,
        vocoder: &mut dyn Vocoder,
        features: &[f32],
        pcm_out: &mut [f32],
    ) -> Feed {
        debug_assert!(features.len() >= FEATURES_PER_FRAME);
        debug_assert!(pcm_out.len() >= SPEECH_FRAME_SIZE);

        if self.ready {
            vocoder.synthesize(&mut pcm_out[..SPEECH_FRAME_SIZE], features);
            return Feed::Audio;
        }

        let off = self.count * FEATURES_PER_FRAME;
        self.warmup[off..off + FEATURES_PER_FRAME]
            .copy_from_slice(&features[..FEATURES_PER_FRAME]);
        self.count += 1;

        if self.count < WARMUP_FRAMES {
            return Feed::Buffering;
        }

        // repack to the stride the continuity call expects
        let mut packed = [0.0f32; WARMUP_FRAMES * VOCODER_FEATURE_STRIDE];
        for i in 0..WARMUP_FRAMES {
            let src = i * FEATURES_PER_FRAME;
            let dst = i * VOCODER_FEATURE_STRIDE;
            packed[dst..dst + VOCODER_FEATURE_STRIDE]
                .copy_from_slice(&self.warmup[src..src + VOCODER_FEATURE_STRIDE]);
        }
        let silence = [0.0f32; VOCODER_CONT_SAMPLES];
        vocoder.prime(&silence, &packed);
        self.ready = true;
        Feed::Primed
    }

    /// Sync was lost: reinitialize the vocoder and rearm warmup, so the
    /// next resynchronization repeats the full 5-frame warmup (including
    /// the playback pre-fill signalled by [`Feed::Primed`]).
    pub fn reset(&mut self, vocoder: &mut dyn Vocoder) {
        vocoder.reset();
        self.count = 0;
        self.ready = false;
    }
}

impl Default for Continuity {
    fn default() -> Self {
        Self::new()
    }
}
