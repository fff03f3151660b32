//! Fixed-capacity sample ring used by the Hilbert stage.
//!
//! Wraparound lives here so the filter code stays free of index arithmetic.
//! Zero heap allocation after construction.

/// Circular buffer of `f32` with a write cursor.
///
/// Starts zero-filled, which doubles as the filter's silent history.
pub(crate) struct Ring {
    buf: Vec<f32>,
    pos: usize,
}

impl Ring {
    pub fn new(len: usize) -> Self {
        debug_assert!(len > 0);
        Self {
            buf: vec![0.0; len],
            pos: 0,
        }
    }

    /// Append one sample, overwriting the oldest.
    pub fn push(&mut self, sample: f32) {
        self.buf[self.pos] = sample;
        self.pos = (self.pos + 1) % self.buf.len();
    }

    /// Sample written `back` pushes ago. `tap(0)` is the most recent.
    ///
    /// `back` must be less than the ring length.
    pub fn tap(&self, back: usize) -> f32 {
        debug_assert!(back < self.buf.len());
        let len = self.buf.len();
        // pos points one past the last write
        let idx = (self.pos + len - 1 - back) % len;
        self.buf[idx]
    }

    /// Zero the history and rewind the cursor.
    pub fn clear(&mut self) {
        self.buf.fill(0.0);
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_zero_is_last_push() {
        let mut r = Ring::new(4);
        r.push(1.0);
        r.push(2.0);
        assert_eq!(r.tap(0), 2.0);
        assert_eq!(r.tap(1), 1.0);
    }

    #[test]
    fn wraps_and_overwrites() {
        let mut r = Ring::new(3);
        for s in 1..=5 {
            r.push(s as f32);
        }
        assert_eq!(r.tap(0), 5.0);
        assert_eq!(r.tap(1), 4.0);
        assert_eq!(r.tap(2), 3.0);
    }

    #[test]
    fn starts_silent() {
        let r = Ring::new(8);
        for back in 0..8 {
            assert_eq!(r.tap(back), 0.0);
        }
    }

    #[test]
    fn clear_resets_history() {
        let mut r = Ring::new(3);
        r.push(1.0);
        r.push(2.0);
        r.clear();
        assert_eq!(r.tap(0), 0.0);
        assert_eq!(r.tap(2), 0.0);
    }
}
