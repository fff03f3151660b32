//! WAV ingestion for file-sourced sessions.
//!
//! Parses the RIFF container directly so every encoding the field produces
//! is covered: 16/24/32-bit integer and 32/64-bit float, any channel count
//! (downmixed to mono by arithmetic mean), any rate (batch-resampled to the
//! modem rate before playback starts). The whole file is decoded up front;
//! streaming would buy nothing at these durations.

use std::path::Path;

use crate::{Result, RxError, MODEM_RATE};

const FMT_PCM: u16 = 1;
const FMT_IEEE_FLOAT: u16 = 3;

/// `fmt ` chunk fields relevant to decoding.
#[derive(Debug, Clone, Copy)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub is_float: bool,
}

/// Decode a WAV byte stream to mono f32 at its native rate.
pub fn decode_wav(bytes: &[u8]) -> Result<(WavInfo, Vec<f32>)> {
    let (info, data) = parse_container(bytes)?;
    let samples = decode_samples(&info, data)?;
    Ok((info, samples))
}

/// Load a WAV file, downmix to mono, and resample to `target_rate`.
pub fn read_wav_mono(path: &Path, target_rate: u32) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)?;
    let (info, mono) = decode_wav(&bytes)?;
    if mono.is_empty() {
        return Err(RxError::WavFormat("empty data chunk".into()));
    }
    if info.sample_rate == target_rate {
        Ok(mono)
    } else {
        Ok(resample(&mono, info.sample_rate, target_rate))
    }
}

fn parse_container(bytes: &[u8]) -> Result<(WavInfo, &[u8])> {
    let bad = |m: &str| RxError::WavFormat(m.into());

    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(bad("missing RIFF/WAVE markers"));
    }

    let mut info: Option<WavInfo> = None;
    let mut pos = 12usize;

    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body = pos + 8;
        if body + size > bytes.len() {
            break;
        }

        if id == b"fmt " {
            if size < 16 {
                return Err(bad("fmt chunk too short"));
            }
            let fmt = &bytes[body..body + 16];
            let audio_fmt = u16::from_le_bytes([fmt[0], fmt[1]]);
            let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
            let sample_rate = u32::from_le_bytes(fmt[4..8].try_into().unwrap());
            let bits = u16::from_le_bytes([fmt[14], fmt[15]]);
            if audio_fmt != FMT_PCM && audio_fmt != FMT_IEEE_FLOAT {
                return Err(bad("unsupported format tag"));
            }
            if channels == 0 {
                return Err(bad("zero channels"));
            }
            info = Some(WavInfo {
                sample_rate,
                channels,
                bits_per_sample: bits,
                is_float: audio_fmt == FMT_IEEE_FLOAT,
            });
        } else if id == b"data" {
            let info = info.ok_or_else(|| bad("data chunk before fmt"))?;
            return Ok((info, &bytes[body..body + size]));
        }

        // chunks are padded to even byte boundaries
        pos = body + size + (size & 1);
    }

    Err(bad("missing data chunk"))
}

fn decode_samples(info: &WavInfo, data: &[u8]) -> Result<Vec<f32>> {
    let bytes_per = (info.bits_per_sample / 8) as usize;
    if bytes_per == 0 {
        return Err(RxError::WavFormat("zero bits per sample".into()));
    }
    let nch = info.channels as usize;
    let frames = data.len() / (bytes_per * nch);
    let mut mono = Vec::with_capacity(frames);

    let read = |off: usize| -> Result<f32> {
        let b = &data[off..off + bytes_per];
        let v = match (info.is_float, info.bits_per_sample) {
            (true, 32) => f32::from_le_bytes(b.try_into().unwrap()),
            (true, 64) => f64::from_le_bytes(b.try_into().unwrap()) as f32,
            (false, 16) => {
                i16::from_le_bytes(b.try_into().unwrap()) as f32 / 32768.0
            }
            (false, 24) => {
                let mut raw =
                    (b[2] as i32) << 16 | (b[1] as i32) << 8 | b[0] as i32;
                if raw & 0x80_0000 != 0 {
                    raw |= !0xFF_FFFF;
                }
                raw as f32 / 8_388_608.0
            }
            (false, 32) => {
                i32::from_le_bytes(b.try_into().unwrap()) as f32 / 2_147_483_648.0
            }
            _ => {
                return Err(RxError::WavFormat(format!(
                    "unsupported encoding: {} bits, float={}",
                    info.bits_per_sample, info.is_float
                )))
            }
        };
        Ok(v)
    };

    for f in 0..frames {
        let mut sum = 0.0f32;
        for ch in 0..nch {
            sum += read((f * nch + ch) * bytes_per)?;
        }
        mono.push(sum / nch as f32);
    }
    Ok(mono)
}

/// One-shot linear-interpolation resample of a whole buffer.
///
/// Output length is `floor(len * to / from)`; the final stretch clamps to
/// the last input sample.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    if input.len() < 2 {
        return Vec::new();
    }

    let n_out = (input.len() as f64 * to_rate as f64 / from_rate as f64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(n_out);
    for i in 0..n_out {
        let pos = i as f64 * step;
        let mut idx = pos as usize;
        let mut frac = (pos - idx as f64) as f32;
        if idx + 1 >= input.len() {
            idx = input.len() - 2;
            frac = 1.0;
        }
        out.push(input[idx] + frac * (input[idx + 1] - input[idx]));
    }
    out
}

/// Fully preloaded mono 8 kHz stream used in place of live capture.
///
/// Immutable after load; running off the end stops the session gracefully
/// rather than erroring.
pub struct FileSource {
    samples: Vec<f32>,
    pos: usize,
}

impl FileSource {
    /// Parse, downmix, and resample `path` to the modem rate.
    pub fn load(path: &Path) -> Result<Self> {
        let samples = read_wav_mono(path, MODEM_RATE)?;
        if samples.is_empty() {
            return Err(RxError::WavFormat("no usable samples after resample".into()));
        }
        log::info!(
            "loaded {} ({} samples at {} Hz)",
            path.display(),
            samples.len(),
            MODEM_RATE
        );
        Ok(Self { samples, pos: 0 })
    }

    /// Build directly from preloaded modem-rate samples.
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self { samples, pos: 0 }
    }

    /// Next up-to-`max` samples, advancing the cursor. Empty when drained.
    pub fn take(&mut self, max: usize) -> &[f32] {
        let start = self.pos;
        let end = (self.pos + max).min(self.samples.len());
        self.pos = end;
        &self.samples[start..end]
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.samples.len()
    }

    pub fn remaining(&self) -> usize {
        self.samples.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-build a WAV byte stream, with an optional junk chunk before
    /// `fmt ` to exercise chunk skipping.
    fn build_wav(
        fmt_tag: u16,
        channels: u16,
        rate: u32,
        bits: u16,
        data: &[u8],
        junk: bool,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&0u32.to_le_bytes()); // patched below
        out.extend_from_slice(b"WAVE");

        if junk {
            // odd-sized chunk, must be skipped with pad byte
            out.extend_from_slice(b"LIST");
            out.extend_from_slice(&3u32.to_le_bytes());
            out.extend_from_slice(&[1, 2, 3, 0]);
        }

        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&fmt_tag.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        let block = channels as u32 * bits as u32 / 8;
        out.extend_from_slice(&(rate * block).to_le_bytes());
        out.extend_from_slice(&(block as u16).to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());

        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);

        let riff = (out.len() - 8) as u32;
        out[4..8].copy_from_slice(&riff.to_le_bytes());
        out
    }

    #[test]
    fn decodes_16_bit_pcm() {
        let vals: [i16; 4] = [0, 16384, -16384, 32767];
        let mut data = Vec::new();
        for v in vals {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let wav = build_wav(FMT_PCM, 1, 8000, 16, &data, false);
        let (info, mono) = decode_wav(&wav).unwrap();
        assert_eq!(info.sample_rate, 8000);
        assert!((mono[1] - 0.5).abs() < 1e-4);
        assert!((mono[2] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn decodes_24_bit_pcm() {
        // +half scale, -half scale
        let data: Vec<u8> = vec![0x00, 0x00, 0x40, 0x00, 0x00, 0xC0];
        let wav = build_wav(FMT_PCM, 1, 8000, 24, &data, false);
        let (_, mono) = decode_wav(&wav).unwrap();
        assert!((mono[0] - 0.5).abs() < 1e-6);
        assert!((mono[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn decodes_32_bit_pcm() {
        let vals: [i32; 2] = [i32::MAX / 2, i32::MIN / 2];
        let mut data = Vec::new();
        for v in vals {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let wav = build_wav(FMT_PCM, 1, 8000, 32, &data, false);
        let (_, mono) = decode_wav(&wav).unwrap();
        assert!((mono[0] - 0.5).abs() < 1e-6);
        assert!((mono[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn decodes_f32_and_f64() {
        let mut data = Vec::new();
        for v in [0.25f32, -0.75] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let wav = build_wav(FMT_IEEE_FLOAT, 1, 8000, 32, &data, false);
        let (_, mono) = decode_wav(&wav).unwrap();
        assert_eq!(mono, vec![0.25, -0.75]);

        let mut data = Vec::new();
        for v in [0.25f64, -0.75] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let wav = build_wav(FMT_IEEE_FLOAT, 1, 8000, 64, &data, false);
        let (_, mono) = decode_wav(&wav).unwrap();
        assert_eq!(mono, vec![0.25, -0.75]);
    }

    #[test]
    fn stereo_downmix_is_mean() {
        let mut data = Vec::new();
        for v in [16384i16, -16384, 8192, 8192] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let wav = build_wav(FMT_PCM, 2, 8000, 16, &data, false);
        let (_, mono) = decode_wav(&wav).unwrap();
        assert_eq!(mono.len(), 2);
        assert!(mono[0].abs() < 1e-6);
        assert!((mono[1] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn skips_unknown_chunks_with_padding() {
        let mut data = Vec::new();
        for v in [1000i16, 2000] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let wav = build_wav(FMT_PCM, 1, 8000, 16, &data, true);
        let (_, mono) = decode_wav(&wav).unwrap();
        assert_eq!(mono.len(), 2);
    }

    #[test]
    fn rejects_malformed_containers() {
        assert!(decode_wav(b"not a wav at all").is_err());

        // fmt only, no data
        let mut wav = build_wav(FMT_PCM, 1, 8000, 16, &[], false);
        wav.truncate(wav.len() - 8);
        assert!(decode_wav(&wav).is_err());

        // unsupported bit depth
        let wav = build_wav(FMT_PCM, 1, 8000, 8, &[0u8; 4], false);
        assert!(decode_wav(&wav).is_err());

        // unsupported format tag
        let wav = build_wav(0xFFFE, 1, 8000, 16, &[0u8; 4], false);
        assert!(decode_wav(&wav).is_err());
    }

    #[test]
    fn resample_length_is_proportional() {
        let input = vec![0.0f32; 48000];
        let out = resample(&input, 48000, 8000);
        assert!((out.len() as i64 - 8000).abs() <= 1);

        let out = resample(&input, 44100, 8000);
        let expected = (48000f64 * 8000.0 / 44100.0) as i64;
        assert!((out.len() as i64 - expected).abs() <= 1);
    }

    #[test]
    fn resample_preserves_ramp() {
        let input: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
        let out = resample(&input, 16000, 8000);
        // a linear ramp survives linear interpolation exactly
        for (i, &v) in out.iter().enumerate().skip(1).take(out.len() - 2) {
            let expected = (i * 2) as f32 / 1000.0;
            assert!((v - expected).abs() < 1e-4, "sample {i}: {v} vs {expected}");
        }
    }

    #[test]
    fn file_source_drains_gracefully() {
        let mut src = FileSource::from_samples(vec![0.1; 100]);
        assert_eq!(src.take(60).len(), 60);
        assert_eq!(src.remaining(), 40);
        assert_eq!(src.take(60).len(), 40);
        assert!(src.is_exhausted());
        assert!(src.take(10).is_empty());
    }
}
