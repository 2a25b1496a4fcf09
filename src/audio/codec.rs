//! # Codec Converter
//!
//! Stateless conversions between the telephony encoding (8-bit G.711 μ-law) and
//! the linear PCM16 the AI service speaks, plus sample-rate conversion.
//!
//! ## Lookup Tables:
//! Both directions go through tables built once per process on first use:
//! - **μ-law → PCM16**: 256 entries, one per code byte
//! - **PCM16 → μ-law**: 65536 entries, indexed by the sample biased into `u16` range
//!
//! ## Byte Layout:
//! PCM16 buffers are little-endian signed 16-bit samples, interleaved when
//! there is more than one channel.

use crate::audio::format::{AudioEncoding, MediaFormat};
use crate::error::{RelayError, RelayResult};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::LazyLock;

/// G.711 bias added to the magnitude before segment search.
const MULAW_BIAS: i32 = 0x84;

/// Largest magnitude that still fits segment 7 after biasing.
const MULAW_CLIP: u32 = 32635;

static MULAW_TO_PCM: LazyLock<[i16; 256]> = LazyLock::new(|| {
    let mut table = [0i16; 256];
    for (code, slot) in table.iter_mut().enumerate() {
        *slot = expand_mulaw(code as u8);
    }
    table
});

static PCM_TO_MULAW: LazyLock<Box<[u8]>> = LazyLock::new(|| {
    (0..=u16::MAX)
        .map(|biased| compress_mulaw((biased as i32 - 32768) as i16))
        .collect()
});

/// Expand one μ-law code byte into a linear sample.
fn expand_mulaw(code: u8) -> i16 {
    let u = !code;
    let exponent = (u & 0x70) >> 4;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compress one linear sample into a μ-law code byte.
///
/// The exponent is `floor(log2(magnitude))` of the biased magnitude, shifted
/// down so segment 0 starts at the bias, and clamped to `[0, 7]`.
fn compress_mulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = (sample as i32).unsigned_abs().min(MULAW_CLIP) + MULAW_BIAS as u32;
    let exponent = (31 - magnitude.leading_zeros()).saturating_sub(7).min(7);
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | ((exponent as u8) << 4) | mantissa as u8)
}

/// Decode μ-law bytes into little-endian PCM16. Output is twice the input length.
pub fn mulaw_to_pcm16(mulaw: &[u8]) -> Vec<u8> {
    let table = &*MULAW_TO_PCM;
    let mut pcm = vec![0u8; mulaw.len() * 2];
    for (code, out) in mulaw.iter().zip(pcm.chunks_exact_mut(2)) {
        LittleEndian::write_i16(out, table[*code as usize]);
    }
    pcm
}

/// Encode little-endian PCM16 into μ-law bytes. Output is half the input length.
///
/// ## Errors:
/// Returns `Conversion` if the buffer holds a partial sample (odd byte count).
pub fn pcm16_to_mulaw(pcm: &[u8]) -> RelayResult<Vec<u8>> {
    if pcm.len() % 2 != 0 {
        return Err(RelayError::Conversion(format!(
            "PCM16 buffer has odd length {}",
            pcm.len()
        )));
    }

    let table = &*PCM_TO_MULAW;
    Ok(pcm
        .chunks_exact(2)
        .map(|bytes| {
            let biased = (LittleEndian::read_i16(bytes) as i32 + 32768) as usize;
            table[biased]
        })
        .collect())
}

/// Read a PCM16 byte buffer into samples, checking it holds whole frames.
fn read_samples(pcm: &[u8], channels: u16) -> RelayResult<Vec<i16>> {
    if channels == 0 {
        return Err(RelayError::InvalidInput("channel count must be at least 1".to_string()));
    }
    let frame_bytes = 2 * channels as usize;
    if pcm.len() % frame_bytes != 0 {
        return Err(RelayError::Conversion(format!(
            "PCM16 buffer of {} bytes is not a whole number of {}-channel frames",
            pcm.len(),
            channels
        )));
    }

    let mut samples = vec![0i16; pcm.len() / 2];
    LittleEndian::read_i16_into(pcm, &mut samples);
    Ok(samples)
}

fn write_samples(samples: &[i16]) -> Vec<u8> {
    let mut pcm = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut pcm);
    pcm
}

/// Convert PCM16 between sample rates using linear interpolation.
///
/// Channels are interleaved; each channel is interpolated independently. When
/// the rates match the input is returned untouched.
pub fn resample(pcm: &[u8], from_rate: u32, to_rate: u32, channels: u16) -> RelayResult<Vec<u8>> {
    if from_rate == to_rate {
        return Ok(pcm.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(RelayError::InvalidInput(format!(
            "cannot resample {} Hz -> {} Hz",
            from_rate, to_rate
        )));
    }

    let samples = read_samples(pcm, channels)?;
    let channels = channels as usize;
    let frames_in = samples.len() / channels;
    if frames_in == 0 {
        return Ok(Vec::new());
    }

    let frames_out =
        ((frames_in as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(frames_out * channels);

    for frame in 0..frames_out {
        let position = frame as f64 * step;
        let index = (position.floor() as usize).min(frames_in - 1);
        let next = (index + 1).min(frames_in - 1);
        let frac = position - index as f64;

        for ch in 0..channels {
            let a = samples[index * channels + ch] as f64;
            let b = samples[next * channels + ch] as f64;
            let value = a + (b - a) * frac;
            out.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        }
    }

    Ok(write_samples(&out))
}

/// Whether [`convert`] can map `from` onto `to` at all.
///
/// Fails with `InvalidInput` for a channel-count change or a zero sample rate
/// on either side, regardless of the audio that would be passed.
pub fn check_convertible(from: &MediaFormat, to: &MediaFormat) -> RelayResult<()> {
    if from.channels != to.channels {
        return Err(RelayError::InvalidInput(format!(
            "channel remixing is not supported ({} -> {})",
            from.channels, to.channels
        )));
    }
    if from.sample_rate == 0 || to.sample_rate == 0 {
        return Err(RelayError::InvalidInput(format!(
            "cannot convert {} Hz -> {} Hz",
            from.sample_rate, to.sample_rate
        )));
    }
    Ok(())
}

/// Convert a buffer from one media format to another.
///
/// Encoding is converted first (μ-law is expanded to PCM16), then the sample
/// rate, then the result is encoded into the target encoding. Rate conversion
/// always runs on linear samples.
///
/// ## Errors:
/// - `InvalidInput` for an empty buffer or a channel-count change
/// - `Conversion` for a PCM buffer that does not hold whole frames
pub fn convert(audio: &[u8], from: &MediaFormat, to: &MediaFormat) -> RelayResult<Vec<u8>> {
    if audio.is_empty() {
        return Err(RelayError::InvalidInput("audio buffer is empty".to_string()));
    }
    check_convertible(from, to)?;
    if from == to {
        return Ok(audio.to_vec());
    }

    let pcm = match from.encoding {
        AudioEncoding::Mulaw => mulaw_to_pcm16(audio),
        AudioEncoding::Pcm16 => audio.to_vec(),
    };

    let pcm = resample(&pcm, from.sample_rate, to.sample_rate, from.channels)?;

    match to.encoding {
        AudioEncoding::Mulaw => pcm16_to_mulaw(&pcm),
        AudioEncoding::Pcm16 => Ok(pcm),
    }
}

/// Convert PCM16 bytes to normalized float samples in [-1.0, 1.0).
pub fn pcm16_to_f32(pcm: &[u8]) -> RelayResult<Vec<f32>> {
    Ok(read_samples(pcm, 1)?
        .into_iter()
        .map(|sample| sample as f32 / 32768.0)
        .collect())
}

/// Convert normalized float samples back to PCM16 bytes, clamping out-of-range values.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let ints: Vec<i16> = samples
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect();
    write_samples(&ints)
}
