//! Common Utilities
//!
//! Gain conversion, frequency bookkeeping and the sample codec used at every
//! port boundary

use crate::types::{SampleFormat, SC16_SCALE};
use bytes::{Buf, BufMut, BytesMut};
use num_complex::Complex32;
use tracing::trace;

/// Convert a gain in dB to a linear amplitude multiplier
pub fn db_to_amplitude(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Convert a linear amplitude multiplier to dB
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    20.0 * amplitude.log10()
}

/// Center frequency in whole MHz, the granularity used for port matching
pub fn hz_to_mhz(freq_hz: f64) -> u32 {
    if freq_hz <= 0.0 {
        return 0;
    }
    (freq_hz / 1e6).round() as u32
}

/// Append `samples` to `dst` in the given wire format (little endian)
pub fn encode_samples(format: SampleFormat, samples: &[Complex32], dst: &mut BytesMut) {
    dst.reserve(format.samples_to_bytes(samples.len()));

    match format {
        SampleFormat::Fc32 => {
            for s in samples {
                dst.put_f32_le(s.re);
                dst.put_f32_le(s.im);
            }
        }
        SampleFormat::Sc16 => {
            for s in samples {
                dst.put_i16_le(float_to_sc16(s.re));
                dst.put_i16_le(float_to_sc16(s.im));
            }
        }
    }
}

/// Decode whole samples from `src` into `dst`, returns the number decoded
pub fn decode_samples(format: SampleFormat, mut src: &[u8], dst: &mut [Complex32]) -> usize {
    let count = format.bytes_to_samples(src.len()).min(dst.len());

    match format {
        SampleFormat::Fc32 => {
            for s in dst.iter_mut().take(count) {
                let re = src.get_f32_le();
                let im = src.get_f32_le();
                *s = Complex32::new(re, im);
            }
        }
        SampleFormat::Sc16 => {
            for s in dst.iter_mut().take(count) {
                let re = src.get_i16_le() as f32 / SC16_SCALE;
                let im = src.get_i16_le() as f32 / SC16_SCALE;
                *s = Complex32::new(re, im);
            }
        }
    }

    trace!("Decoded {} {} samples", count, format);
    count
}

fn float_to_sc16(value: f32) -> i16 {
    (value * SC16_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Multiply every sample by `scale`, skipping the unity case
pub fn scale_samples(samples: &mut [Complex32], scale: f32) {
    if scale == 1.0 {
        return;
    }
    for s in samples.iter_mut() {
        *s *= scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversion() {
        assert!((db_to_amplitude(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_amplitude(20.0) - 10.0).abs() < 1e-4);
        assert!((db_to_amplitude(-6.0) - 0.501_187).abs() < 1e-5);
        assert!((amplitude_to_db(10.0) - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_hz_to_mhz() {
        assert_eq!(hz_to_mhz(2630e6), 2630);
        assert_eq!(hz_to_mhz(0.0), 0);
        assert_eq!(hz_to_mhz(-5.0), 0);
        assert_eq!(hz_to_mhz(1842.4e6), 1842);
    }

    #[test]
    fn test_fc32_layout() {
        let mut bytes = BytesMut::new();
        encode_samples(SampleFormat::Fc32, &[Complex32::new(1.0, -2.0)], &mut bytes);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-2.0f32).to_le_bytes());
    }

    #[test]
    fn test_sc16_scaling_and_saturation() {
        let mut bytes = BytesMut::new();
        let input = [Complex32::new(0.5, -0.25), Complex32::new(3.0, -3.0)];
        encode_samples(SampleFormat::Sc16, &input, &mut bytes);
        assert_eq!(bytes.len(), 8);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16384);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[6], bytes[7]]), i16::MIN);

        let mut out = [Complex32::new(0.0, 0.0); 2];
        assert_eq!(decode_samples(SampleFormat::Sc16, &bytes, &mut out), 2);
        assert!((out[0].re - 0.5).abs() < 1e-4);
        assert!((out[0].im + 0.25).abs() < 1e-4);
        assert!((out[1].re - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_ignores_trailing_partial_sample() {
        let mut bytes = BytesMut::new();
        encode_samples(SampleFormat::Fc32, &[Complex32::new(0.1, 0.2)], &mut bytes);
        bytes.put_u8(0xAA);
        let mut out = [Complex32::new(9.0, 9.0); 4];
        assert_eq!(decode_samples(SampleFormat::Fc32, &bytes, &mut out), 1);
        assert_eq!(out[1], Complex32::new(9.0, 9.0));
    }

    #[test]
    fn test_scale_samples() {
        let mut s = vec![Complex32::new(1.0, 2.0)];
        scale_samples(&mut s, 2.0);
        assert_eq!(s[0], Complex32::new(2.0, 4.0));
    }
}
