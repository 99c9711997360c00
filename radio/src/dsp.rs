//! Rate Conversion
//!
//! Integer-factor conversion between the transport's base rate and the rate
//! requested by the PHY: block-averaging decimation on receive and
//! zero-order-hold interpolation on transmit.

use num_complex::Complex32;
use std::fmt;
use std::str::FromStr;

/// How a decimated output sample is normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecimationScaling {
    /// Plain sum of the input block
    Sum,
    /// Sum divided by the factor; amplitude neutral against zero-order hold
    #[default]
    Average,
}

impl FromStr for DecimationScaling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(DecimationScaling::Sum),
            "average" | "avg" | "mean" => Ok(DecimationScaling::Average),
            other => Err(format!("unknown decimation scaling '{}'", other)),
        }
    }
}

impl fmt::Display for DecimationScaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecimationScaling::Sum => write!(f, "sum"),
            DecimationScaling::Average => write!(f, "average"),
        }
    }
}

/// Decimate `input` by `factor` into `output`, returns the samples produced
pub fn decimate(
    input: &[Complex32],
    factor: usize,
    scaling: DecimationScaling,
    output: &mut [Complex32],
) -> usize {
    let factor = factor.max(1);
    let norm = match scaling {
        DecimationScaling::Sum => 1.0,
        DecimationScaling::Average => 1.0 / factor as f32,
    };

    let mut produced = 0;
    for (out, block) in output.iter_mut().zip(input.chunks_exact(factor)) {
        let sum: Complex32 = block.iter().sum();
        *out = sum * norm;
        produced += 1;
    }
    produced
}

/// Repeat every input sample `factor` times into `output`
pub fn interpolate(input: &[Complex32], factor: usize, output: &mut [Complex32]) -> usize {
    let factor = factor.max(1);

    let mut produced = 0;
    for (sample, block) in input.iter().zip(output.chunks_exact_mut(factor)) {
        block.fill(*sample);
        produced += factor;
    }
    produced
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f32) -> Complex32 {
        Complex32::new(re, -re)
    }

    #[test]
    fn test_decimate_average_and_sum() {
        let input: Vec<Complex32> = (1..=8).map(|i| c(i as f32)).collect();
        let mut out = vec![Complex32::new(0.0, 0.0); 2];

        assert_eq!(decimate(&input, 4, DecimationScaling::Sum, &mut out), 2);
        assert_eq!(out, vec![c(10.0), c(26.0)]);

        decimate(&input, 4, DecimationScaling::Average, &mut out);
        assert_eq!(out, vec![c(2.5), c(6.5)]);
    }

    #[test]
    fn test_factor_one_is_copy() {
        let input = vec![c(1.0), c(2.0)];
        let mut out = vec![Complex32::new(0.0, 0.0); 2];
        decimate(&input, 1, DecimationScaling::Average, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn test_interpolate_zero_order_hold() {
        let input = vec![c(1.0), c(2.0)];
        let mut out = vec![Complex32::new(0.0, 0.0); 6];
        assert_eq!(interpolate(&input, 3, &mut out), 6);
        assert_eq!(out, vec![c(1.0), c(1.0), c(1.0), c(2.0), c(2.0), c(2.0)]);
    }

    #[test]
    fn test_hold_then_average_is_identity() {
        let input: Vec<Complex32> = (0..16).map(|i| c(i as f32 * 0.1)).collect();
        let mut wide = vec![Complex32::new(0.0, 0.0); 16 * 6];
        let mut back = vec![Complex32::new(0.0, 0.0); 16];

        interpolate(&input, 6, &mut wide);
        decimate(&wide, 6, DecimationScaling::Average, &mut back);
        for (a, b) in input.iter().zip(&back) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn test_scaling_from_str() {
        assert_eq!("sum".parse::<DecimationScaling>().unwrap(), DecimationScaling::Sum);
        assert_eq!("Average".parse::<DecimationScaling>().unwrap(), DecimationScaling::Average);
        assert!("median".parse::<DecimationScaling>().is_err());
        assert_eq!(DecimationScaling::default(), DecimationScaling::Average);
    }
}
