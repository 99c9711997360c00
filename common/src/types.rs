//! Common Types for the Radio Frontend
//!
//! Defines the sample formats, timestamps and error kinds used throughout the
//! streaming core

use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;
use std::str::FromStr;

/// Normalization constant between float and 16-bit fixed-point samples
pub const SC16_SCALE: f32 = 32767.0;

/// Wire format of complex samples at a port boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// 32-bit float I/Q pairs
    #[default]
    Fc32,
    /// 16-bit signed integer I/Q pairs
    Sc16,
}

impl SampleFormat {
    /// Bytes occupied by one complex sample
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::Fc32 => 8,
            SampleFormat::Sc16 => 4,
        }
    }

    /// Convert a sample count to a byte count
    pub fn samples_to_bytes(&self, nsamples: usize) -> usize {
        nsamples * self.bytes_per_sample()
    }

    /// Convert a byte count to a whole number of samples
    pub fn bytes_to_samples(&self, nbytes: usize) -> usize {
        nbytes / self.bytes_per_sample()
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fc32" | "cf32" | "float" => Ok(SampleFormat::Fc32),
            "sc16" | "cs16" | "short" => Ok(SampleFormat::Sc16),
            other => Err(format!("unknown sample format '{}'", other)),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::Fc32 => write!(f, "fc32"),
            SampleFormat::Sc16 => write!(f, "sc16"),
        }
    }
}

/// Absolute time split into whole and fractional seconds
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeSpec {
    /// Whole seconds
    pub full_secs: i64,
    /// Fractional seconds in [0, 1)
    pub frac_secs: f64,
}

impl TimeSpec {
    /// Create a time spec, carrying any whole seconds out of `frac_secs`
    pub fn new(full_secs: i64, frac_secs: f64) -> Self {
        let carry = frac_secs.floor();
        Self {
            full_secs: full_secs + carry as i64,
            frac_secs: frac_secs - carry,
        }
    }

    /// Time of sample number `count` on a clock running at `rate` Hz
    pub fn from_samples(count: u64, rate: f64) -> Self {
        let full = (count as f64 / rate).floor();
        let remainder = count as f64 - full * rate;
        Self::new(full as i64, remainder / rate)
    }

    /// Sample number of this instant on a clock running at `rate` Hz
    pub fn to_samples(&self, rate: f64) -> u64 {
        let whole = self.full_secs as f64 * rate;
        let frac = (self.frac_secs * rate).round();
        (whole.round() + frac).max(0.0) as u64
    }

    /// Time as floating point seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }
}

/// Kinds of asynchronous errors reported to a registered error handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum RfErrorKind {
    /// Receive buffer overflowed, samples were dropped
    Overflow = 0,
    /// Transmitter ran out of samples within a burst
    Underflow = 1,
    /// Timed transmission arrived after its time
    Late = 2,
    /// Other receive error
    RxError = 3,
}

impl fmt::Display for RfErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RfErrorKind::Overflow => "OVERFLOW",
            RfErrorKind::Underflow => "UNDERFLOW",
            RfErrorKind::Late => "LATE",
            RfErrorKind::RxError => "RX_ERROR",
        };
        f.write_str(name)
    }
}

/// Error event delivered to error handlers
#[derive(Debug, Clone, PartialEq)]
pub struct RfErrorEvent {
    /// Error kind
    pub kind: RfErrorKind,
    /// Kind-specific option (channel index for port errors)
    pub opt: i32,
    /// Optional free-form detail
    pub msg: Option<String>,
}

impl RfErrorEvent {
    /// Create an event without detail text
    pub fn new(kind: RfErrorKind, opt: i32) -> Self {
        Self { kind, opt, msg: None }
    }

    /// Attach detail text
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }
}
