//! Rx/Tx Port Abstraction
//!
//! A port moves complex baseband samples for one logical stream between the
//! device handler and a transport. Every port carries the center frequency it
//! was configured for (whole MHz, 0 meaning "any") so the handler can map
//! logical channels onto ports by frequency.

use crate::InterfaceError;
use common::{DeviceArgs, SampleFormat};
use num_complex::Complex32;
use std::time::Duration;

/// Default wait on a blocking transport operation
pub const DEFAULT_TRX_TIMEOUT_MS: u64 = 2000;

/// Upper bound on a port ring, in samples
pub const MAX_RING_SAMPLES: usize = 3_072_000;

/// Lower bound on a port ring, in samples
pub const MIN_RING_SAMPLES: usize = 16_384;

/// Samples transmitted per chunk when filling gaps with zeros
const ZERO_BLOCK_SAMPLES: usize = 4096;

/// Stream direction of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    /// Prefix used for per-channel device arguments
    pub fn prefix(&self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

/// Settings shared by every port implementation
#[derive(Debug, Clone, PartialEq)]
pub struct PortSettings {
    /// Device identifier used in logs
    pub id: String,
    pub direction: Direction,
    /// Declaration index of the port within its direction
    pub index: usize,
    /// Center frequency in MHz, 0 matches any request
    pub frequency_mhz: u32,
    pub format: SampleFormat,
    pub timeout: Duration,
    /// Fail instead of substituting zeros when the peer goes away
    pub fail_on_disconnect: bool,
}

impl PortSettings {
    /// Read the settings of port `index` from `<dir>_freq<n>`, `<dir>_format<n>`,
    /// `trx_timeout_ms`, `fail_on_disconnect` and `id`
    pub fn from_args(
        args: &DeviceArgs,
        direction: Direction,
        index: usize,
        default_fail_on_disconnect: bool,
    ) -> Result<Self, InterfaceError> {
        let prefix = direction.prefix();

        let frequency_mhz = match args.get_indexed(&format!("{}_freq", prefix), index) {
            Some(value) => {
                let hz: f64 = value.parse().map_err(|_| {
                    InterfaceError::InvalidConfig(format!("{}_freq{}={}", prefix, index, value))
                })?;
                common::hz_to_mhz(hz)
            }
            None => 0,
        };

        let format = match args.get_indexed(&format!("{}_format", prefix), index) {
            Some(value) => value.parse().map_err(|_| {
                InterfaceError::InvalidConfig(format!("{}_format{}={}", prefix, index, value))
            })?,
            None => SampleFormat::default(),
        };

        let timeout_ms = args
            .get_parsed::<u64>("trx_timeout_ms")
            .unwrap_or(DEFAULT_TRX_TIMEOUT_MS);

        Ok(Self {
            id: args.get("id").unwrap_or("rf").to_string(),
            direction,
            index,
            frequency_mhz,
            format,
            timeout: Duration::from_millis(timeout_ms),
            fail_on_disconnect: args
                .get_bool("fail_on_disconnect")
                .unwrap_or(default_fail_on_disconnect),
        })
    }

    /// Short label for log lines, e.g. `rf:rx0`
    pub fn label(&self) -> String {
        format!("{}:{}{}", self.id, self.direction.prefix(), self.index)
    }
}

/// Ring size in bytes for a port buffering `duration` of samples at `srate`
pub fn ring_capacity_bytes(srate: f64, duration: Duration, format: SampleFormat) -> usize {
    let samples = (srate * duration.as_secs_f64()).round() as usize;
    format.samples_to_bytes(samples.clamp(MIN_RING_SAMPLES, MAX_RING_SAMPLES))
}

/// Source of received samples for one stream
pub trait RxPort: Send {
    fn settings(&self) -> &PortSettings;

    fn frequency_mhz(&self) -> u32 {
        self.settings().frequency_mhz
    }

    /// True when this port can serve a stream centered at `freq_mhz`
    fn match_frequency(&self, freq_mhz: u32) -> bool {
        let own = self.frequency_mhz();
        own == 0 || own == freq_mhz
    }

    fn is_running(&self) -> bool;

    /// Fill the front of `dst` with received samples and return how many were
    /// written. Never returns 0 on success.
    fn receive(&mut self, dst: &mut [Complex32]) -> Result<usize, InterfaceError>;

    /// Stop the port; further calls fail with [`InterfaceError::Closed`]
    fn close(&mut self);
}

/// Sink for transmitted samples of one stream
pub trait TxPort: Send {
    fn settings(&self) -> &PortSettings;

    fn frequency_mhz(&self) -> u32 {
        self.settings().frequency_mhz
    }

    fn match_frequency(&self, freq_mhz: u32) -> bool {
        let own = self.frequency_mhz();
        own == 0 || own == freq_mhz
    }

    fn is_running(&self) -> bool;

    /// Queue `samples` for transmission, returns the number accepted
    fn transmit(&mut self, samples: &[Complex32]) -> Result<usize, InterfaceError>;

    /// Queue `nsamples` zero samples
    fn transmit_zeros(&mut self, nsamples: usize) -> Result<usize, InterfaceError> {
        let zeros = [Complex32::new(0.0, 0.0); ZERO_BLOCK_SAMPLES];
        let mut sent = 0;
        while sent < nsamples {
            let n = (nsamples - sent).min(ZERO_BLOCK_SAMPLES);
            self.transmit(&zeros[..n])?;
            sent += n;
        }
        Ok(sent)
    }

    /// Total samples queued since the port was opened
    fn sample_count(&self) -> u64;

    /// Pad with zeros so the next queued sample lands at `timestamp`.
    /// Does nothing when the port is already at or past it.
    fn align(&mut self, timestamp: u64) -> Result<(), InterfaceError> {
        let count = self.sample_count();
        if timestamp > count {
            self.transmit_zeros((timestamp - count) as usize)?;
        }
        Ok(())
    }

    /// Flush and stop the port
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTx {
        settings: PortSettings,
        queued: Vec<Complex32>,
    }

    impl TxPort for CountingTx {
        fn settings(&self) -> &PortSettings {
            &self.settings
        }
        fn is_running(&self) -> bool {
            true
        }
        fn transmit(&mut self, samples: &[Complex32]) -> Result<usize, InterfaceError> {
            self.queued.extend_from_slice(samples);
            Ok(samples.len())
        }
        fn sample_count(&self) -> u64 {
            self.queued.len() as u64
        }
        fn close(&mut self) {}
    }

    fn settings(args: &str, direction: Direction, index: usize) -> PortSettings {
        PortSettings::from_args(&DeviceArgs::parse(args), direction, index, false).unwrap()
    }

    #[test]
    fn test_settings_from_args() {
        let s = settings(
            "id=ue,rx_freq=2680e6,rx_freq1=2400e6,rx_format1=sc16,trx_timeout_ms=50,fail_on_disconnect=true",
            Direction::Rx,
            1,
        );
        assert_eq!(s.frequency_mhz, 2400);
        assert_eq!(s.format, SampleFormat::Sc16);
        assert_eq!(s.timeout, Duration::from_millis(50));
        assert!(s.fail_on_disconnect);
        assert_eq!(s.label(), "ue:rx1");

        let s0 = settings("rx_freq=2680e6", Direction::Rx, 0);
        assert_eq!(s0.frequency_mhz, 2680);
        assert_eq!(s0.format, SampleFormat::Fc32);
        assert_eq!(s0.timeout, Duration::from_millis(DEFAULT_TRX_TIMEOUT_MS));
        assert!(!s0.fail_on_disconnect);
    }

    #[test]
    fn test_settings_reject_bad_values() {
        let args = DeviceArgs::parse("tx_freq0=abc");
        assert!(PortSettings::from_args(&args, Direction::Tx, 0, false).is_err());
        let args = DeviceArgs::parse("tx_format0=u8");
        assert!(PortSettings::from_args(&args, Direction::Tx, 0, false).is_err());
    }

    #[test]
    fn test_match_frequency_wildcard() {
        let mut port = CountingTx {
            settings: settings("", Direction::Tx, 0),
            queued: Vec::new(),
        };
        assert!(port.match_frequency(2400));
        port.settings.frequency_mhz = 2680;
        assert!(port.match_frequency(2680));
        assert!(!port.match_frequency(2400));
    }

    #[test]
    fn test_align_pads_gap_only() {
        let mut port = CountingTx {
            settings: settings("", Direction::Tx, 0),
            queued: Vec::new(),
        };
        port.transmit(&[Complex32::new(1.0, 1.0); 10]).unwrap();

        port.align(5).unwrap();
        assert_eq!(port.sample_count(), 10);

        port.align(10_000).unwrap();
        assert_eq!(port.sample_count(), 10_000);
        assert!(port.queued[10..].iter().all(|s| s.norm() == 0.0));
    }

    #[test]
    fn test_ring_capacity_bounds() {
        let small = ring_capacity_bytes(1e3, Duration::from_millis(100), SampleFormat::Fc32);
        assert_eq!(small, MIN_RING_SAMPLES * 8);

        let large = ring_capacity_bytes(122.88e6, Duration::from_millis(100), SampleFormat::Sc16);
        assert_eq!(large, MAX_RING_SAMPLES * 4);

        let mid = ring_capacity_bytes(1.92e6, Duration::from_millis(100), SampleFormat::Fc32);
        assert_eq!(mid, 192_000 * 8);
    }
}
