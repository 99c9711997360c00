//! Radio Frontend Abstraction Library
//!
//! This crate puts every sample-streaming backend behind one synchronous
//! device contract, [`RfDevice`]. Backends are opened by name through a
//! [`registry::DeviceRegistry`]; the [`frontend::Radio`] wrapper adds the
//! single-channel and gain conveniences used by the upper PHY.

pub mod backends;
pub mod burst;
pub mod channel_map;
pub mod dsp;
pub mod frontend;
pub mod handler;
pub mod registry;

pub use burst::{BurstState, Capabilities, DriverEvent, TxBurst};
pub use frontend::Radio;
pub use handler::DeviceHandler;
pub use registry::{DeviceFactory, DeviceRegistry};

use common::{ArgsError, TimeSpec};
use interfaces::{ErrorHandler, InterfaceError, RfStats};
use num_complex::Complex32;
use thiserror::Error;

/// Radio device errors
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Sample rate {requested} Hz does not divide base rate {base} Hz")]
    InvalidRate { requested: f64, base: f64 },

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Timestamp {requested} is behind the transmitted sample count {current}")]
    LateTimestamp { requested: u64, current: u64 },

    #[error("Burst interrupted: {0}")]
    BurstInterrupted(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Cannot start: {0}")]
    CannotStart(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Device closed")]
    Closed,

    #[error("Argument error: {0}")]
    Args(#[from] ArgsError),

    #[error("Transport error: {0}")]
    Transport(#[source] InterfaceError),
}

impl RadioError {
    /// Negative integer code reported to callers that expect one
    pub fn code(&self) -> i32 {
        match self {
            RadioError::InvalidArgument(_)
            | RadioError::InvalidRate { .. }
            | RadioError::UnknownDevice(_)
            | RadioError::Args(_) => -2,
            RadioError::Timeout => -3,
            RadioError::CannotStart(_) => -6,
            RadioError::EndOfStream => -8,
            RadioError::LateTimestamp { .. }
            | RadioError::BurstInterrupted(_)
            | RadioError::Closed
            | RadioError::Transport(_) => -1,
        }
    }
}

impl From<InterfaceError> for RadioError {
    fn from(err: InterfaceError) -> Self {
        match err {
            InterfaceError::Timeout(_) => RadioError::Timeout,
            InterfaceError::EndOfStream => RadioError::EndOfStream,
            InterfaceError::Closed => RadioError::Closed,
            InterfaceError::InvalidConfig(msg) => RadioError::InvalidArgument(msg),
            other => RadioError::Transport(other),
        }
    }
}

/// The device contract every backend implements.
///
/// All methods take `&self`: configuration setters may run concurrently with
/// streaming calls, each backend guards its own state.
pub trait RfDevice: Send + Sync {
    /// Backend name, as registered
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Start the receive stream, immediately or at the next time boundary
    fn start_rx_stream(&self, now: bool) -> Result<(), RadioError>;

    fn stop_rx_stream(&self) -> Result<(), RadioError>;

    /// Returns the applied rate
    fn set_rx_srate(&self, rate_hz: f64) -> Result<f64, RadioError>;

    /// Returns the applied rate
    fn set_tx_srate(&self, rate_hz: f64) -> Result<f64, RadioError>;

    /// Returns the applied gain
    fn set_rx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError>;

    /// Returns the applied gain
    fn set_tx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError>;

    fn get_rx_gain(&self) -> f64;

    fn get_tx_gain(&self) -> f64;

    /// Returns the applied frequency
    fn set_rx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError>;

    /// Returns the applied frequency
    fn set_tx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError>;

    /// Receive `nsamples` on every logical channel. `None` buffers discard
    /// their channel. Returns the sample count and the time of the first
    /// sample delivered.
    fn recv_with_time_multi(
        &self,
        buffers: &mut [Option<&mut [Complex32]>],
        nsamples: usize,
        blocking: bool,
    ) -> Result<(usize, TimeSpec), RadioError>;

    /// Transmit `nsamples` from every logical channel, `None` sending zeros.
    /// With `time` set, the first sample goes out at that instant.
    #[allow(clippy::too_many_arguments)]
    fn send_timed_multi(
        &self,
        buffers: &[Option<&[Complex32]>],
        nsamples: usize,
        time: Option<TimeSpec>,
        blocking: bool,
        start_of_burst: bool,
        end_of_burst: bool,
    ) -> Result<usize, RadioError>;

    fn register_error_handler(&self, handler: ErrorHandler);

    fn stats(&self) -> RfStats;

    /// Stop every port and join its threads; later calls fail with `Closed`
    fn close(&self) -> Result<(), RadioError>;
}
