//! Radio Transport Interfaces Library
//!
//! This crate provides the sample transports behind every radio backend: the
//! byte ring buffer, the Rx/Tx port abstraction, and the ZeroMQ and file
//! implementations of it.

pub mod events;
pub mod file_rf;
pub mod port;
pub mod ring_buffer;
pub mod worker;
pub mod zmq_rf;

pub use events::{ErrorHandler, ErrorSink, RfStats, StatsCounters};
pub use port::{Direction, PortSettings, RxPort, TxPort};
pub use ring_buffer::{RingBuffer, RingBufferError};

use std::time::Duration;
use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("ZMQ error: {0}")]
    ZmqError(#[from] zmq::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ring buffer error: {0}")]
    RingBuffer(RingBufferError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("End of stream")]
    EndOfStream,

    #[error("Port closed")]
    Closed,
}

impl InterfaceError {
    /// Translate a ring buffer failure seen by a port waiting up to `timeout`
    pub fn from_ring(err: RingBufferError, timeout: Duration) -> Self {
        match err {
            RingBufferError::Timeout => InterfaceError::Timeout(timeout),
            RingBufferError::Stopped => InterfaceError::Closed,
            other => InterfaceError::RingBuffer(other),
        }
    }
}
