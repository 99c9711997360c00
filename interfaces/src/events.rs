//! Error Reporting and Transport Statistics
//!
//! Ports run on their own threads, so both the error handler and the counters
//! are shared handles that can be cloned into pump threads.

use common::RfErrorEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Callback invoked for every asynchronous error event
pub type ErrorHandler = Arc<dyn Fn(RfErrorEvent) + Send + Sync>;

/// Shared slot holding the registered error handler
#[derive(Clone, Default)]
pub struct ErrorSink {
    handler: Arc<RwLock<Option<ErrorHandler>>>,
}

impl ErrorSink {
    /// Create a sink with no handler registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, replacing any previous one
    pub fn register(&self, handler: ErrorHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Deliver an event to the registered handler, if any
    pub fn report(&self, event: RfErrorEvent) {
        debug!("RF error event: {} (opt={})", event.kind, event.opt);
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

/// TX/RX statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RfStats {
    pub tx_samples: u64,
    pub rx_samples: u64,
    pub tx_underruns: u64,
    pub rx_overruns: u64,
    pub tx_late: u64,
    pub rx_timeouts: u64,
}

/// Live counters behind [`RfStats`], updated from any thread
#[derive(Debug, Default)]
pub struct StatsCounters {
    tx_samples: AtomicU64,
    rx_samples: AtomicU64,
    tx_underruns: AtomicU64,
    rx_overruns: AtomicU64,
    tx_late: AtomicU64,
    rx_timeouts: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_tx(&self, samples: usize) {
        self.tx_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_rx(&self, samples: usize) {
        self.rx_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) -> u64 {
        self.tx_underruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_overrun(&self) -> u64 {
        self.rx_overruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_late(&self) -> u64 {
        self.tx_late.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_rx_timeout(&self) -> u64 {
        self.rx_timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Copy of the current counter values
    pub fn snapshot(&self) -> RfStats {
        RfStats {
            tx_samples: self.tx_samples.load(Ordering::Relaxed),
            rx_samples: self.rx_samples.load(Ordering::Relaxed),
            tx_underruns: self.tx_underruns.load(Ordering::Relaxed),
            rx_overruns: self.rx_overruns.load(Ordering::Relaxed),
            tx_late: self.tx_late.load(Ordering::Relaxed),
            rx_timeouts: self.rx_timeouts.load(Ordering::Relaxed),
        }
    }
}
