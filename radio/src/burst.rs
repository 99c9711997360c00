//! Transmit Burst State Machine
//!
//! Hardware-class backends stream transmissions as bursts. An asynchronous
//! driver fault ends the current burst: the next send flushes an end-of-burst
//! frame and transmission resumes only once the driver acknowledged it or the
//! acknowledgement timed out.

use bitflags::bitflags;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default wait for an end-of-burst acknowledgement
pub const DEFAULT_EOB_ACK_TIMEOUT: Duration = Duration::from_millis(100);

bitflags! {
    /// Operations a backend supports while streaming
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// The base rate follows any requested rate
        const DYNAMIC_MASTER_CLOCK = 1 << 0;
        /// The receive stream may be torn down and restarted after a timeout
        const STREAM_REMAKE_AFTER_TIMEOUT = 1 << 1;
        /// An interrupted burst is closed with an explicit end-of-burst frame
        const EOB_FLUSH = 1 << 2;
        /// Time specs are only honored on the first send of a burst
        const TIMESTAMP_AT_BURST_START_ONLY = 1 << 3;
    }
}

impl Capabilities {
    /// Parse a `|`-separated list of flag names, e.g. `EOB_FLUSH|DYNAMIC_MASTER_CLOCK`
    pub fn parse_names(names: &str) -> Result<Self, String> {
        let mut caps = Capabilities::empty();
        for name in names.split('|').map(str::trim).filter(|n| !n.is_empty()) {
            let flag = Capabilities::from_name(&name.to_ascii_uppercase())
                .ok_or_else(|| format!("unknown capability '{}'", name))?;
            caps |= flag;
        }
        Ok(caps)
    }
}

/// Tx burst states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstState {
    StartBurst,
    Burst,
    EndOfBurst,
    WaitEobAck,
}

impl fmt::Display for BurstState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BurstState::StartBurst => write!(f, "START_BURST"),
            BurstState::Burst => write!(f, "BURST"),
            BurstState::EndOfBurst => write!(f, "END_OF_BURST"),
            BurstState::WaitEobAck => write!(f, "WAIT_EOB_ACK"),
        }
    }
}

/// Asynchronous events reported by a streaming driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    Underflow,
    Late,
    Overflow,
    /// The driver confirmed an end-of-burst frame
    BurstAck,
}

/// What the next send call must do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAction {
    /// Transmit the caller's samples; `start_of_burst` opens a new burst
    Transmit { start_of_burst: bool },
    /// Send an end-of-burst frame instead of the caller's samples
    FlushEob,
    /// Waiting for an acknowledgement; drop the caller's samples
    Blocked,
}

/// Tx burst tracker
#[derive(Debug)]
pub struct TxBurst {
    state: BurstState,
    capabilities: Capabilities,
    ack_timeout: Duration,
    eob_sent_at: Option<Instant>,
}

impl TxBurst {
    pub fn new(capabilities: Capabilities, ack_timeout: Duration) -> Self {
        Self {
            state: BurstState::StartBurst,
            capabilities,
            ack_timeout,
            eob_sent_at: None,
        }
    }

    pub fn state(&self) -> BurstState {
        self.state
    }

    /// Apply a driver event
    pub fn on_event(&mut self, event: DriverEvent) {
        match (event, self.state) {
            (DriverEvent::BurstAck, BurstState::WaitEobAck) => {
                debug!("End-of-burst acknowledged");
                self.transition(BurstState::StartBurst);
            }
            (DriverEvent::BurstAck, state) => {
                debug!("Ignoring end-of-burst ack in {}", state);
            }
            (fault, BurstState::Burst) => {
                warn!("Tx {:?} during burst, closing it", fault);
                self.transition(BurstState::EndOfBurst);
            }
            (fault, state) => {
                debug!("Tx {:?} in {}, burst already closed", fault, state);
            }
        }
    }

    /// Decide how the next send proceeds
    pub fn begin_send(&mut self, now: Instant) -> SendAction {
        if self.state == BurstState::WaitEobAck {
            let expired = self
                .eob_sent_at
                .map_or(true, |sent| now.duration_since(sent) >= self.ack_timeout);
            if !expired {
                return SendAction::Blocked;
            }
            info!("No end-of-burst ack within {:?}, restarting burst", self.ack_timeout);
            self.transition(BurstState::StartBurst);
        }

        if self.state == BurstState::EndOfBurst {
            if self.capabilities.contains(Capabilities::EOB_FLUSH) {
                return SendAction::FlushEob;
            }
            self.transition(BurstState::StartBurst);
        }

        SendAction::Transmit {
            start_of_burst: self.state == BurstState::StartBurst,
        }
    }

    /// The end-of-burst frame went out at `now`
    pub fn eob_sent(&mut self, now: Instant) {
        self.eob_sent_at = Some(now);
        self.transition(BurstState::WaitEobAck);
    }

    /// Samples went out; `end_of_burst` closes the burst cleanly
    pub fn transmitted(&mut self, end_of_burst: bool) {
        match (self.state, end_of_burst) {
            (BurstState::StartBurst, false) => self.transition(BurstState::Burst),
            (BurstState::Burst, true) => self.transition(BurstState::StartBurst),
            _ => {}
        }
    }

    /// True when a time spec on the next transmission must be ignored
    pub fn ignores_time(&self) -> bool {
        self.state == BurstState::Burst
            && self
                .capabilities
                .contains(Capabilities::TIMESTAMP_AT_BURST_START_ONLY)
    }

    /// Back to `START_BURST`, forgetting any pending acknowledgement
    pub fn reset(&mut self) {
        self.eob_sent_at = None;
        self.transition(BurstState::StartBurst);
    }

    fn transition(&mut self, next: BurstState) {
        if self.state != next {
            debug!("Tx burst {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
