//! Loopback Backend
//!
//! Emulates a timestamped hardware radio in process: Tx channel n feeds Rx
//! channel n through a ring buffer. Driver faults (underflow, late, overflow)
//! and end-of-burst acknowledgements arrive on an event channel, as they would
//! from a hardware driver, and drive the Tx burst state machine.
//!
//! Each channel keeps its own air clock. While the burst is closed the
//! transmitter sends nothing and the receiver hears silence; samples later
//! scheduled behind the air clock are lost.

use crate::burst::{BurstState, Capabilities, DriverEvent, SendAction, TxBurst, DEFAULT_EOB_ACK_TIMEOUT};
use crate::handler::{DeviceHandler, HandlerConfig};
use crate::registry::DeviceFactory;
use crate::{RadioError, RfDevice};
use bytes::BytesMut;
use common::{
    decode_samples, encode_samples, DeviceArgs, RfErrorEvent, RfErrorKind, SampleFormat, TimeSpec,
};
use crossbeam::channel::{self, Receiver, Sender};
use interfaces::port::ring_capacity_bytes;
use interfaces::zmq_rf::{DEFAULT_BASE_SRATE, DEFAULT_BUFFER_MS};
use interfaces::{
    Direction, ErrorHandler, ErrorSink, InterfaceError, PortSettings, RfStats, RingBuffer, RingBufferError,
    RxPort, StatsCounters, TxPort,
};
use num_complex::Complex32;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub const LOOPBACK_DEVICE: &str = "loopback";

/// Capabilities when `caps` is not given
pub const DEFAULT_CAPABILITIES: Capabilities =
    Capabilities::EOB_FLUSH.union(Capabilities::STREAM_REMAKE_AFTER_TIMEOUT);

/// State of the emulated medium shared by all ports
#[derive(Default)]
struct Medium {
    /// Rx stream running; samples sent while stopped are lost
    streaming: AtomicBool,
    /// Tx output is silently lost until the Rx stream is remade
    stalled: AtomicBool,
}

impl Medium {
    fn carries(&self) -> bool {
        self.streaming.load(Ordering::Acquire) && !self.stalled.load(Ordering::Acquire)
    }
}

/// One Tx channel feeding one Rx channel
struct Lane {
    ring: RingBuffer,
    /// Base-rate time up to which the air has been filled
    air_ts: Mutex<u64>,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            air_ts: Mutex::new(0),
        }
    }

    fn air_ts(&self) -> u64 {
        *self.air_ts.lock()
    }

    /// Put silence on the air up to `until`, as far as the ring has room
    fn fill_silence(&self, until: u64) {
        let mut air = self.air_ts.lock();
        if until <= *air {
            return;
        }
        let bytes_per_sample = SampleFormat::Fc32.bytes_per_sample();
        let n = ((until - *air) as usize).min(self.ring.space() / bytes_per_sample);
        // All-zero bytes decode as 0.0 fc32 samples
        self.ring.try_write(&vec![0u8; n * bytes_per_sample]);
        *air += n as u64;
    }

    /// Drop whatever is in flight and restart the air at `at`
    fn restart(&self, at: u64) {
        let mut air = self.air_ts.lock();
        self.ring.reset();
        *air = at;
    }
}

struct LoopbackTxPort {
    settings: PortSettings,
    lane: Arc<Lane>,
    medium: Arc<Medium>,
    events: Sender<(DriverEvent, usize)>,
    scratch: BytesMut,
    sample_count: u64,
    stats: Arc<StatsCounters>,
}

impl TxPort for LoopbackTxPort {
    fn settings(&self) -> &PortSettings {
        &self.settings
    }

    fn is_running(&self) -> bool {
        !self.lane.ring.is_stopped()
    }

    fn transmit(&mut self, samples: &[Complex32]) -> Result<usize, InterfaceError> {
        if !self.is_running() {
            return Err(InterfaceError::Closed);
        }
        let start = self.sample_count;
        self.sample_count += samples.len() as u64;
        self.stats.record_tx(samples.len());

        let mut air = self.lane.air_ts.lock();
        let skip = (*air).saturating_sub(start).min(samples.len() as u64) as usize;
        *air = (*air).max(self.sample_count);
        if skip > 0 {
            trace!("{}: {} samples behind the air clock lost", self.settings.label(), skip);
        }
        if !self.medium.carries() || skip == samples.len() {
            return Ok(samples.len());
        }

        self.scratch.clear();
        encode_samples(SampleFormat::Fc32, &samples[skip..], &mut self.scratch);
        if self.scratch.len() > self.lane.ring.space() {
            // The receive side fell behind; the driver drops this block
            let _ = self.events.send((DriverEvent::Overflow, self.settings.index));
            return Ok(samples.len());
        }
        self.lane.ring.try_write(&self.scratch);
        Ok(samples.len())
    }

    fn sample_count(&self) -> u64 {
        self.sample_count
    }

    fn close(&mut self) {
        self.lane.ring.stop();
    }
}

struct LoopbackRxPort {
    settings: PortSettings,
    lane: Arc<Lane>,
    scratch: Vec<u8>,
    stats: Arc<StatsCounters>,
}

impl RxPort for LoopbackRxPort {
    fn settings(&self) -> &PortSettings {
        &self.settings
    }

    fn is_running(&self) -> bool {
        !self.lane.ring.is_stopped()
    }

    fn receive(&mut self, dst: &mut [Complex32]) -> Result<usize, InterfaceError> {
        let format = SampleFormat::Fc32;
        let ring = &self.lane.ring;
        let max_bytes = ring.capacity() - ring.capacity() % format.bytes_per_sample();
        let nbytes = format.samples_to_bytes(dst.len()).min(max_bytes);
        self.scratch.resize(nbytes, 0);

        match ring.read_timed(&mut self.scratch, self.settings.timeout) {
            Ok(_) => {
                let n = decode_samples(format, &self.scratch, dst);
                self.stats.record_rx(n);
                Ok(n)
            }
            Err(RingBufferError::Timeout) => {
                self.stats.record_rx_timeout();
                if self.settings.fail_on_disconnect {
                    return Err(InterfaceError::Timeout(self.settings.timeout));
                }
                dst.fill(Complex32::new(0.0, 0.0));
                Ok(dst.len())
            }
            Err(e) => Err(InterfaceError::from_ring(e, self.settings.timeout)),
        }
    }

    fn close(&mut self) {
        self.lane.ring.stop();
    }
}

/// Handle for injecting driver behavior into a running loopback device
#[derive(Clone)]
pub struct LoopbackController {
    events: Sender<(DriverEvent, usize)>,
    medium: Arc<Medium>,
}

impl LoopbackController {
    /// Queue a driver event on channel 0; it is applied at the start of the
    /// next call
    pub fn inject(&self, event: DriverEvent) {
        self.inject_on(0, event);
    }

    pub fn inject_on(&self, channel: usize, event: DriverEvent) {
        let _ = self.events.send((event, channel));
    }

    /// Lose all Tx output until the Rx stream is restarted
    pub fn stall(&self) {
        self.medium.stalled.store(true, Ordering::Release);
    }
}

/// Emulated hardware radio
pub struct LoopbackDevice {
    handler: DeviceHandler,
    lanes: Vec<Arc<Lane>>,
    medium: Arc<Medium>,
    burst: Mutex<TxBurst>,
    events_tx: Sender<(DriverEvent, usize)>,
    events_rx: Receiver<(DriverEvent, usize)>,
    capabilities: Capabilities,
    eob_ack: bool,
}

impl LoopbackDevice {
    /// Open with one Tx/Rx channel pair per logical channel
    pub fn open(args: &DeviceArgs, nof_channels: usize) -> Result<Self, RadioError> {
        let base_srate = match args.get("base_srate") {
            Some(value) => value
                .parse::<f64>()
                .ok()
                .filter(|r| *r > 0.0)
                .ok_or_else(|| RadioError::InvalidArgument(format!("base_srate={}", value)))?,
            None => DEFAULT_BASE_SRATE,
        };
        let capabilities = match args.get("caps") {
            Some(names) => Capabilities::parse_names(names).map_err(RadioError::InvalidArgument)?,
            None => DEFAULT_CAPABILITIES,
        };
        let eob_ack = args.get_bool("eob_ack").unwrap_or(true);
        let ack_timeout = args
            .get_parsed::<u64>("eob_ack_timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_EOB_ACK_TIMEOUT);
        let buffer = Duration::from_millis(
            args.get_parsed::<u64>("buffer_ms").unwrap_or(DEFAULT_BUFFER_MS),
        );

        let mut config = HandlerConfig::from_args(LOOPBACK_DEVICE, args, nof_channels, base_srate)?;
        config.capabilities = capabilities;

        let stats = StatsCounters::new();
        let medium = Arc::new(Medium::default());
        let (events_tx, events_rx) = channel::unbounded();
        let ring_bytes = ring_capacity_bytes(base_srate, buffer, SampleFormat::Fc32);

        let mut lanes = Vec::with_capacity(nof_channels);
        let mut rx_ports: Vec<Box<dyn RxPort>> = Vec::with_capacity(nof_channels);
        let mut tx_ports: Vec<Box<dyn TxPort>> = Vec::with_capacity(nof_channels);

        for ch in 0..nof_channels {
            let lane = Arc::new(Lane::new(ring_bytes));
            let mut rx_settings = PortSettings::from_args(args, Direction::Rx, ch, true)?;
            let mut tx_settings = PortSettings::from_args(args, Direction::Tx, ch, true)?;
            if rx_settings.format != SampleFormat::Fc32 || tx_settings.format != SampleFormat::Fc32 {
                debug!("loopback channel {} always carries fc32", ch);
            }
            rx_settings.format = SampleFormat::Fc32;
            tx_settings.format = SampleFormat::Fc32;

            tx_ports.push(Box::new(LoopbackTxPort {
                settings: tx_settings,
                lane: lane.clone(),
                medium: medium.clone(),
                events: events_tx.clone(),
                scratch: BytesMut::new(),
                sample_count: 0,
                stats: stats.clone(),
            }));
            rx_ports.push(Box::new(LoopbackRxPort {
                settings: rx_settings,
                lane: lane.clone(),
                scratch: Vec::new(),
                stats: stats.clone(),
            }));
            lanes.push(lane);
        }

        info!(
            "Loopback device: capabilities {:?}, eob ack {}, ack timeout {:?}",
            capabilities, eob_ack, ack_timeout
        );

        let handler = DeviceHandler::new(config, rx_ports, tx_ports, ErrorSink::new(), stats);
        Ok(Self {
            handler,
            lanes,
            medium,
            burst: Mutex::new(TxBurst::new(capabilities, ack_timeout)),
            events_tx,
            events_rx,
            capabilities,
            eob_ack,
        })
    }

    pub fn controller(&self) -> LoopbackController {
        LoopbackController {
            events: self.events_tx.clone(),
            medium: self.medium.clone(),
        }
    }

    pub fn handler(&self) -> &DeviceHandler {
        &self.handler
    }

    /// Burst state after applying pending driver events
    pub fn burst_state(&self) -> BurstState {
        self.drain_events();
        self.burst.lock().state()
    }

    fn drain_events(&self) {
        for (event, channel) in self.events_rx.try_iter() {
            let stats = self.handler.stats_counters();
            let errors = self.handler.error_sink();
            let channel = channel as i32;

            match event {
                DriverEvent::Overflow => {
                    let count = stats.record_overrun();
                    warn!("{}: rx overflow #{} on channel {}", self.handler.id(), count, channel);
                    errors.report(RfErrorEvent::new(RfErrorKind::Overflow, channel));
                    self.restart_medium();
                }
                DriverEvent::Underflow => {
                    let count = stats.record_underrun();
                    warn!("{}: tx underflow #{}", self.handler.id(), count);
                    errors.report(RfErrorEvent::new(RfErrorKind::Underflow, channel));
                }
                DriverEvent::Late => {
                    let count = stats.record_late();
                    warn!("{}: late transmission #{}", self.handler.id(), count);
                    errors.report(RfErrorEvent::new(RfErrorKind::Late, channel));
                }
                DriverEvent::BurstAck => {}
            }
            self.burst.lock().on_event(event);
        }
    }

    /// Drop everything in flight and restart Rx where Tx currently is
    fn restart_medium(&self) {
        self.medium.stalled.store(false, Ordering::Release);
        let at = self.handler.resync_rx_to_tx();
        for lane in &self.lanes {
            lane.restart(at);
        }
    }

    /// Earliest air clock over all channels
    fn air_ts(&self) -> u64 {
        self.lanes.iter().map(|l| l.air_ts()).min().unwrap_or(0)
    }

    fn receive_once(
        &self,
        buffers: &mut [Option<&mut [Complex32]>],
        nsamples: usize,
        blocking: bool,
    ) -> Result<(usize, TimeSpec), RadioError> {
        let tx_idle = matches!(
            self.burst.lock().state(),
            BurstState::EndOfBurst | BurstState::WaitEobAck
        );
        if tx_idle && self.medium.carries() {
            let until =
                self.handler.next_rx_timestamp() + (nsamples * self.handler.decimation()) as u64;
            for lane in &self.lanes {
                lane.fill_silence(until);
            }
        }
        self.handler.receive_aligned(buffers, nsamples, blocking, !tx_idle)
    }

    fn drop_late(&self, requested: u64, current: u64, nsamples: usize) -> Result<usize, RadioError> {
        debug!(
            "{}: timestamp {} behind {}, dropping {} samples",
            self.handler.id(),
            requested,
            current,
            nsamples
        );
        let _ = self.events_tx.send((DriverEvent::Late, 0));
        Ok(0)
    }
}

impl RfDevice for LoopbackDevice {
    fn name(&self) -> &str {
        LOOPBACK_DEVICE
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn start_rx_stream(&self, now: bool) -> Result<(), RadioError> {
        self.handler.start_rx_stream(now)?;
        self.restart_medium();
        self.medium.streaming.store(true, Ordering::Release);
        info!("{}: rx stream started", self.handler.id());
        Ok(())
    }

    fn stop_rx_stream(&self) -> Result<(), RadioError> {
        self.medium.streaming.store(false, Ordering::Release);
        self.handler.stop_rx_stream()?;
        info!("{}: rx stream stopped", self.handler.id());
        Ok(())
    }

    fn set_rx_srate(&self, rate_hz: f64) -> Result<f64, RadioError> {
        self.handler.set_srate(rate_hz)
    }

    fn set_tx_srate(&self, rate_hz: f64) -> Result<f64, RadioError> {
        self.handler.set_srate(rate_hz)
    }

    fn set_rx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.handler.set_rx_gain_db(channel, gain_db)
    }

    fn set_tx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.handler.set_tx_gain_db(channel, gain_db)
    }

    fn get_rx_gain(&self) -> f64 {
        self.handler.rx_gain_db()
    }

    fn get_tx_gain(&self) -> f64 {
        self.handler.tx_gain_db()
    }

    fn set_rx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.handler.set_rx_freq_hz(channel, freq_hz)
    }

    fn set_tx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.handler.set_tx_freq_hz(channel, freq_hz)
    }

    fn recv_with_time_multi(
        &self,
        buffers: &mut [Option<&mut [Complex32]>],
        nsamples: usize,
        blocking: bool,
    ) -> Result<(usize, TimeSpec), RadioError> {
        self.drain_events();
        if !self.medium.streaming.load(Ordering::Acquire) {
            return Err(RadioError::CannotStart("rx stream not started".into()));
        }

        match self.receive_once(buffers, nsamples, blocking) {
            Err(RadioError::Timeout)
                if self
                    .capabilities
                    .contains(Capabilities::STREAM_REMAKE_AFTER_TIMEOUT) =>
            {
                warn!("{}: rx timeout, remaking stream", self.handler.id());
                self.restart_medium();
                self.receive_once(buffers, nsamples, blocking)
            }
            other => other,
        }
    }

    fn send_timed_multi(
        &self,
        buffers: &[Option<&[Complex32]>],
        nsamples: usize,
        time: Option<TimeSpec>,
        _blocking: bool,
        _start_of_burst: bool,
        end_of_burst: bool,
    ) -> Result<usize, RadioError> {
        self.drain_events();

        let now = Instant::now();
        let (action, ignore_time) = {
            let mut burst = self.burst.lock();
            let action = burst.begin_send(now);
            (action, burst.ignores_time())
        };

        let start_of_burst = match action {
            SendAction::Blocked => {
                debug!("{}: dropping {} samples, waiting for eob ack", self.handler.id(), nsamples);
                return Err(RadioError::BurstInterrupted("waiting for end-of-burst ack".into()));
            }
            SendAction::FlushEob => {
                // The end-of-burst frame carries no samples
                self.burst.lock().eob_sent(now);
                if self.eob_ack {
                    let _ = self.events_tx.send((DriverEvent::BurstAck, 0));
                }
                return Err(RadioError::BurstInterrupted("end of burst flushed".into()));
            }
            SendAction::Transmit { start_of_burst } => start_of_burst,
        };

        let time = if ignore_time { None } else { time };

        if let Some(time) = time {
            let ts = time.to_samples(self.handler.base_srate());
            let on_air = self.air_ts();
            if ts < on_air {
                return self.drop_late(ts, on_air, nsamples);
            }

            // A gap inside a running burst means the driver ran dry
            if let (Some(count), false) = (self.handler.tx_sample_count(), start_of_burst) {
                if ts > count {
                    let _ = self.events_tx.send((DriverEvent::Underflow, 0));
                }
            }
        }

        match self.handler.transmit(buffers, nsamples, time) {
            Ok(n) => {
                self.burst.lock().transmitted(end_of_burst);
                Ok(n)
            }
            Err(RadioError::LateTimestamp { requested, current }) => {
                self.drop_late(requested, current, nsamples)
            }
            Err(e) => Err(e),
        }
    }

    fn register_error_handler(&self, handler: ErrorHandler) {
        self.handler.register_error_handler(handler);
    }

    fn stats(&self) -> RfStats {
        self.handler.stats()
    }

    fn close(&self) -> Result<(), RadioError> {
        self.medium.streaming.store(false, Ordering::Release);
        self.handler.shutdown();
        Ok(())
    }
}

/// Registry entry for the loopback backend
pub struct LoopbackFactory;

impl DeviceFactory for LoopbackFactory {
    fn name(&self) -> &'static str {
        LOOPBACK_DEVICE
    }

    fn capabilities(&self) -> Capabilities {
        DEFAULT_CAPABILITIES
    }

    fn open(&self, args: &DeviceArgs, nof_channels: usize) -> Result<Box<dyn RfDevice>, RadioError> {
        Ok(Box::new(LoopbackDevice::open(args, nof_channels)?))
    }
}
