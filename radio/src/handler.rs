//! Device Handler
//!
//! Shared implementation of the device contract over a set of Rx and Tx
//! ports: rate conversion, frequency-based channel mapping, gain, timestamps
//! and Tx/Rx alignment.
//!
//! State is split into independently locked groups: rx config, tx config
//! (frequencies and tx gain), decimation and rx gain. A caller never holds
//! two of those at once; streaming calls copy what they need first. The two
//! stream locks are only ever nested as rx stream, then tx stream.

use crate::burst::Capabilities;
use crate::channel_map::{map_channels, port_sources};
use crate::dsp::{decimate, interpolate, DecimationScaling};
use crate::{RadioError, RfDevice};
use common::{
    db_to_amplitude, hz_to_mhz, scale_samples, DeviceArgs, RfErrorEvent, RfErrorKind, TimeSpec,
};
use interfaces::{ErrorHandler, ErrorSink, InterfaceError, RfStats, RxPort, StatsCounters, TxPort};
use num_complex::Complex32;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Consecutive port timeouts tolerated within one blocking receive
pub const MAX_RX_TRIALS: usize = 5;

const ZERO: Complex32 = Complex32::new(0.0, 0.0);

/// Device level settings shared by all port-based backends
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Backend name
    pub name: String,
    /// Device identifier used in logs
    pub id: String,
    pub nof_channels: usize,
    pub base_srate: f64,
    pub rx_gain_db: f64,
    pub tx_gain_db: f64,
    pub scaling: DecimationScaling,
    pub capabilities: Capabilities,
}

impl HandlerConfig {
    /// Read `id`, `rx_gain`, `tx_gain` and `decim_scaling`
    pub fn from_args(
        name: &str,
        args: &DeviceArgs,
        nof_channels: usize,
        base_srate: f64,
    ) -> Result<Self, RadioError> {
        if nof_channels == 0 {
            return Err(RadioError::InvalidArgument("at least one channel is required".into()));
        }

        let scaling = match args.get("decim_scaling") {
            Some(value) => value.parse().map_err(RadioError::InvalidArgument)?,
            None => DecimationScaling::default(),
        };

        Ok(Self {
            name: name.to_string(),
            id: args.get("id").unwrap_or(name).to_string(),
            nof_channels,
            base_srate,
            rx_gain_db: args.get_parsed("rx_gain").unwrap_or(0.0),
            tx_gain_db: args.get_parsed("tx_gain").unwrap_or(0.0),
            scaling,
            capabilities: Capabilities::empty(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RateState {
    base_srate: f64,
    srate: f64,
    decim: usize,
}

#[derive(Debug, Clone, Copy)]
struct GainState {
    db: f64,
    amplitude: f32,
}

impl GainState {
    fn new(db: f64) -> Self {
        Self {
            db,
            amplitude: db_to_amplitude(db as f32),
        }
    }
}

struct TxConfig {
    freqs_mhz: Vec<u32>,
    gain: GainState,
}

struct RxStream {
    ports: Vec<Box<dyn RxPort>>,
    /// Next receive timestamp, in base-rate samples
    next_ts: u64,
    /// Per logical channel base-rate scratch
    scratch: Vec<Vec<Complex32>>,
    /// Per port samples still owed to `next_ts` after a failed receive
    lag: Vec<usize>,
    discard: Vec<Complex32>,
}

struct TxStream {
    ports: Vec<Box<dyn TxPort>>,
    /// Gain-scaled copy of one channel at the requested rate
    scaled: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

/// Port-based device
pub struct DeviceHandler {
    name: String,
    id: String,
    nof_channels: usize,
    scaling: DecimationScaling,
    capabilities: Capabilities,
    rx_config: Mutex<Vec<u32>>,
    tx_config: Mutex<TxConfig>,
    decimation: Mutex<RateState>,
    rx_gain: Mutex<GainState>,
    rx_stream: Mutex<RxStream>,
    tx_stream: Mutex<TxStream>,
    closed: AtomicBool,
    errors: ErrorSink,
    stats: Arc<StatsCounters>,
}

impl DeviceHandler {
    pub fn new(
        config: HandlerConfig,
        rx_ports: Vec<Box<dyn RxPort>>,
        tx_ports: Vec<Box<dyn TxPort>>,
        errors: ErrorSink,
        stats: Arc<StatsCounters>,
    ) -> Self {
        info!(
            "{}: {} device with {} channels, {} rx ports, {} tx ports, base rate {:.3} MHz",
            config.id,
            config.name,
            config.nof_channels,
            rx_ports.len(),
            tx_ports.len(),
            config.base_srate / 1e6
        );

        Self {
            name: config.name,
            id: config.id,
            nof_channels: config.nof_channels,
            scaling: config.scaling,
            capabilities: config.capabilities,
            rx_config: Mutex::new(vec![0; config.nof_channels]),
            tx_config: Mutex::new(TxConfig {
                freqs_mhz: vec![0; config.nof_channels],
                gain: GainState::new(config.tx_gain_db),
            }),
            decimation: Mutex::new(RateState {
                base_srate: config.base_srate,
                srate: config.base_srate,
                decim: 1,
            }),
            rx_gain: Mutex::new(GainState::new(config.rx_gain_db)),
            rx_stream: Mutex::new(RxStream {
                lag: vec![0; rx_ports.len()],
                ports: rx_ports,
                next_ts: 0,
                scratch: vec![Vec::new(); config.nof_channels],
                discard: Vec::new(),
            }),
            tx_stream: Mutex::new(TxStream {
                ports: tx_ports,
                scaled: Vec::new(),
                scratch: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            errors,
            stats,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nof_channels(&self) -> usize {
        self.nof_channels
    }

    /// Current rate conversion factor
    pub fn decimation(&self) -> usize {
        self.decimation.lock().decim
    }

    pub fn base_srate(&self) -> f64 {
        self.decimation.lock().base_srate
    }

    pub fn error_sink(&self) -> &ErrorSink {
        &self.errors
    }

    pub fn stats_counters(&self) -> &Arc<StatsCounters> {
        &self.stats
    }

    /// Next receive timestamp in base-rate samples
    pub fn next_rx_timestamp(&self) -> u64 {
        self.rx_stream.lock().next_ts
    }

    /// Move the receive clock forward to the furthest transmitted sample,
    /// used when a loopback medium restarts and Rx must pick up where Tx is.
    /// Returns the resulting receive clock.
    pub fn resync_rx_to_tx(&self) -> u64 {
        let mut rx = self.rx_stream.lock();
        let tx = self.tx_stream.lock();
        if let Some(count) = tx.ports.iter().map(|p| p.sample_count()).max() {
            if count > rx.next_ts {
                debug!("{}: rx clock {} -> {}", self.id, rx.next_ts, count);
                rx.next_ts = count;
            }
        }
        rx.lag.fill(0);
        rx.next_ts
    }

    fn check_open(&self) -> Result<(), RadioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RadioError::Closed);
        }
        Ok(())
    }

    fn check_channel(&self, channel: usize) -> Result<(), RadioError> {
        if channel >= self.nof_channels {
            return Err(RadioError::InvalidArgument(format!(
                "channel {} out of range ({} channels)",
                channel, self.nof_channels
            )));
        }
        Ok(())
    }

    fn check_buffers<I>(&self, lengths: I, count: usize, nsamples: usize) -> Result<(), RadioError>
    where
        I: Iterator<Item = Option<usize>>,
    {
        if count > self.nof_channels {
            return Err(RadioError::InvalidArgument(format!(
                "{} buffers for {} channels",
                count, self.nof_channels
            )));
        }
        for (ch, len) in lengths.enumerate() {
            if let Some(len) = len {
                if len < nsamples {
                    return Err(RadioError::InvalidArgument(format!(
                        "channel {} buffer holds {} of {} samples",
                        ch, len, nsamples
                    )));
                }
            }
        }
        Ok(())
    }

    /// Change the shared rx/tx rate. The base rate must be an integer
    /// multiple of `rate`, unless the master clock can follow it.
    pub fn set_srate(&self, rate: f64) -> Result<f64, RadioError> {
        self.check_open()?;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(RadioError::InvalidArgument(format!("sample rate {}", rate)));
        }

        let mut state = self.decimation.lock();
        let ratio = state.base_srate / rate;
        let decim = ratio.round();

        if decim >= 1.0 && (state.base_srate - decim * rate).abs() < 1e-3 {
            state.srate = rate;
            state.decim = decim as usize;
            info!(
                "{}: sample rate {:.3} MHz, decimation {}",
                self.id,
                rate / 1e6,
                state.decim
            );
            return Ok(rate);
        }

        if self.capabilities.contains(Capabilities::DYNAMIC_MASTER_CLOCK) {
            info!(
                "{}: master clock {:.3} -> {:.3} MHz",
                self.id,
                state.base_srate / 1e6,
                rate / 1e6
            );
            state.base_srate = rate;
            state.srate = rate;
            state.decim = 1;
            return Ok(rate);
        }

        warn!(
            "{}: rejecting sample rate {} Hz, base rate {} Hz is not a multiple",
            self.id, rate, state.base_srate
        );
        Err(RadioError::InvalidRate {
            requested: rate,
            base: state.base_srate,
        })
    }

    pub fn set_rx_gain_db(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.check_channel(channel)?;
        *self.rx_gain.lock() = GainState::new(gain_db);
        debug!("{}: rx gain {} dB", self.id, gain_db);
        Ok(gain_db)
    }

    pub fn set_tx_gain_db(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.check_channel(channel)?;
        self.tx_config.lock().gain = GainState::new(gain_db);
        debug!("{}: tx gain {} dB", self.id, gain_db);
        Ok(gain_db)
    }

    pub fn rx_gain_db(&self) -> f64 {
        self.rx_gain.lock().db
    }

    pub fn tx_gain_db(&self) -> f64 {
        self.tx_config.lock().gain.db
    }

    pub fn set_rx_freq_hz(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.check_channel(channel)?;
        self.rx_config.lock()[channel] = hz_to_mhz(freq_hz);
        info!("{}: rx channel {} at {:.3} MHz", self.id, channel, freq_hz / 1e6);
        Ok(freq_hz)
    }

    pub fn set_tx_freq_hz(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.check_channel(channel)?;
        self.tx_config.lock().freqs_mhz[channel] = hz_to_mhz(freq_hz);
        info!("{}: tx channel {} at {:.3} MHz", self.id, channel, freq_hz / 1e6);
        Ok(freq_hz)
    }

    /// Receive `nsamples` per logical channel at the requested rate
    pub fn receive(
        &self,
        buffers: &mut [Option<&mut [Complex32]>],
        nsamples: usize,
        blocking: bool,
    ) -> Result<(usize, TimeSpec), RadioError> {
        self.receive_aligned(buffers, nsamples, blocking, true)
    }

    /// Receive, padding the Tx ports up to the end of the read first when
    /// `align_tx` is set.
    ///
    /// On a port failure after other ports already delivered, the clock still
    /// advances and ports that came up short skip what they owe on the next
    /// call, so every port stays on `next_ts`. The failure is returned and
    /// reported as [`RfErrorKind::RxError`].
    pub fn receive_aligned(
        &self,
        buffers: &mut [Option<&mut [Complex32]>],
        nsamples: usize,
        blocking: bool,
        align_tx: bool,
    ) -> Result<(usize, TimeSpec), RadioError> {
        self.check_open()?;
        self.check_buffers(
            buffers.iter().map(|b| b.as_ref().map(|b| b.len())),
            buffers.len(),
            nsamples,
        )?;

        let freqs = self.rx_config.lock().clone();
        let rate = *self.decimation.lock();
        let amplitude = self.rx_gain.lock().amplitude;
        let nbase = nsamples * rate.decim;

        let mut rx = self.rx_stream.lock();
        let timestamp = TimeSpec::from_samples(rx.next_ts, rate.base_srate);

        if rx.ports.is_empty() {
            for buf in buffers.iter_mut().flatten() {
                buf[..nsamples].fill(ZERO);
            }
            rx.next_ts += nbase as u64;
            return Ok((nsamples, timestamp));
        }

        let mapping = {
            let ports = &rx.ports;
            map_channels(&freqs[..buffers.len()], ports.len(), |p, f| {
                ports[p].match_frequency(f)
            })
        };

        if align_tx {
            // Transmit up to the end of this read before blocking on it
            self.align_transmitters(rx.next_ts + nbase as u64);
        }

        let RxStream {
            ports,
            next_ts,
            scratch,
            lag,
            discard,
        } = &mut *rx;

        for (port, owed) in ports.iter_mut().zip(lag.iter_mut()) {
            if *owed == 0 {
                continue;
            }
            discard.resize(*owed, ZERO);
            let mut got = 0;
            let result = read_port(port.as_mut(), discard, blocking, &mut got);
            *owed -= got;
            result?;
            debug!("{}: {} caught up by {} samples", self.id, port.settings().label(), got);
        }

        let mut consumed = vec![0usize; ports.len()];
        let mut failure = None;
        for (ch, buf) in buffers.iter_mut().enumerate() {
            let Some(port_idx) = mapping[ch] else {
                if let Some(dst) = buf {
                    dst[..nsamples].fill(ZERO);
                }
                continue;
            };
            let port = ports[port_idx].as_mut();
            let got = &mut consumed[port_idx];

            let result = match buf {
                Some(dst) if rate.decim == 1 => read_port(port, &mut dst[..nsamples], blocking, got),
                Some(dst) => {
                    let tmp = &mut scratch[ch];
                    tmp.resize(nbase, ZERO);
                    read_port(port, tmp, blocking, got).map(|()| {
                        decimate(&tmp[..], rate.decim, self.scaling, &mut dst[..nsamples]);
                    })
                }
                None => {
                    let tmp = &mut scratch[ch];
                    tmp.resize(nbase, ZERO);
                    read_port(port, tmp, blocking, got)
                }
            };
            if let Err(e) = result {
                failure = Some((ch, e));
                break;
            }

            if let Some(dst) = buf {
                scale_samples(&mut dst[..nsamples], amplitude);
            }
        }

        if let Some((ch, err)) = failure {
            if consumed.iter().any(|&n| n > 0) {
                for port_idx in mapping.iter().flatten() {
                    lag[*port_idx] += nbase - consumed[*port_idx];
                }
                *next_ts += nbase as u64;
                warn!(
                    "{}: channel {} failed mid-read ({}), skipping {} samples",
                    self.id, ch, err, nbase
                );
                self.errors
                    .report(RfErrorEvent::new(RfErrorKind::RxError, ch as i32).with_msg(err.to_string()));
            }
            return Err(err);
        }

        *next_ts += nbase as u64;
        trace!(
            "{}: received {} samples at {:.6} s",
            self.id,
            nsamples,
            timestamp.as_secs_f64()
        );
        Ok((nsamples, timestamp))
    }

    fn align_transmitters(&self, timestamp: u64) {
        let mut tx = self.tx_stream.lock();
        for port in tx.ports.iter_mut() {
            if let Err(e) = port.align(timestamp) {
                warn!(
                    "{}: failed to align {} to {}: {}",
                    self.id,
                    port.settings().label(),
                    timestamp,
                    e
                );
            }
        }
    }

    /// Transmit `nsamples` per logical channel at the requested rate,
    /// starting at `time` when given
    pub fn transmit(
        &self,
        buffers: &[Option<&[Complex32]>],
        nsamples: usize,
        time: Option<TimeSpec>,
    ) -> Result<usize, RadioError> {
        self.check_open()?;
        self.check_buffers(
            buffers.iter().map(|b| b.map(|b| b.len())),
            buffers.len(),
            nsamples,
        )?;

        let (freqs, amplitude) = {
            let cfg = self.tx_config.lock();
            (cfg.freqs_mhz.clone(), cfg.gain.amplitude)
        };
        let rate = *self.decimation.lock();
        let nbase = nsamples * rate.decim;

        let mut tx = self.tx_stream.lock();
        if tx.ports.is_empty() {
            return Ok(nsamples);
        }

        let mapping = {
            let ports = &tx.ports;
            map_channels(&freqs[..buffers.len()], ports.len(), |p, f| {
                ports[p].match_frequency(f)
            })
        };
        let sources = port_sources(&mapping, tx.ports.len());

        let TxStream {
            ports,
            scaled,
            scratch,
        } = &mut *tx;

        if let Some(time) = time {
            let ts = time.to_samples(rate.base_srate);
            if let Some(current) = ports.iter().map(|p| p.sample_count()).max() {
                if ts < current {
                    return Err(RadioError::LateTimestamp {
                        requested: ts,
                        current,
                    });
                }
            }
            for port in ports.iter_mut() {
                port.align(ts)?;
            }
        }

        scratch.resize(nbase, ZERO);
        for (port, source) in ports.iter_mut().zip(sources) {
            match source.and_then(|ch| buffers[ch]) {
                Some(src) => {
                    scaled.clear();
                    scaled.extend_from_slice(&src[..nsamples]);
                    scale_samples(&mut scaled[..], amplitude);
                    interpolate(&scaled[..], rate.decim, &mut scratch[..nbase]);
                    port.transmit(&scratch[..nbase])?;
                }
                None => {
                    port.transmit_zeros(nbase)?;
                }
            }
        }

        trace!("{}: sent {} samples", self.id, nsamples);
        Ok(nsamples)
    }

    /// Transmitted sample count of the first Tx port
    pub fn tx_sample_count(&self) -> Option<u64> {
        self.tx_stream.lock().ports.first().map(|p| p.sample_count())
    }

    /// Close every port; idempotent
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for port in self.rx_stream.lock().ports.iter_mut() {
            port.close();
        }
        for port in self.tx_stream.lock().ports.iter_mut() {
            port.close();
        }

        let stats = self.stats.snapshot();
        info!(
            "{}: closed; tx {} samples, rx {} samples, {} overruns, {} underruns, {} late, {} rx timeouts",
            self.id,
            stats.tx_samples,
            stats.rx_samples,
            stats.rx_overruns,
            stats.tx_underruns,
            stats.tx_late,
            stats.rx_timeouts
        );
    }
}

/// Fill `dst` from `port`, retrying timeouts up to [`MAX_RX_TRIALS`] times.
/// `got` counts the samples taken from the port, including on failure.
fn read_port(
    port: &mut dyn RxPort,
    dst: &mut [Complex32],
    blocking: bool,
    got: &mut usize,
) -> Result<(), RadioError> {
    let start = *got;
    let mut trials = 0;

    while *got - start < dst.len() {
        match port.receive(&mut dst[*got - start..]) {
            Ok(0) => {
                return Err(RadioError::InvalidArgument(format!(
                    "{} delivered no samples",
                    port.settings().label()
                )))
            }
            Ok(n) => {
                *got += n;
                trials = 0;
            }
            Err(InterfaceError::Timeout(timeout)) => {
                trials += 1;
                if !blocking || trials >= MAX_RX_TRIALS {
                    warn!(
                        "{}: no samples after {} trials of {:?}",
                        port.settings().label(),
                        trials,
                        timeout
                    );
                    return Err(RadioError::Timeout);
                }
                debug!("{}: receive timed out, retrying", port.settings().label());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl RfDevice for DeviceHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn start_rx_stream(&self, now: bool) -> Result<(), RadioError> {
        self.check_open()?;
        debug!("{}: rx stream started (now={})", self.id, now);
        Ok(())
    }

    fn stop_rx_stream(&self) -> Result<(), RadioError> {
        self.check_open()?;
        debug!("{}: rx stream stopped", self.id);
        Ok(())
    }

    fn set_rx_srate(&self, rate_hz: f64) -> Result<f64, RadioError> {
        self.set_srate(rate_hz)
    }

    fn set_tx_srate(&self, rate_hz: f64) -> Result<f64, RadioError> {
        self.set_srate(rate_hz)
    }

    fn set_rx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.set_rx_gain_db(channel, gain_db)
    }

    fn set_tx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.set_tx_gain_db(channel, gain_db)
    }

    fn get_rx_gain(&self) -> f64 {
        self.rx_gain_db()
    }

    fn get_tx_gain(&self) -> f64 {
        self.tx_gain_db()
    }

    fn set_rx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.set_rx_freq_hz(channel, freq_hz)
    }

    fn set_tx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.set_tx_freq_hz(channel, freq_hz)
    }

    fn recv_with_time_multi(
        &self,
        buffers: &mut [Option<&mut [Complex32]>],
        nsamples: usize,
        blocking: bool,
    ) -> Result<(usize, TimeSpec), RadioError> {
        self.receive(buffers, nsamples, blocking)
    }

    fn send_timed_multi(
        &self,
        buffers: &[Option<&[Complex32]>],
        nsamples: usize,
        time: Option<TimeSpec>,
        _blocking: bool,
        _start_of_burst: bool,
        _end_of_burst: bool,
    ) -> Result<usize, RadioError> {
        self.transmit(buffers, nsamples, time)
    }

    fn register_error_handler(&self, handler: ErrorHandler) {
        self.errors.register(handler);
    }

    fn stats(&self) -> RfStats {
        self.stats.snapshot()
    }

    fn close(&self) -> Result<(), RadioError> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for DeviceHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
