//! ZMQ RF Transport for IQ Sample Exchange
//!
//! This module implements ZeroMQ backed Rx and Tx ports. Each port owns a
//! socket driven by a pump thread that moves raw sample bytes between the
//! socket and the port's ring buffer, so the caller only ever blocks on the
//! ring.
//!
//! Two socket patterns are supported per direction:
//! - Tx binds a REP socket and answers each peer request with whatever samples
//!   are buffered, or binds a PUB socket and publishes them as they arrive.
//! - Rx connects a REQ socket and keeps at most one request outstanding, or
//!   connects a SUB socket subscribed to everything.

use crate::port::{ring_capacity_bytes, Direction, PortSettings, RxPort, TxPort};
use crate::worker::{StopToken, Worker};
use crate::{ErrorSink, InterfaceError, RingBuffer, RingBufferError, StatsCounters};
use bytes::BytesMut;
use common::{decode_samples, encode_samples, DeviceArgs, RfErrorEvent, RfErrorKind};
use num_complex::Complex32;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use zmq::{Context, Socket};

/// Default base sample rate (for 100 PRB cell)
pub const DEFAULT_BASE_SRATE: f64 = 23.04e6;

/// Default amount of signal each port ring can hold
pub const DEFAULT_BUFFER_MS: u64 = 100;

/// Largest message a Tx pump sends at once, in samples
pub const MAX_MSG_SAMPLES: usize = 61_440;

/// Socket timeout; pump threads check for stop at this rate
const POLL_INTERVAL_MS: i32 = 20;

/// Rate limit for repeated hot-path warnings
const LOG_EVERY: u64 = 1000;

/// Process-wide ZMQ context. Sharing one context lets `inproc://` endpoints
/// connect across devices in the same process.
pub fn shared_context() -> Context {
    static CONTEXT: OnceLock<Context> = OnceLock::new();
    CONTEXT.get_or_init(Context::new).clone()
}

/// ZMQ socket pattern of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZmqSocketType {
    Req,
    Rep,
    Pub,
    Sub,
}

impl ZmqSocketType {
    fn as_zmq(&self) -> zmq::SocketType {
        match self {
            ZmqSocketType::Req => zmq::REQ,
            ZmqSocketType::Rep => zmq::REP,
            ZmqSocketType::Pub => zmq::PUB,
            ZmqSocketType::Sub => zmq::SUB,
        }
    }

    /// Serving sockets bind, consuming sockets connect
    fn binds(&self) -> bool {
        matches!(self, ZmqSocketType::Rep | ZmqSocketType::Pub)
    }

    fn direction(&self) -> Direction {
        match self {
            ZmqSocketType::Req | ZmqSocketType::Sub => Direction::Rx,
            ZmqSocketType::Rep | ZmqSocketType::Pub => Direction::Tx,
        }
    }
}

impl FromStr for ZmqSocketType {
    type Err = InterfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "req" => Ok(ZmqSocketType::Req),
            "rep" => Ok(ZmqSocketType::Rep),
            "pub" => Ok(ZmqSocketType::Pub),
            "sub" => Ok(ZmqSocketType::Sub),
            other => Err(InterfaceError::InvalidConfig(format!(
                "unknown ZMQ socket type '{}'",
                other
            ))),
        }
    }
}

/// Configuration of one ZMQ port
#[derive(Debug, Clone)]
pub struct ZmqPortConfig {
    pub settings: PortSettings,
    pub address: String,
    pub socket_type: ZmqSocketType,
    /// Ring buffer size in bytes
    pub ring_bytes: usize,
}

/// ZMQ RF configuration
#[derive(Debug, Clone)]
pub struct ZmqRfConfig {
    pub base_srate: f64,
    pub rx_ports: Vec<ZmqPortConfig>,
    pub tx_ports: Vec<ZmqPortConfig>,
}

impl ZmqRfConfig {
    /// Parse device arguments in srsRAN format.
    /// Ports are declared as `rx_port<n>`/`tx_port<n>` with contiguous indices;
    /// `rx_port`/`tx_port` stand for index 0.
    pub fn from_device_args(args: &DeviceArgs) -> Result<Self, InterfaceError> {
        let base_srate = match args.get("base_srate") {
            Some(value) => value
                .parse::<f64>()
                .ok()
                .filter(|r| *r > 0.0)
                .ok_or_else(|| InterfaceError::InvalidConfig(format!("base_srate={}", value)))?,
            None => DEFAULT_BASE_SRATE,
        };

        let buffer = Duration::from_millis(
            args.get_parsed::<u64>("buffer_ms").unwrap_or(DEFAULT_BUFFER_MS),
        );
        let rx_type = match args.get("rx_type") {
            Some(value) => value.parse()?,
            None => ZmqSocketType::Req,
        };
        let tx_type = match args.get("tx_type") {
            Some(value) => value.parse()?,
            None => ZmqSocketType::Rep,
        };
        if rx_type.direction() != Direction::Rx || tx_type.direction() != Direction::Tx {
            return Err(InterfaceError::InvalidConfig(format!(
                "rx_type {:?} / tx_type {:?} do not pair",
                rx_type, tx_type
            )));
        }

        let ports = |direction: Direction, socket_type: ZmqSocketType| {
            let key = format!("{}_port", direction.prefix());
            let mut list = Vec::new();
            while let Some(address) = args.get_indexed(&key, list.len()) {
                let settings = PortSettings::from_args(args, direction, list.len(), false)?;
                let ring_bytes = ring_capacity_bytes(base_srate, buffer, settings.format);
                list.push(ZmqPortConfig {
                    settings,
                    address: address.to_string(),
                    socket_type,
                    ring_bytes,
                });
            }
            Ok::<_, InterfaceError>(list)
        };

        Ok(Self {
            base_srate,
            rx_ports: ports(Direction::Rx, rx_type)?,
            tx_ports: ports(Direction::Tx, tx_type)?,
        })
    }
}

fn open_socket(context: &Context, config: &ZmqPortConfig) -> Result<Socket, InterfaceError> {
    let socket = context.socket(config.socket_type.as_zmq())?;
    socket.set_linger(0)?;
    socket.set_rcvtimeo(POLL_INTERVAL_MS)?;
    socket.set_sndtimeo(POLL_INTERVAL_MS)?;

    match config.socket_type {
        ZmqSocketType::Req => {
            socket.set_req_relaxed(true)?;
            socket.set_req_correlate(true)?;
        }
        ZmqSocketType::Sub => socket.set_subscribe(b"")?,
        _ => {}
    }

    let result = if config.socket_type.binds() {
        socket.bind(&config.address)
    } else {
        socket.connect(&config.address)
    };
    result.map_err(|e| {
        error!(
            "{}: failed to {} {}: {}",
            config.settings.label(),
            if config.socket_type.binds() { "bind" } else { "connect" },
            config.address,
            e
        );
        InterfaceError::ConnectionFailed(format!("{}: {}", config.address, e))
    })?;

    Ok(socket)
}

/// Moves received messages from the socket into the ring
struct RxPump {
    label: String,
    /// Port index reported with error events
    channel: i32,
    socket: Socket,
    socket_type: ZmqSocketType,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    bytes_per_sample: usize,
    errors: ErrorSink,
    stats: Arc<StatsCounters>,
}

impl RxPump {
    fn run(self, stop: StopToken) {
        let mut request_pending = false;
        let mut last_msg_len = 0usize;

        while !stop.is_stopped() {
            if self.socket_type == ZmqSocketType::Req && !request_pending {
                // Only ask for more once the previous answer would fit again
                if self.ring.space() < last_msg_len {
                    thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
                    continue;
                }
                match self.socket.send(&[0u8][..], 0) {
                    Ok(()) => {
                        trace!("{}: request sent", self.label);
                        request_pending = true;
                    }
                    Err(zmq::Error::EAGAIN) => continue,
                    Err(zmq::Error::ETERM) => break,
                    Err(e) => {
                        warn!("{}: failed to send request: {}", self.label, e);
                        thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
                        continue;
                    }
                }
            }

            let msg = match self.socket.recv_bytes(0) {
                Ok(msg) => {
                    request_pending = false;
                    msg
                }
                Err(zmq::Error::EAGAIN) => continue,
                Err(zmq::Error::ETERM) => break,
                Err(e) => {
                    error!("{}: receive failed: {}", self.label, e);
                    self.errors.report(
                        RfErrorEvent::new(RfErrorKind::RxError, self.channel).with_msg(e.to_string()),
                    );
                    request_pending = false;
                    continue;
                }
            };

            let usable = msg.len() - msg.len() % self.bytes_per_sample;
            if usable == 0 {
                continue;
            }
            last_msg_len = usable.min(self.ring.capacity());
            self.push(&msg[..usable]);
        }

        self.running.store(false, Ordering::Release);
        self.ring.stop();
        debug!("{}: receive pump exited", self.label);
    }

    fn push(&self, data: &[u8]) {
        if data.len() <= self.ring.space() {
            self.ring.try_write(data);
            return;
        }

        // Overflow: drop the stale backlog and keep the newest samples
        let count = self.stats.record_overrun();
        if count % LOG_EVERY == 1 {
            warn!(
                "{}: receive buffer overflow, {} buffered bytes dropped (overflow #{})",
                self.label,
                self.ring.status(),
                count
            );
        }
        self.ring.reset();
        let keep = self.ring.capacity() - self.ring.capacity() % self.bytes_per_sample;
        let start = data.len().saturating_sub(keep);
        self.ring.try_write(&data[start..]);
        self.errors.report(RfErrorEvent::new(RfErrorKind::Overflow, self.channel));
    }
}

/// Moves buffered samples from the ring to the socket
struct TxPump {
    label: String,
    socket: Socket,
    socket_type: ZmqSocketType,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    max_msg_bytes: usize,
}

impl TxPump {
    fn run(self, stop: StopToken) {
        let mut buf = vec![0u8; self.max_msg_bytes];
        let mut request_pending = false;
        let poll = Duration::from_millis(POLL_INTERVAL_MS as u64);

        while !stop.is_stopped() {
            if self.socket_type == ZmqSocketType::Rep && !request_pending {
                match self.socket.recv_bytes(0) {
                    Ok(_) => {
                        trace!("{}: request received", self.label);
                        request_pending = true;
                    }
                    Err(zmq::Error::EAGAIN) => continue,
                    Err(zmq::Error::ETERM) => break,
                    Err(e) => {
                        warn!("{}: failed to receive request: {}", self.label, e);
                        continue;
                    }
                }
            }

            let n = match self.ring.read_some_timed(&mut buf, poll) {
                Ok(n) => n,
                Err(RingBufferError::Timeout) => continue,
                Err(RingBufferError::Stopped) => break,
                Err(e) => {
                    warn!("{}: {}", self.label, e);
                    continue;
                }
            };

            // A REP socket must answer before it can take the next request,
            // so keep retrying the same reply until it goes out
            loop {
                match self.socket.send(&buf[..n], 0) {
                    Ok(()) => {
                        trace!("{}: sent {} bytes", self.label, n);
                        request_pending = false;
                        break;
                    }
                    Err(zmq::Error::EAGAIN) if !stop.is_stopped() => continue,
                    Err(zmq::Error::EAGAIN) | Err(zmq::Error::ETERM) => break,
                    Err(e) => {
                        warn!("{}: failed to send {} bytes: {}", self.label, n, e);
                        request_pending = false;
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        self.ring.stop();
        debug!("{}: transmit pump exited", self.label);
    }
}

/// Receive port backed by a REQ or SUB socket
pub struct ZmqRxPort {
    settings: PortSettings,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
    scratch: Vec<u8>,
    stats: Arc<StatsCounters>,
}

impl ZmqRxPort {
    /// Connect the socket and start the receive pump
    pub fn open(
        context: &Context,
        config: &ZmqPortConfig,
        errors: ErrorSink,
        stats: Arc<StatsCounters>,
    ) -> Result<Self, InterfaceError> {
        let socket = open_socket(context, config)?;
        let label = config.settings.label();
        let ring = Arc::new(RingBuffer::new(config.ring_bytes));
        let running = Arc::new(AtomicBool::new(true));

        let pump = RxPump {
            label: label.clone(),
            channel: config.settings.index as i32,
            socket,
            socket_type: config.socket_type,
            ring: ring.clone(),
            running: running.clone(),
            bytes_per_sample: config.settings.format.bytes_per_sample(),
            errors,
            stats: stats.clone(),
        };
        let worker = Worker::spawn(format!("zmq-{}", label), move |stop| pump.run(stop))?;

        info!(
            "{}: receiving from {} ({:?}, {}, {} MHz)",
            label, config.address, config.socket_type, config.settings.format, config.settings.frequency_mhz
        );

        Ok(Self {
            settings: config.settings.clone(),
            ring,
            running,
            worker: Some(worker),
            scratch: Vec::new(),
            stats,
        })
    }
}

impl RxPort for ZmqRxPort {
    fn settings(&self) -> &PortSettings {
        &self.settings
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn receive(&mut self, dst: &mut [Complex32]) -> Result<usize, InterfaceError> {
        if !self.is_running() {
            return Err(InterfaceError::Closed);
        }
        if dst.is_empty() {
            return Ok(0);
        }

        let format = self.settings.format;
        let max_bytes = self.ring.capacity() - self.ring.capacity() % format.bytes_per_sample();
        let nbytes = format.samples_to_bytes(dst.len()).min(max_bytes);
        self.scratch.resize(nbytes, 0);

        match self.ring.read_timed(&mut self.scratch, self.settings.timeout) {
            Ok(_) => {
                let n = decode_samples(format, &self.scratch, dst);
                self.stats.record_rx(n);
                Ok(n)
            }
            Err(RingBufferError::Timeout) => {
                let count = self.stats.record_rx_timeout();
                if self.settings.fail_on_disconnect {
                    error!("{}: no samples within {:?}", self.settings.label(), self.settings.timeout);
                    return Err(InterfaceError::Timeout(self.settings.timeout));
                }
                if count % LOG_EVERY == 1 {
                    warn!(
                        "{}: no samples within {:?}, substituting zeros (timeout #{})",
                        self.settings.label(),
                        self.settings.timeout,
                        count
                    );
                }
                dst.fill(Complex32::new(0.0, 0.0));
                Ok(dst.len())
            }
            Err(e) => Err(InterfaceError::from_ring(e, self.settings.timeout)),
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(mut worker) = self.worker.take() {
            worker.signal();
            self.ring.stop();
            worker.join();
            info!("{}: closed", self.settings.label());
        }
    }
}

impl Drop for ZmqRxPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// Transmit port backed by a REP or PUB socket
pub struct ZmqTxPort {
    settings: PortSettings,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
    scratch: BytesMut,
    sample_count: u64,
    /// Set after a timed out write; cleared once the peer drains again
    stalled: bool,
    stats: Arc<StatsCounters>,
}

impl ZmqTxPort {
    /// Bind the socket and start the transmit pump
    pub fn open(
        context: &Context,
        config: &ZmqPortConfig,
        stats: Arc<StatsCounters>,
    ) -> Result<Self, InterfaceError> {
        let socket = open_socket(context, config)?;
        let label = config.settings.label();
        let ring = Arc::new(RingBuffer::new(config.ring_bytes));
        let running = Arc::new(AtomicBool::new(true));
        let max_msg_bytes = config
            .settings
            .format
            .samples_to_bytes(MAX_MSG_SAMPLES)
            .min(ring.capacity());

        let pump = TxPump {
            label: label.clone(),
            socket,
            socket_type: config.socket_type,
            ring: ring.clone(),
            running: running.clone(),
            max_msg_bytes,
        };
        let worker = Worker::spawn(format!("zmq-{}", label), move |stop| pump.run(stop))?;

        info!(
            "{}: serving on {} ({:?}, {}, {} MHz)",
            label, config.address, config.socket_type, config.settings.format, config.settings.frequency_mhz
        );

        Ok(Self {
            settings: config.settings.clone(),
            ring,
            running,
            worker: Some(worker),
            scratch: BytesMut::new(),
            sample_count: 0,
            stalled: false,
            stats,
        })
    }

    fn write_chunk(&mut self, start: usize, end: usize) -> Result<(), RingBufferError> {
        let chunk = &self.scratch[start..end];
        if self.stalled {
            if self.ring.space() < chunk.len() {
                return Err(RingBufferError::Timeout);
            }
            self.stalled = false;
            debug!("{}: peer draining again", self.settings.label());
        }
        self.ring.write_timed(chunk, self.settings.timeout).map(|_| ())
    }
}

impl TxPort for ZmqTxPort {
    fn settings(&self) -> &PortSettings {
        &self.settings
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn transmit(&mut self, samples: &[Complex32]) -> Result<usize, InterfaceError> {
        if !self.is_running() {
            return Err(InterfaceError::Closed);
        }

        let format = self.settings.format;
        self.scratch.clear();
        encode_samples(format, samples, &mut self.scratch);

        let chunk_bytes = self.ring.capacity() - self.ring.capacity() % format.bytes_per_sample();
        let total = self.scratch.len();
        let mut written = 0;

        while written < total {
            let end = (written + chunk_bytes).min(total);
            match self.write_chunk(written, end) {
                Ok(()) => written = end,
                Err(RingBufferError::Timeout) => {
                    if !self.stalled {
                        warn!(
                            "{}: peer not draining for {:?}, dropping samples",
                            self.settings.label(),
                            self.settings.timeout
                        );
                    }
                    self.stalled = true;
                    if self.settings.fail_on_disconnect {
                        self.sample_count += format.bytes_to_samples(written) as u64;
                        return Err(InterfaceError::Timeout(self.settings.timeout));
                    }
                    break;
                }
                Err(e) => return Err(InterfaceError::from_ring(e, self.settings.timeout)),
            }
        }

        // Dropped samples still advance the count so timing stays consistent
        self.sample_count += samples.len() as u64;
        self.stats.record_tx(samples.len());
        Ok(samples.len())
    }

    fn sample_count(&self) -> u64 {
        self.sample_count
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(mut worker) = self.worker.take() {
            worker.signal();
            self.ring.stop();
            worker.join();
            info!(
                "{}: closed after {} samples",
                self.settings.label(),
                self.sample_count
            );
        }
    }
}

impl Drop for ZmqTxPort {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::Rng;
    use std::time::Instant;

    fn config(args: &str) -> ZmqRfConfig {
        ZmqRfConfig::from_device_args(&DeviceArgs::parse(args)).unwrap()
    }

    fn random_samples(n: usize) -> Vec<Complex32> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    fn receive_exact(port: &mut ZmqRxPort, n: usize) -> Vec<Complex32> {
        let mut out = vec![Complex32::new(0.0, 0.0); n];
        let mut filled = 0;
        while filled < n {
            filled += port.receive(&mut out[filled..]).unwrap();
        }
        out
    }

    #[test]
    fn test_config_from_device_args() {
        let cfg = config(
            "base_srate=1.92e6,tx_port=tcp://*:2000,tx_port1=tcp://*:2002,rx_port=tcp://localhost:2001,\
             rx_freq0=2680e6,tx_format1=sc16",
        );
        assert_eq!(cfg.base_srate, 1.92e6);
        assert_eq!(cfg.tx_ports.len(), 2);
        assert_eq!(cfg.rx_ports.len(), 1);
        assert_eq!(cfg.tx_ports[1].address, "tcp://*:2002");
        assert_eq!(cfg.tx_ports[1].socket_type, ZmqSocketType::Rep);
        assert_eq!(cfg.tx_ports[1].settings.format, common::SampleFormat::Sc16);
        assert_eq!(cfg.rx_ports[0].socket_type, ZmqSocketType::Req);
        assert_eq!(cfg.rx_ports[0].settings.frequency_mhz, 2680);
        assert_eq!(cfg.rx_ports[0].ring_bytes, 192_000 * 8);
    }

    #[test]
    fn test_config_rejects_mismatched_types() {
        let args = DeviceArgs::parse("rx_type=rep,tx_port=tcp://*:2000");
        assert!(ZmqRfConfig::from_device_args(&args).is_err());
        let args = DeviceArgs::parse("base_srate=-1");
        assert!(ZmqRfConfig::from_device_args(&args).is_err());
    }

    #[test]
    fn test_req_rep_transfer() {
        let ctx = shared_context();
        let cfg = config("base_srate=1.92e6,tx_port=inproc://zmq-rf-reqrep,rx_port=inproc://zmq-rf-reqrep");
        let stats = StatsCounters::new();

        let mut tx = ZmqTxPort::open(&ctx, &cfg.tx_ports[0], stats.clone()).unwrap();
        let mut rx = ZmqRxPort::open(&ctx, &cfg.rx_ports[0], ErrorSink::new(), stats.clone()).unwrap();

        let samples = random_samples(5000);
        assert_eq!(tx.transmit(&samples).unwrap(), 5000);
        assert_eq!(tx.sample_count(), 5000);

        let received = receive_exact(&mut rx, 5000);
        assert_eq!(received, samples);
        assert_eq!(stats.snapshot().rx_samples, 5000);

        rx.close();
        tx.close();
        assert!(!rx.is_running());
        assert!(matches!(rx.receive(&mut [Complex32::new(0.0, 0.0); 4]), Err(InterfaceError::Closed)));
    }

    #[test]
    fn test_sc16_transfer_quantizes() {
        let ctx = shared_context();
        let cfg = config(
            "base_srate=1.92e6,tx_port=inproc://zmq-rf-sc16,rx_port=inproc://zmq-rf-sc16,tx_format=sc16,rx_format=sc16",
        );
        let stats = StatsCounters::new();
        let mut tx = ZmqTxPort::open(&ctx, &cfg.tx_ports[0], stats.clone()).unwrap();
        let mut rx = ZmqRxPort::open(&ctx, &cfg.rx_ports[0], ErrorSink::new(), stats).unwrap();

        let samples = random_samples(1000);
        tx.transmit(&samples).unwrap();
        let received = receive_exact(&mut rx, 1000);

        for (a, b) in samples.iter().zip(&received) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn test_pub_sub_transfer() {
        let ctx = shared_context();
        let cfg = config(
            "base_srate=1.92e6,tx_type=pub,rx_type=sub,tx_port=inproc://zmq-rf-pubsub,rx_port=inproc://zmq-rf-pubsub",
        );
        let stats = StatsCounters::new();
        let mut tx = ZmqTxPort::open(&ctx, &cfg.tx_ports[0], stats.clone()).unwrap();
        let mut rx = ZmqRxPort::open(&ctx, &cfg.rx_ports[0], ErrorSink::new(), stats).unwrap();

        // Give the subscription time to propagate
        thread::sleep(Duration::from_millis(200));

        let samples = random_samples(2048);
        tx.transmit(&samples).unwrap();
        assert_eq!(receive_exact(&mut rx, 2048), samples);
    }

    #[test]
    fn test_rx_timeout_policy() {
        let ctx = shared_context();
        let cfg = config("rx_port=inproc://zmq-rf-nobody,trx_timeout_ms=50,fail_on_disconnect=true");
        let stats = StatsCounters::new();
        let mut rx = ZmqRxPort::open(&ctx, &cfg.rx_ports[0], ErrorSink::new(), stats.clone()).unwrap();

        let mut buf = vec![Complex32::new(1.0, 1.0); 100];
        let start = Instant::now();
        assert!(matches!(rx.receive(&mut buf), Err(InterfaceError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));

        let cfg = config("rx_port=inproc://zmq-rf-nobody2,trx_timeout_ms=50");
        let mut rx = ZmqRxPort::open(&ctx, &cfg.rx_ports[0], ErrorSink::new(), stats.clone()).unwrap();
        assert_eq!(rx.receive(&mut buf).unwrap(), 100);
        assert!(buf.iter().all(|s| s.norm() == 0.0));
        assert_eq!(stats.snapshot().rx_timeouts, 2);
    }

    #[test]
    fn test_tx_without_peer_drops_after_timeout() {
        let ctx = shared_context();
        let cfg = config("base_srate=1e3,tx_port=inproc://zmq-rf-lonely,trx_timeout_ms=20");
        let mut tx = ZmqTxPort::open(&ctx, &cfg.tx_ports[0], StatsCounters::new()).unwrap();

        // More than the ring holds; the excess is dropped but still counted
        let n = crate::port::MIN_RING_SAMPLES + 100;
        let samples = random_samples(n);
        assert_eq!(tx.transmit(&samples).unwrap(), n);
        assert_eq!(tx.sample_count(), n as u64);

        let start = Instant::now();
        tx.transmit(&samples[..10]).unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_overflow_keeps_newest_and_reports_channel() {
        let ctx = shared_context();
        let errors = ErrorSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        errors.register(Arc::new(move |e: RfErrorEvent| sink.lock().push((e.kind, e.opt))));
        let stats = StatsCounters::new();

        let pump = RxPump {
            label: "rx3".to_string(),
            channel: 3,
            socket: ctx.socket(zmq::SUB).unwrap(),
            socket_type: ZmqSocketType::Sub,
            ring: Arc::new(RingBuffer::new(64)),
            running: Arc::new(AtomicBool::new(true)),
            bytes_per_sample: 8,
            errors,
            stats: stats.clone(),
        };

        pump.push(&[1u8; 48]);
        assert!(seen.lock().is_empty());

        // 48 buffered + 32 new does not fit: the backlog is dropped
        pump.push(&[2u8; 32]);
        assert_eq!(stats.snapshot().rx_overruns, 1);
        assert_eq!(*seen.lock(), vec![(RfErrorKind::Overflow, 3)]);
        assert_eq!(pump.ring.status(), 32);
        let mut out = [0u8; 32];
        pump.ring.read(&mut out).unwrap();
        assert_eq!(out, [2u8; 32]);

        // A message larger than the ring keeps its newest whole samples
        let big: Vec<u8> = (0..100u8).collect();
        pump.push(&big);
        assert_eq!(stats.snapshot().rx_overruns, 2);
        let mut out = [0u8; 64];
        pump.ring.read(&mut out).unwrap();
        assert_eq!(out[0], 36);
        assert_eq!(out[63], 99);
    }

    #[test]
    fn test_unread_subscriber_overflows() {
        let ctx = shared_context();
        let cfg = config(
            "base_srate=1.92e6,buffer_ms=1,tx_type=pub,rx_type=sub,\
             tx_port=inproc://zmq-rf-flood,rx_port=inproc://zmq-rf-flood",
        );
        let errors = ErrorSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        errors.register(Arc::new(move |e: RfErrorEvent| sink.lock().push((e.kind, e.opt))));
        let stats = StatsCounters::new();

        let mut tx = ZmqTxPort::open(&ctx, &cfg.tx_ports[0], stats.clone()).unwrap();
        let _rx = ZmqRxPort::open(&ctx, &cfg.rx_ports[0], errors, stats.clone()).unwrap();
        thread::sleep(Duration::from_millis(200));

        // Three times what the receive ring holds, never read
        let samples = random_samples(crate::port::MIN_RING_SAMPLES);
        for _ in 0..3 {
            tx.transmit(&samples).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.snapshot().rx_overruns == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(stats.snapshot().rx_overruns > 0);
        assert!(seen.lock().iter().all(|&(kind, opt)| kind == RfErrorKind::Overflow && opt == 0));
        assert!(!seen.lock().is_empty());
    }
}
