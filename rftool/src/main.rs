//! RF Stream Tool
//!
//! Opens a radio device by name and streams 1 ms subframes through it:
//! transmit only, receive only, or transmit and verify the received copy.

mod config;

use anyhow::Result;
use clap::Parser;
use common::TimeSpec;
use config::{StreamConfig, StreamMode};
use interfaces::RfStats;
use num_complex::Complex32;
use radio::{Radio, RadioError};
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Largest per-sample error accepted by the loopback check (sc16 quantization)
const MAX_SAMPLE_ERROR: f32 = 1e-3;

/// Radio frontend streaming tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Device driver (zmq, file, loopback); empty tries every backend
    #[arg(short, long)]
    device: Option<String>,

    /// Device arguments (e.g., "tx_port=tcp://*:2000,rx_port=tcp://localhost:2001,base_srate=23.04e6")
    #[arg(short, long)]
    args: Option<String>,

    #[arg(short, long, value_enum)]
    mode: Option<StreamMode>,

    /// Sample rate in MHz
    #[arg(long)]
    srate: Option<f64>,

    /// Center frequency in MHz
    #[arg(long)]
    freq: Option<f64>,

    /// Number of subframes to stream
    #[arg(long)]
    subframes: Option<usize>,

    /// Number of channels
    #[arg(long)]
    channels: Option<usize>,

    /// Transmit lead in subframes
    #[arg(long)]
    delay: Option<usize>,

    /// Transmit gain in dB
    #[arg(long)]
    tx_gain: Option<f64>,

    /// Receive gain in dB
    #[arg(long)]
    rx_gain: Option<f64>,
}

impl Args {
    /// Overlay every flag given on the command line
    fn apply(&self, config: &mut StreamConfig) {
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(device) = &self.device {
            config.ru_sdr.device_driver = device.clone();
        }
        if let Some(args) = &self.args {
            config.ru_sdr.device_args = args.clone();
        }
        if let Some(srate) = self.srate {
            config.ru_sdr.srate = srate;
        }
        if let Some(freq) = self.freq {
            config.ru_sdr.freq = freq;
        }
        if let Some(gain) = self.tx_gain {
            config.ru_sdr.tx_gain = gain;
        }
        if let Some(gain) = self.rx_gain {
            config.ru_sdr.rx_gain = gain;
        }
        if let Some(mode) = self.mode {
            config.stream.mode = mode;
        }
        if let Some(subframes) = self.subframes {
            config.stream.subframes = subframes;
        }
        if let Some(channels) = self.channels {
            config.stream.channels = channels;
        }
        if let Some(delay) = self.delay {
            config.stream.delay = delay;
        }
    }
}

/// Outcome of one streaming run
#[derive(Debug, Default)]
struct StreamReport {
    subframes: usize,
    /// Subframes that came back different from what was sent
    mismatches: usize,
    /// Send calls dropped by burst recovery
    interrupted: usize,
    stats: RfStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StreamConfig::from_yaml_file(path)?,
        None => StreamConfig::default(),
    };
    args.apply(&mut config);

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    config.validate()?;
    info!("Starting RF stream tool");
    info!("  Device: {}", config.ru_sdr.device_driver);
    info!("  Arguments: {}", config.ru_sdr.device_args);
    info!("  Mode: {:?}", config.stream.mode);
    info!("  Sample rate: {} MHz", config.ru_sdr.srate);
    info!("  Subframes: {}", config.stream.subframes);

    let stop = Arc::new(AtomicBool::new(false));
    let mut stream = {
        let stop = stop.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || run(&config, &stop))
    };

    // Wait for the stream to finish or a shutdown signal
    let finished = tokio::select! {
        result = &mut stream => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let report = match finished {
        Some(result) => result??,
        None => {
            info!("Received shutdown signal");
            stop.store(true, Ordering::Release);
            stream.await??
        }
    };

    log_report(&report);
    if report.mismatches > 0 {
        error!("{} of {} subframes did not match", report.mismatches, report.subframes);
        return Err(anyhow::anyhow!("loopback verification failed"));
    }

    info!("RF stream complete");
    Ok(())
}

fn log_report(report: &StreamReport) {
    let stats = &report.stats;
    info!("Stream statistics:");
    info!("  Subframes: {}", report.subframes);
    info!("  TX samples: {}, RX samples: {}", stats.tx_samples, stats.rx_samples);
    info!("  TX underruns: {}, RX overruns: {}", stats.tx_underruns, stats.rx_overruns);
    info!("  TX late: {}, RX timeouts: {}", stats.tx_late, stats.rx_timeouts);
    if report.interrupted > 0 {
        info!("  Interrupted sends: {}", report.interrupted);
    }
}

/// Open the device, stream, close. Runs on a blocking thread.
fn run(config: &StreamConfig, stop: &AtomicBool) -> Result<StreamReport> {
    let channels = config.stream.channels;
    let radio = Radio::open(&config.ru_sdr.device_driver, &config.ru_sdr.device_args, channels)?;
    info!("Opened {} device", radio.name());

    let srate = config.srate_hz();
    radio.set_tx_srate(srate)?;
    radio.set_rx_srate(srate)?;
    for ch in 0..channels {
        radio.set_tx_freq(ch, config.ru_sdr.freq * 1e6)?;
        radio.set_rx_freq(ch, config.ru_sdr.freq * 1e6)?;
    }
    radio.set_tx_gain_all(config.ru_sdr.tx_gain)?;
    radio.set_rx_gain_all(config.ru_sdr.rx_gain)?;
    radio.register_error_handler(Arc::new(|event: common::RfErrorEvent| {
        warn!("RF error: {} (opt {})", event.kind, event.opt);
    }));

    let mut report = match config.stream.mode {
        StreamMode::Tx => transmit(&radio, config, stop)?,
        StreamMode::Rx => receive(&radio, config, stop)?,
        StreamMode::Loopback => loopback(&radio, config, stop)?,
    };

    report.stats = radio.stats();
    radio.close()?;
    Ok(report)
}

fn random_subframe(rng: &mut impl Rng, len: usize) -> Vec<Complex32> {
    (0..len)
        .map(|_| Complex32::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5)))
        .collect()
}

fn subframe_time(sf: usize, config: &StreamConfig) -> TimeSpec {
    TimeSpec::from_samples((sf * config.subframe_len()) as u64, config.srate_hz())
}

/// Send subframe `sf` on channel 0; interrupted bursts are counted, not fatal
fn send_subframe(
    radio: &Radio,
    data: &[Complex32],
    sf: usize,
    last: bool,
    config: &StreamConfig,
    report: &mut StreamReport,
) -> Result<()> {
    match radio.send_timed(data, Some(subframe_time(sf, config)), sf == 0, last) {
        Ok(_) => Ok(()),
        Err(RadioError::BurstInterrupted(reason)) => {
            debug!("Subframe {} dropped: {}", sf, reason);
            report.interrupted += 1;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn transmit(radio: &Radio, config: &StreamConfig, stop: &AtomicBool) -> Result<StreamReport> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let mut report = StreamReport::default();
    let total = config.stream.subframes;

    for sf in 0..total {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let data = random_subframe(&mut rng, config.subframe_len());
        send_subframe(radio, &data, sf, sf + 1 == total, config, &mut report)?;
        report.subframes += 1;
    }
    Ok(report)
}

fn receive(radio: &Radio, config: &StreamConfig, stop: &AtomicBool) -> Result<StreamReport> {
    let mut report = StreamReport::default();
    let mut buffer = vec![Complex32::new(0.0, 0.0); config.subframe_len()];
    radio.start_rx_stream(true)?;

    while report.subframes < config.stream.subframes && !stop.load(Ordering::Acquire) {
        match radio.recv_with_time(&mut buffer, true) {
            Ok((_, time)) => {
                let power = buffer.iter().map(|s| s.norm_sqr()).sum::<f32>() / buffer.len() as f32;
                debug!("Subframe at {:.6} s, mean power {:.3e}", time.as_secs_f64(), power);
                report.subframes += 1;
            }
            Err(RadioError::Timeout) => warn!("Receive timed out, retrying"),
            Err(e) => return Err(e.into()),
        }
    }

    radio.stop_rx_stream()?;
    Ok(report)
}

/// Send every subframe `delay` subframes ahead of the receive clock and check
/// it arrives unchanged
fn loopback(radio: &Radio, config: &StreamConfig, stop: &AtomicBool) -> Result<StreamReport> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let mut report = StreamReport::default();
    let total = config.stream.subframes;
    let delay = config.stream.delay;
    let sf_len = config.subframe_len();

    let sent: Vec<Vec<Complex32>> = (0..total).map(|_| random_subframe(&mut rng, sf_len)).collect();
    let mut buffer = vec![Complex32::new(0.0, 0.0); sf_len];
    radio.start_rx_stream(true)?;

    for sf in 0..total + delay {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let (_, time) = radio.recv_with_time(&mut buffer, true)?;
        if sf >= delay {
            let expected = &sent[sf - delay];
            let max_error = expected
                .iter()
                .zip(&buffer)
                .map(|(a, b)| (a - b).norm())
                .fold(0.0f32, f32::max);
            if max_error > MAX_SAMPLE_ERROR {
                warn!(
                    "Subframe {} at {:.6} s differs, max error {:.3e}",
                    sf - delay,
                    time.as_secs_f64(),
                    max_error
                );
                report.mismatches += 1;
            }
            report.subframes += 1;
        }

        if sf < total {
            send_subframe(radio, &sent[sf], sf + delay, sf + 1 == total, config, &mut report)?;
        }
    }

    radio.stop_rx_stream()?;
    Ok(report)
}
