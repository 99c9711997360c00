//! File Backend
//!
//! Synchronous backend: ports read and write raw sample files inline on the
//! caller's thread.

use crate::handler::{DeviceHandler, HandlerConfig};
use crate::registry::DeviceFactory;
use crate::{RadioError, RfDevice};
use common::DeviceArgs;
use interfaces::file_rf::{FileRfConfig, FileRxPort, FileTxPort};
use interfaces::{ErrorSink, RxPort, StatsCounters, TxPort};
use tracing::error;

pub const FILE_DEVICE: &str = "file";

/// Open a file-backed device
pub fn open(args: &DeviceArgs, nof_channels: usize) -> Result<DeviceHandler, RadioError> {
    let config = FileRfConfig::from_device_args(args)?;
    if config.rx_files.is_empty() && config.tx_files.is_empty() {
        error!("file device needs at least one rx_file or tx_file");
        return Err(RadioError::InvalidArgument("no rx_file or tx_file given".into()));
    }

    let stats = StatsCounters::new();

    let mut rx_ports: Vec<Box<dyn RxPort>> = Vec::with_capacity(config.rx_files.len());
    for (settings, path) in config.rx_files {
        rx_ports.push(Box::new(FileRxPort::open(settings, path, stats.clone())?));
    }

    let mut tx_ports: Vec<Box<dyn TxPort>> = Vec::with_capacity(config.tx_files.len());
    for (settings, path) in config.tx_files {
        tx_ports.push(Box::new(FileTxPort::create(settings, path, stats.clone())?));
    }

    let handler_config = HandlerConfig::from_args(FILE_DEVICE, args, nof_channels, config.base_srate)?;
    Ok(DeviceHandler::new(
        handler_config,
        rx_ports,
        tx_ports,
        ErrorSink::new(),
        stats,
    ))
}

/// Registry entry for the file backend
pub struct FileFactory;

impl DeviceFactory for FileFactory {
    fn name(&self) -> &'static str {
        FILE_DEVICE
    }

    fn open(&self, args: &DeviceArgs, nof_channels: usize) -> Result<Box<dyn RfDevice>, RadioError> {
        Ok(Box::new(open(args, nof_channels)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TimeSpec;
    use num_complex::Complex32;
    use rand::{Rng, SeedableRng};
    use std::path::Path;

    const NUM_SF: usize = 10;
    const SRATE: f64 = 1.92e6;
    const SF_LEN: usize = 1920;

    fn random_blocks(seed: u64) -> Vec<Vec<Complex32>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..NUM_SF)
            .map(|_| {
                (0..SF_LEN)
                    .map(|_| Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
                    .collect()
            })
            .collect()
    }

    fn device(args: String) -> DeviceHandler {
        open(&DeviceArgs::parse(&args), 1).unwrap()
    }

    fn read_all(rx: &DeviceHandler, nsamples: usize) -> Vec<Complex32> {
        let mut out = vec![Complex32::new(0.0, 0.0); nsamples];
        let mut filled = 0;
        while filled < nsamples {
            let n = SF_LEN.min(nsamples - filled);
            rx.recv_with_time_multi(&mut [Some(&mut out[filled..filled + n])], n, true)
                .unwrap();
            filled += n;
        }
        out
    }

    fn path_arg(path: &Path) -> String {
        path.display().to_string()
    }

    #[test]
    fn test_file_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iq.bin");
        let blocks = random_blocks(1);

        let tx = device(format!("base_srate={},tx_file={}", SRATE, path_arg(&path)));
        for block in &blocks {
            assert_eq!(
                tx.send_timed_multi(&[Some(&block[..])], SF_LEN, None, true, false, false).unwrap(),
                SF_LEN
            );
        }
        tx.close().unwrap();

        let rx = device(format!("base_srate={},rx_file={}", SRATE, path_arg(&path)));
        for (sf, block) in blocks.iter().enumerate() {
            let mut out = vec![Complex32::new(0.0, 0.0); SF_LEN];
            let (n, ts) = rx.recv_with_time_multi(&mut [Some(&mut out[..])], SF_LEN, true).unwrap();
            assert_eq!(n, SF_LEN);
            assert!((ts.as_secs_f64() - sf as f64 * 1e-3).abs() < 1e-9);
            for (a, b) in block.iter().zip(&out) {
                assert!((a - b).norm() < f32::EPSILON);
            }
        }

        // The file is exhausted
        let mut out = vec![Complex32::new(0.0, 0.0); SF_LEN];
        let err = rx.recv_with_time_multi(&mut [Some(&mut out[..])], SF_LEN, true).unwrap_err();
        assert_eq!(err.code(), -8);
        assert_eq!(rx.stats().rx_samples, (NUM_SF * SF_LEN) as u64);
    }

    #[test]
    fn test_file_loopback_timed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timed.bin");
        let blocks = random_blocks(2);
        let offset = 480;

        let tx = device(format!("base_srate={},tx_file={},tx_format=sc16", SRATE, path_arg(&path)));
        for (sf, block) in blocks.iter().enumerate() {
            let at = TimeSpec::from_samples((offset + sf * SF_LEN) as u64, SRATE);
            tx.send_timed_multi(&[Some(&block[..])], SF_LEN, Some(at), true, sf == 0, false)
                .unwrap();
        }
        tx.close().unwrap();

        let rx = device(format!("base_srate={},rx_file={},rx_format=sc16", SRATE, path_arg(&path)));
        let out = read_all(&rx, offset + NUM_SF * SF_LEN);

        assert!(out[..offset].iter().all(|s| s.norm() == 0.0));
        let sent: Vec<Complex32> = blocks.concat();
        for (a, b) in sent.iter().zip(&out[offset..]) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn test_file_loopback_with_decimation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decim.bin");
        let blocks = random_blocks(3);

        let tx = device(format!("base_srate={},tx_file={}", 2.0 * SRATE, path_arg(&path)));
        tx.set_tx_srate(SRATE).unwrap();
        for block in &blocks {
            tx.send_timed_multi(&[Some(&block[..])], SF_LEN, None, true, false, false).unwrap();
        }
        tx.close().unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (2 * NUM_SF * SF_LEN * 8) as u64
        );

        let rx = device(format!("base_srate={},rx_file={}", 2.0 * SRATE, path_arg(&path)));
        rx.set_rx_srate(SRATE).unwrap();
        let out = read_all(&rx, NUM_SF * SF_LEN);
        for (a, b) in blocks.concat().iter().zip(&out) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn test_open_errors() {
        let err = open(&DeviceArgs::parse("rx_file=/tmp/whatever.bin"), 1).err().unwrap();
        assert_eq!(err.code(), -2);

        let err = open(&DeviceArgs::parse("base_srate=1.92e6"), 1).err().unwrap();
        assert_eq!(err.code(), -2);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");
        let args = format!("base_srate=1.92e6,rx_file={}", path_arg(&missing));
        assert!(open(&DeviceArgs::parse(&args), 1).is_err());
    }
}
