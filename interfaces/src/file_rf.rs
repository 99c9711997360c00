//! File RF Transport
//!
//! Rx ports replay raw interleaved I/Q samples from a file and Tx ports record
//! them, in the port's wire format. Files carry no header.

use crate::port::{Direction, PortSettings, RxPort, TxPort};
use crate::{InterfaceError, StatsCounters};
use bytes::BytesMut;
use common::{decode_samples, encode_samples, ArgsError, DeviceArgs};
use num_complex::Complex32;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// File RF configuration
#[derive(Debug, Clone)]
pub struct FileRfConfig {
    pub base_srate: f64,
    pub rx_files: Vec<(PortSettings, PathBuf)>,
    pub tx_files: Vec<(PortSettings, PathBuf)>,
}

impl FileRfConfig {
    /// Parse `base_srate` (mandatory) and the contiguous `rx_file<n>`/`tx_file<n>` lists
    pub fn from_device_args(args: &DeviceArgs) -> Result<Self, InterfaceError> {
        let base_srate = args.require_f64("base_srate").map_err(|e| match e {
            ArgsError::Missing(_) => {
                InterfaceError::InvalidConfig("file backend requires base_srate".to_string())
            }
            other => InterfaceError::InvalidConfig(other.to_string()),
        })?;
        if base_srate <= 0.0 {
            return Err(InterfaceError::InvalidConfig(format!("base_srate={}", base_srate)));
        }

        let files = |direction: Direction| {
            let key = format!("{}_file", direction.prefix());
            let mut list = Vec::new();
            while let Some(path) = args.get_indexed(&key, list.len()) {
                let settings = PortSettings::from_args(args, direction, list.len(), true)?;
                list.push((settings, PathBuf::from(path)));
            }
            Ok::<_, InterfaceError>(list)
        };

        Ok(Self {
            base_srate,
            rx_files: files(Direction::Rx)?,
            tx_files: files(Direction::Tx)?,
        })
    }
}

/// Receive port reading samples from a file
pub struct FileRxPort {
    settings: PortSettings,
    path: PathBuf,
    reader: Option<BufReader<File>>,
    scratch: Vec<u8>,
    at_eof: bool,
    stats: Arc<StatsCounters>,
}

impl FileRxPort {
    pub fn open(
        settings: PortSettings,
        path: impl AsRef<Path>,
        stats: Arc<StatsCounters>,
    ) -> Result<Self, InterfaceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            error!("{}: cannot open {}: {}", settings.label(), path.display(), e);
            e
        })?;
        info!(
            "{}: reading {} samples from {}",
            settings.label(),
            settings.format,
            path.display()
        );

        Ok(Self {
            settings,
            path,
            reader: Some(BufReader::new(file)),
            scratch: Vec::new(),
            at_eof: false,
            stats,
        })
    }

    /// Read up to `nbytes` into the scratch buffer, stopping early at EOF
    fn fill(&mut self, nbytes: usize) -> Result<usize, InterfaceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(InterfaceError::Closed);
        };
        self.scratch.resize(nbytes, 0);

        let mut got = 0;
        while got < nbytes {
            match reader.read(&mut self.scratch[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(got)
    }
}

impl RxPort for FileRxPort {
    fn settings(&self) -> &PortSettings {
        &self.settings
    }

    fn is_running(&self) -> bool {
        self.reader.is_some()
    }

    fn receive(&mut self, dst: &mut [Complex32]) -> Result<usize, InterfaceError> {
        if self.reader.is_none() {
            return Err(InterfaceError::Closed);
        }
        if dst.is_empty() {
            return Ok(0);
        }

        let format = self.settings.format;
        let got = if self.at_eof {
            0
        } else {
            self.fill(format.samples_to_bytes(dst.len()))?
        };

        let n = decode_samples(format, &self.scratch[..got], dst);
        if n > 0 {
            self.stats.record_rx(n);
            return Ok(n);
        }

        if !self.at_eof {
            info!("{}: end of {}", self.settings.label(), self.path.display());
            self.at_eof = true;
        }
        if self.settings.fail_on_disconnect {
            return Err(InterfaceError::EndOfStream);
        }
        dst.fill(Complex32::new(0.0, 0.0));
        Ok(dst.len())
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!("{}: closed {}", self.settings.label(), self.path.display());
        }
    }
}

/// Transmit port writing samples to a file
pub struct FileTxPort {
    settings: PortSettings,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    scratch: BytesMut,
    sample_count: u64,
    stats: Arc<StatsCounters>,
}

impl FileTxPort {
    /// Create (or truncate) the output file
    pub fn create(
        settings: PortSettings,
        path: impl AsRef<Path>,
        stats: Arc<StatsCounters>,
    ) -> Result<Self, InterfaceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| {
            error!("{}: cannot create {}: {}", settings.label(), path.display(), e);
            e
        })?;
        info!(
            "{}: writing {} samples to {}",
            settings.label(),
            settings.format,
            path.display()
        );

        Ok(Self {
            settings,
            path,
            writer: Some(BufWriter::new(file)),
            scratch: BytesMut::new(),
            sample_count: 0,
            stats,
        })
    }
}

impl TxPort for FileTxPort {
    fn settings(&self) -> &PortSettings {
        &self.settings
    }

    fn is_running(&self) -> bool {
        self.writer.is_some()
    }

    fn transmit(&mut self, samples: &[Complex32]) -> Result<usize, InterfaceError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(InterfaceError::Closed);
        };

        self.scratch.clear();
        encode_samples(self.settings.format, samples, &mut self.scratch);
        writer.write_all(&self.scratch)?;

        self.sample_count += samples.len() as u64;
        self.stats.record_tx(samples.len());
        Ok(samples.len())
    }

    fn sample_count(&self) -> u64 {
        self.sample_count
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("{}: failed to flush {}: {}", self.settings.label(), self.path.display(), e);
            }
            info!(
                "{}: closed {} after {} samples",
                self.settings.label(),
                self.path.display(),
                self.sample_count
            );
        }
    }
}

impl Drop for FileTxPort {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SampleFormat;

    fn settings(direction: Direction, format: SampleFormat, fail: bool) -> PortSettings {
        let args = DeviceArgs::parse(&format!(
            "{}_format={},fail_on_disconnect={}",
            direction.prefix(),
            format,
            fail
        ));
        PortSettings::from_args(&args, direction, 0, true).unwrap()
    }

    fn ramp(n: usize) -> Vec<Complex32> {
        (0..n)
            .map(|i| Complex32::new(i as f32 / n as f32, -(i as f32) / n as f32))
            .collect()
    }

    #[test]
    fn test_config_requires_base_srate() {
        let args = DeviceArgs::parse("rx_file=/tmp/in.bin");
        assert!(matches!(
            FileRfConfig::from_device_args(&args),
            Err(InterfaceError::InvalidConfig(_))
        ));

        let args = DeviceArgs::parse("base_srate=1.92e6,rx_file=/tmp/a,rx_file1=/tmp/b,tx_file0=/tmp/c");
        let cfg = FileRfConfig::from_device_args(&args).unwrap();
        assert_eq!(cfg.rx_files.len(), 2);
        assert_eq!(cfg.tx_files.len(), 1);
        assert_eq!(cfg.rx_files[1].1, PathBuf::from("/tmp/b"));
        assert!(cfg.rx_files[0].0.fail_on_disconnect);
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch0.bin");
        let stats = StatsCounters::new();
        let samples = ramp(1000);

        let mut tx = FileTxPort::create(settings(Direction::Tx, SampleFormat::Fc32, true), &path, stats.clone()).unwrap();
        tx.transmit(&samples[..400]).unwrap();
        tx.transmit(&samples[400..]).unwrap();
        assert_eq!(tx.sample_count(), 1000);
        tx.close();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8000);

        let mut rx = FileRxPort::open(settings(Direction::Rx, SampleFormat::Fc32, true), &path, stats.clone()).unwrap();
        let mut buf = vec![Complex32::new(0.0, 0.0); 600];
        assert_eq!(rx.receive(&mut buf).unwrap(), 600);
        assert_eq!(&buf[..], &samples[..600]);
        assert_eq!(rx.receive(&mut buf).unwrap(), 400);
        assert_eq!(&buf[..400], &samples[600..]);
        assert!(matches!(rx.receive(&mut buf), Err(InterfaceError::EndOfStream)));

        let snap = stats.snapshot();
        assert_eq!(snap.tx_samples, 1000);
        assert_eq!(snap.rx_samples, 1000);
    }

    #[test]
    fn test_eof_zero_fill_when_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let stats = StatsCounters::new();

        let mut tx = FileTxPort::create(settings(Direction::Tx, SampleFormat::Sc16, false), &path, stats.clone()).unwrap();
        tx.transmit(&ramp(10)).unwrap();
        tx.close();

        let mut rx = FileRxPort::open(settings(Direction::Rx, SampleFormat::Sc16, false), &path, stats).unwrap();
        let mut buf = vec![Complex32::new(1.0, 1.0); 32];
        assert_eq!(rx.receive(&mut buf).unwrap(), 10);
        assert_eq!(rx.receive(&mut buf).unwrap(), 32);
        assert!(buf.iter().all(|s| s.norm() == 0.0));
    }

    #[test]
    fn test_align_writes_zero_gap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gap.bin");
        let stats = StatsCounters::new();

        let mut tx = FileTxPort::create(settings(Direction::Tx, SampleFormat::Fc32, true), &path, stats.clone()).unwrap();
        tx.align(5000).unwrap();
        tx.transmit(&[Complex32::new(0.5, 0.5)]).unwrap();
        tx.close();

        let mut rx = FileRxPort::open(settings(Direction::Rx, SampleFormat::Fc32, true), &path, stats).unwrap();
        let mut buf = vec![Complex32::new(1.0, 1.0); 5001];
        let mut filled = 0;
        while filled < buf.len() {
            filled += rx.receive(&mut buf[filled..]).unwrap();
        }
        assert!(buf[..5000].iter().all(|s| s.norm() == 0.0));
        assert_eq!(buf[5000], Complex32::new(0.5, 0.5));
    }

    #[test]
    fn test_closed_ports_refuse_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.bin");
        let stats = StatsCounters::new();

        let mut tx = FileTxPort::create(settings(Direction::Tx, SampleFormat::Fc32, true), &path, stats.clone()).unwrap();
        tx.close();
        assert!(!tx.is_running());
        assert!(matches!(tx.transmit(&ramp(4)), Err(InterfaceError::Closed)));

        let mut rx = FileRxPort::open(settings(Direction::Rx, SampleFormat::Fc32, true), &path, stats).unwrap();
        rx.close();
        assert!(matches!(rx.receive(&mut vec![Complex32::new(0.0, 0.0); 4]), Err(InterfaceError::Closed)));
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileRxPort::open(
            settings(Direction::Rx, SampleFormat::Fc32, true),
            dir.path().join("missing.bin"),
            StatsCounters::new(),
        );
        assert!(matches!(result, Err(InterfaceError::Io(_))));
    }
}
