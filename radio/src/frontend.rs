//! Radio Front-End
//!
//! Owns one opened device and exposes the dispatch contract to the upper PHY,
//! plus single-channel shortcuts and a background Rx gain applier.

use crate::burst::Capabilities;
use crate::registry::{self, DeviceRegistry};
use crate::{RadioError, RfDevice};
use common::TimeSpec;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use interfaces::worker::Worker;
use interfaces::{ErrorHandler, RfStats};
use num_complex::Complex32;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wake-up period of the gain thread while idle
const GAIN_POLL: Duration = Duration::from_millis(20);

struct GainApplier {
    requests: Sender<f64>,
    worker: Worker,
}

/// An opened radio device
pub struct Radio {
    device: Arc<dyn RfDevice>,
    nof_channels: usize,
    gain_applier: Mutex<Option<GainApplier>>,
}

impl Radio {
    /// Open through the built-in registry; an empty name takes the first
    /// backend that accepts `args`
    pub fn open(name: &str, args: &str, nof_channels: usize) -> Result<Self, RadioError> {
        Self::open_with(registry::builtin(), name, args, nof_channels)
    }

    pub fn open_with(
        registry: &DeviceRegistry,
        name: &str,
        args: &str,
        nof_channels: usize,
    ) -> Result<Self, RadioError> {
        let device = registry.open(name, args, nof_channels)?;
        Ok(Self::from_device(device, nof_channels))
    }

    /// Wrap an already opened device
    pub fn from_device(device: Box<dyn RfDevice>, nof_channels: usize) -> Self {
        Self {
            device: Arc::from(device),
            nof_channels,
            gain_applier: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn nof_channels(&self) -> usize {
        self.nof_channels
    }

    pub fn capabilities(&self) -> Capabilities {
        self.device.capabilities()
    }

    pub fn start_rx_stream(&self, now: bool) -> Result<(), RadioError> {
        self.device.start_rx_stream(now)
    }

    pub fn stop_rx_stream(&self) -> Result<(), RadioError> {
        self.device.stop_rx_stream()
    }

    pub fn set_rx_srate(&self, rate_hz: f64) -> Result<f64, RadioError> {
        self.device.set_rx_srate(rate_hz)
    }

    pub fn set_tx_srate(&self, rate_hz: f64) -> Result<f64, RadioError> {
        self.device.set_tx_srate(rate_hz)
    }

    pub fn set_rx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.device.set_rx_gain(channel, gain_db)
    }

    pub fn set_tx_gain(&self, channel: usize, gain_db: f64) -> Result<f64, RadioError> {
        self.device.set_tx_gain(channel, gain_db)
    }

    /// Same Rx gain on every channel
    pub fn set_rx_gain_all(&self, gain_db: f64) -> Result<f64, RadioError> {
        set_all(self.device.as_ref(), self.nof_channels, gain_db, |d, ch, g| d.set_rx_gain(ch, g))
    }

    /// Same Tx gain on every channel
    pub fn set_tx_gain_all(&self, gain_db: f64) -> Result<f64, RadioError> {
        set_all(self.device.as_ref(), self.nof_channels, gain_db, |d, ch, g| d.set_tx_gain(ch, g))
    }

    /// Queue an Rx gain change for the gain thread. Requests arriving faster
    /// than they are applied are coalesced; only the latest one is applied.
    pub fn set_rx_gain_th(&self, gain_db: f64) -> Result<(), RadioError> {
        let mut slot = self.gain_applier.lock();
        if slot.is_none() {
            *slot = Some(self.spawn_gain_applier()?);
        }
        let Some(applier) = slot.as_ref() else {
            return Err(RadioError::Closed);
        };
        applier
            .requests
            .send(gain_db)
            .map_err(|_| RadioError::CannotStart("gain thread exited".into()))
    }

    fn spawn_gain_applier(&self) -> Result<GainApplier, RadioError> {
        let (requests, pending) = channel::unbounded::<f64>();
        let device = self.device.clone();
        let nof_channels = self.nof_channels;

        let worker = Worker::spawn("rf-gain", move |stop| {
            while !stop.is_stopped() {
                let mut gain_db = match pending.recv_timeout(GAIN_POLL) {
                    Ok(gain_db) => gain_db,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let mut skipped = 0;
                for newer in pending.try_iter() {
                    gain_db = newer;
                    skipped += 1;
                }
                if skipped > 0 {
                    debug!("Coalesced {} rx gain requests", skipped);
                }
                if let Err(e) =
                    set_all(device.as_ref(), nof_channels, gain_db, |d, ch, g| d.set_rx_gain(ch, g))
                {
                    warn!("Failed to apply rx gain {} dB: {}", gain_db, e);
                }
            }
            debug!("Gain thread exiting");
        })
        .map_err(|e| RadioError::CannotStart(e.to_string()))?;

        info!("{}: started rx gain thread", self.device.name());
        Ok(GainApplier { requests, worker })
    }

    pub fn get_rx_gain(&self) -> f64 {
        self.device.get_rx_gain()
    }

    pub fn get_tx_gain(&self) -> f64 {
        self.device.get_tx_gain()
    }

    pub fn set_rx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.device.set_rx_freq(channel, freq_hz)
    }

    pub fn set_tx_freq(&self, channel: usize, freq_hz: f64) -> Result<f64, RadioError> {
        self.device.set_tx_freq(channel, freq_hz)
    }

    pub fn recv_with_time_multi(
        &self,
        buffers: &mut [Option<&mut [Complex32]>],
        nsamples: usize,
        blocking: bool,
    ) -> Result<(usize, TimeSpec), RadioError> {
        self.device.recv_with_time_multi(buffers, nsamples, blocking)
    }

    /// Receive `buffer.len()` samples on channel 0, discarding the others
    pub fn recv_with_time(
        &self,
        buffer: &mut [Complex32],
        blocking: bool,
    ) -> Result<(usize, TimeSpec), RadioError> {
        let nsamples = buffer.len();
        let mut buffers: Vec<Option<&mut [Complex32]>> = Vec::with_capacity(self.nof_channels);
        buffers.push(Some(buffer));
        buffers.resize_with(self.nof_channels.max(1), || None);
        self.device.recv_with_time_multi(&mut buffers, nsamples, blocking)
    }

    pub fn send_timed_multi(
        &self,
        buffers: &[Option<&[Complex32]>],
        nsamples: usize,
        time: Option<TimeSpec>,
        blocking: bool,
        start_of_burst: bool,
        end_of_burst: bool,
    ) -> Result<usize, RadioError> {
        self.device
            .send_timed_multi(buffers, nsamples, time, blocking, start_of_burst, end_of_burst)
    }

    /// Transmit `buffer` on channel 0, zeros on the others
    pub fn send_timed(
        &self,
        buffer: &[Complex32],
        time: Option<TimeSpec>,
        start_of_burst: bool,
        end_of_burst: bool,
    ) -> Result<usize, RadioError> {
        let mut buffers: Vec<Option<&[Complex32]>> = vec![None; self.nof_channels.max(1)];
        buffers[0] = Some(buffer);
        self.device
            .send_timed_multi(&buffers, buffer.len(), time, true, start_of_burst, end_of_burst)
    }

    pub fn register_error_handler(&self, handler: ErrorHandler) {
        self.device.register_error_handler(handler)
    }

    pub fn stats(&self) -> RfStats {
        self.device.stats()
    }

    /// Stop the gain thread, then close the device
    pub fn close(&self) -> Result<(), RadioError> {
        if let Some(GainApplier { requests, mut worker }) = self.gain_applier.lock().take() {
            drop(requests);
            worker.join();
        }
        self.device.close()
    }
}

impl Drop for Radio {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing {} device: {}", self.device.name(), e);
        }
    }
}

fn set_all<F>(device: &dyn RfDevice, nof_channels: usize, gain_db: f64, set: F) -> Result<f64, RadioError>
where
    F: Fn(&dyn RfDevice, usize, f64) -> Result<f64, RadioError>,
{
    let mut applied = gain_db;
    for ch in 0..nof_channels {
        applied = set(device, ch, gain_db)?;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn loopback(args: &str, nof_channels: usize) -> Radio {
        Radio::open("loopback", args, nof_channels).unwrap()
    }

    #[test]
    fn test_open_unknown_device() {
        let err = Radio::open("bladerf", "", 1).err().unwrap();
        assert_eq!(err.code(), -2);
    }

    #[test]
    fn test_single_channel_round_trip() {
        let radio = loopback("base_srate=1.92e6", 2);
        radio.start_rx_stream(true).unwrap();

        let data: Vec<Complex32> = (0..960).map(|i| Complex32::new(i as f32 / 960.0, 0.5)).collect();
        let at = TimeSpec::from_samples(960, 1.92e6);
        assert_eq!(radio.send_timed(&data, Some(at), true, false).unwrap(), 960);

        let mut out = vec![Complex32::new(0.0, 0.0); 960];
        let (_, t0) = radio.recv_with_time(&mut out, true).unwrap();
        assert_eq!(t0.to_samples(1.92e6), 0);
        assert!(out.iter().all(|s| s.norm() == 0.0));

        let (_, t1) = radio.recv_with_time(&mut out, true).unwrap();
        assert_eq!(t1.to_samples(1.92e6), 960);
        assert_eq!(out, data);
    }

    #[test]
    fn test_gain_on_all_channels() {
        let radio = loopback("", 2);
        assert_eq!(radio.set_rx_gain_all(30.0).unwrap(), 30.0);
        assert_eq!(radio.set_tx_gain_all(-6.0).unwrap(), -6.0);
        assert_eq!(radio.get_rx_gain(), 30.0);
        assert_eq!(radio.get_tx_gain(), -6.0);
        assert!(radio.set_rx_gain(2, 1.0).is_err());
    }

    #[test]
    fn test_gain_thread_applies_latest() {
        let radio = loopback("", 1);
        for gain in [5.0, 10.0, 15.0, 20.0] {
            radio.set_rx_gain_th(gain).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while radio.get_rx_gain() != 20.0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(radio.get_rx_gain(), 20.0);

        radio.close().unwrap();
        assert!(radio.gain_applier.lock().is_none());
    }
}
