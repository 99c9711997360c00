//! YAML configuration for `rf_stream`
//!
//! Every field is optional; command line flags override the file.

use serde::{Deserialize, Serialize};

/// What the tool does with the opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Transmit pseudo-random subframes
    Tx,
    /// Receive and measure subframes
    Rx,
    /// Transmit and verify what comes back
    Loopback,
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    pub ru_sdr: RuSdrConfig,
    pub stream: StreamSection,
    pub log: LogConfig,
}

/// Radio unit configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuSdrConfig {
    /// Device driver name, empty to try every backend
    pub device_driver: String,
    /// Device arguments
    pub device_args: String,
    /// Sample rate in MHz
    pub srate: f64,
    /// Center frequency in MHz, applied to every channel
    pub freq: f64,
    /// Transmit gain in dB
    pub tx_gain: f64,
    /// Receive gain in dB
    pub rx_gain: f64,
}

impl Default for RuSdrConfig {
    fn default() -> Self {
        Self {
            device_driver: "loopback".to_string(),
            device_args: String::new(),
            srate: 1.92,
            freq: 2680.0,
            tx_gain: 0.0,
            rx_gain: 0.0,
        }
    }
}

/// Streaming run parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSection {
    pub mode: StreamMode,
    /// Number of 1 ms subframes to stream
    pub subframes: usize,
    pub channels: usize,
    /// Transmit lead over the receive clock, in subframes
    pub delay: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            mode: StreamMode::Loopback,
            subframes: 100,
            channels: 1,
            delay: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl StreamConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: StreamConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject values the stream loop cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.ru_sdr.srate.is_finite() || self.ru_sdr.srate <= 0.0 {
            return Err(anyhow::anyhow!("Invalid sample rate: {} MHz", self.ru_sdr.srate));
        }
        if self.stream.channels == 0 {
            return Err(anyhow::anyhow!("At least one channel is required"));
        }
        if self.subframe_len() == 0 {
            return Err(anyhow::anyhow!(
                "Sample rate {} MHz is below one sample per subframe",
                self.ru_sdr.srate
            ));
        }
        Ok(())
    }

    pub fn srate_hz(&self) -> f64 {
        self.ru_sdr.srate * 1e6
    }

    /// Samples per 1 ms subframe
    pub fn subframe_len(&self) -> usize {
        (self.srate_hz() / 1000.0).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.ru_sdr.device_driver, "loopback");
        assert_eq!(config.stream.mode, StreamMode::Loopback);
        assert_eq!(config.subframe_len(), 1920);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "
ru_sdr:
  device_driver: zmq
  device_args: tx_port=tcp://*:2000,rx_port=tcp://localhost:2001,base_srate=23.04e6
  srate: 11.52
stream:
  mode: rx
";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = StreamConfig::from_yaml_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.ru_sdr.device_driver, "zmq");
        assert_eq!(config.stream.mode, StreamMode::Rx);
        assert_eq!(config.subframe_len(), 11520);
        // Untouched sections keep their defaults
        assert_eq!(config.stream.subframes, 100);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_validate() {
        let mut config = StreamConfig::default();
        config.stream.channels = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.ru_sdr.srate = 0.0;
        assert!(config.validate().is_err());
    }
}
