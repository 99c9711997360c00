//! Device Argument Parsing
//!
//! Parses the comma separated `key=value` device argument strings accepted by
//! every backend, e.g. `rx_port0=ipc://ch0,rx_freq0=2630e6,base_srate=1.92e6`.
//! Parsing is lenient: malformed entries are skipped with a warning and only
//! the caller decides which keys are mandatory.

use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Device argument errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArgsError {
    #[error("Missing required argument '{0}'")]
    Missing(String),

    #[error("Invalid value '{value}' for argument '{key}'")]
    Malformed { key: String, value: String },
}

/// Parsed device arguments, in the order they were given
#[derive(Debug, Clone, Default)]
pub struct DeviceArgs {
    entries: Vec<(String, String)>,
}

impl DeviceArgs {
    /// Parse a device argument string
    pub fn parse(args: &str) -> Self {
        let mut entries = Vec::new();

        for pair in args.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let Some((key, value)) = pair.split_once('=') else {
                warn!("Ignoring malformed device argument '{}'", pair);
                continue;
            };

            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                warn!("Ignoring device argument with empty key '{}'", pair);
                continue;
            }

            debug!("Device argument {}={}", key, value);
            entries.push((key.to_string(), value.to_string()));
        }

        Self { entries }
    }

    /// True when no argument was given
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw value of `key`; the last occurrence wins
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Raw value of `key<index>`; channel 0 also accepts the bare `key`
    pub fn get_indexed(&self, key: &str, index: usize) -> Option<&str> {
        let indexed = format!("{}{}", key, index);
        self.get(&indexed)
            .or_else(|| if index == 0 { self.get(key) } else { None })
    }

    /// Parsed value of `key`; malformed values are reported and ignored
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| parse_lenient(key, v))
    }

    /// Parsed value of `key<index>`; malformed values are reported and ignored
    pub fn get_indexed_parsed<T: FromStr>(&self, key: &str, index: usize) -> Option<T> {
        self.get_indexed(key, index)
            .and_then(|v| parse_lenient(&format!("{}{}", key, index), v))
    }

    /// Boolean flag, accepting true/false, yes/no and 1/0
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        let value = self.get(key)?;
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => {
                warn!("Ignoring invalid boolean '{}' for argument '{}'", value, key);
                None
            }
        }
    }

    /// Floating point value of a mandatory argument
    pub fn require_f64(&self, key: &str) -> Result<f64, ArgsError> {
        let value = self.get(key).ok_or_else(|| ArgsError::Missing(key.to_string()))?;
        value.parse::<f64>().map_err(|_| ArgsError::Malformed {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Iterate over all key/value pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn parse_lenient<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid value '{}' for argument '{}'", value, key);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_indexed_ports() {
        let args = DeviceArgs::parse("rx_port0=ipc://ch0,rx_freq0=2630e6,base_srate=1.92e6");
        assert_eq!(args.get_indexed("rx_port", 0), Some("ipc://ch0"));
        assert_eq!(args.get_indexed_parsed::<f64>("rx_freq", 0), Some(2630e6));
        assert_eq!(args.get_parsed::<f64>("base_srate"), Some(1.92e6));
        assert_eq!(args.get_indexed("rx_port", 1), None);
    }

    #[test]
    fn test_bare_key_is_channel_zero() {
        let args = DeviceArgs::parse("tx_port=tcp://*:2000");
        assert_eq!(args.get_indexed("tx_port", 0), Some("tcp://*:2000"));
        assert_eq!(args.get_indexed("tx_port", 1), None);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let args = DeviceArgs::parse("garbage,,=x,base_srate=abc,id=enb, rx_gain = 10 ");
        assert_eq!(args.get("id"), Some("enb"));
        assert_eq!(args.get_parsed::<f64>("base_srate"), None);
        assert_eq!(args.get_parsed::<f32>("rx_gain"), Some(10.0));
        assert_eq!(args.iter().count(), 3);
    }

    #[test]
    fn test_required_argument() {
        let args = DeviceArgs::parse("rx_file=/tmp/x");
        assert_eq!(
            args.require_f64("base_srate"),
            Err(ArgsError::Missing("base_srate".to_string()))
        );

        let args = DeviceArgs::parse("base_srate=fast");
        assert!(matches!(args.require_f64("base_srate"), Err(ArgsError::Malformed { .. })));
    }

    #[test]
    fn test_last_occurrence_wins() {
        let args = DeviceArgs::parse("id=a,id=b");
        assert_eq!(args.get("id"), Some("b"));
    }

    #[test]
    fn test_bool_flags() {
        let args = DeviceArgs::parse("fail_on_disconnect=true,eob_ack=no,x=maybe");
        assert_eq!(args.get_bool("fail_on_disconnect"), Some(true));
        assert_eq!(args.get_bool("eob_ack"), Some(false));
        assert_eq!(args.get_bool("x"), None);
        assert!(DeviceArgs::parse("").is_empty());
    }
}
