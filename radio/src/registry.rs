//! Device Registry
//!
//! Maps backend names to factories. Opening with an empty name tries every
//! registered backend in registration order and keeps the first that opens.

use crate::backends::{FileFactory, LoopbackFactory, ZmqFactory};
use crate::burst::Capabilities;
use crate::{RadioError, RfDevice};
use common::DeviceArgs;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Constructor for one backend
pub trait DeviceFactory: Send + Sync {
    /// Name used to select the backend
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn open(&self, args: &DeviceArgs, nof_channels: usize) -> Result<Box<dyn RfDevice>, RadioError>;
}

/// Ordered set of backend factories
#[derive(Default)]
pub struct DeviceRegistry {
    factories: Vec<Box<dyn DeviceFactory>>,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in backends: zmq, file, loopback
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ZmqFactory));
        registry.register(Box::new(FileFactory));
        registry.register(Box::new(LoopbackFactory));
        registry
    }

    /// Add a factory; a factory with the same name replaces the old one in place
    pub fn register(&mut self, factory: Box<dyn DeviceFactory>) {
        match self
            .factories
            .iter_mut()
            .find(|f| f.name().eq_ignore_ascii_case(factory.name()))
        {
            Some(slot) => {
                debug!("Replacing device factory '{}'", factory.name());
                *slot = factory;
            }
            None => {
                debug!("Registered device factory '{}'", factory.name());
                self.factories.push(factory);
            }
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Case-insensitive lookup
    pub fn find(&self, name: &str) -> Option<&dyn DeviceFactory> {
        self.factories
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .map(|f| f.as_ref())
    }

    /// Open `name` with a device argument string. An empty name tries all
    /// backends in order.
    pub fn open(
        &self,
        name: &str,
        args: &str,
        nof_channels: usize,
    ) -> Result<Box<dyn RfDevice>, RadioError> {
        let args = DeviceArgs::parse(args);

        if !name.is_empty() {
            let factory = self
                .find(name)
                .ok_or_else(|| RadioError::UnknownDevice(name.to_string()))?;
            let device = factory.open(&args, nof_channels)?;
            info!("Opened {} device with {} channels", factory.name(), nof_channels);
            return Ok(device);
        }

        for factory in &self.factories {
            match factory.open(&args, nof_channels) {
                Ok(device) => {
                    info!("Opened {} device with {} channels", factory.name(), nof_channels);
                    return Ok(device);
                }
                Err(e) => debug!("{} device did not open: {}", factory.name(), e),
            }
        }

        warn!("No device could be opened with '{}'", args_summary(&args));
        Err(RadioError::CannotStart("no backend accepted the arguments".into()))
    }
}

fn args_summary(args: &DeviceArgs) -> String {
    args.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Process-wide registry of built-in backends
pub fn builtin() -> &'static DeviceRegistry {
    static REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();
    REGISTRY.get_or_init(DeviceRegistry::with_builtin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DeviceHandler, HandlerConfig};
    use interfaces::{ErrorSink, StatsCounters};

    struct NullFactory;

    impl DeviceFactory for NullFactory {
        fn name(&self) -> &'static str {
            "null"
        }

        fn open(&self, args: &DeviceArgs, nof_channels: usize) -> Result<Box<dyn RfDevice>, RadioError> {
            let config = HandlerConfig::from_args("null", args, nof_channels, 1e6)?;
            Ok(Box::new(DeviceHandler::new(
                config,
                Vec::new(),
                Vec::new(),
                ErrorSink::new(),
                StatsCounters::new(),
            )))
        }
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(builtin().names(), vec!["zmq", "file", "loopback"]);
        assert!(builtin().find("ZMQ").is_some());
        assert!(builtin().find("uhd").is_none());
    }

    #[test]
    fn test_open_by_name() {
        let dev = builtin().open("Loopback", "base_srate=1.92e6", 1).unwrap();
        assert_eq!(dev.name(), "loopback");
        assert!(dev.capabilities().contains(Capabilities::EOB_FLUSH));

        let err = builtin().open("uhd", "", 1).err().unwrap();
        assert!(matches!(err, RadioError::UnknownDevice(_)));
        assert_eq!(err.code(), -2);
    }

    #[test]
    fn test_empty_name_picks_first_backend_that_opens() {
        // zmq and file refuse empty arguments, loopback accepts them
        let dev = builtin().open("", "base_srate=1.92e6", 1).unwrap();
        assert_eq!(dev.name(), "loopback");

        let mut registry = DeviceRegistry::new();
        registry.register(Box::new(ZmqFactory));
        let err = registry.open("", "", 1).err().unwrap();
        assert_eq!(err.code(), -6);

        registry.register(Box::new(NullFactory));
        assert_eq!(registry.open("", "", 1).unwrap().name(), "null");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = DeviceRegistry::new();
        registry.register(Box::new(NullFactory));
        registry.register(Box::new(NullFactory));
        assert_eq!(registry.names(), vec!["null"]);
    }
}
