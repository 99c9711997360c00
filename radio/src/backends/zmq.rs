//! ZMQ Backend
//!
//! Asynchronous backend: every port runs a pump thread between its ZeroMQ
//! socket and ring buffer. All devices share one ZMQ context, so `inproc://`
//! endpoints connect devices living in the same process.

use crate::handler::{DeviceHandler, HandlerConfig};
use crate::registry::DeviceFactory;
use crate::{RadioError, RfDevice};
use common::DeviceArgs;
use interfaces::zmq_rf::{shared_context, ZmqRfConfig, ZmqRxPort, ZmqTxPort};
use interfaces::{ErrorSink, RxPort, StatsCounters, TxPort};
use tracing::error;

pub const ZMQ_DEVICE: &str = "zmq";

/// Open a ZMQ device; Tx sockets are bound before Rx sockets connect
pub fn open(args: &DeviceArgs, nof_channels: usize) -> Result<DeviceHandler, RadioError> {
    let config = ZmqRfConfig::from_device_args(args)?;
    if config.rx_ports.is_empty() && config.tx_ports.is_empty() {
        error!("zmq device needs at least one rx_port or tx_port");
        return Err(RadioError::InvalidArgument("no rx_port or tx_port given".into()));
    }

    let context = shared_context();
    let stats = StatsCounters::new();
    let errors = ErrorSink::new();

    let mut tx_ports: Vec<Box<dyn TxPort>> = Vec::with_capacity(config.tx_ports.len());
    for port in &config.tx_ports {
        tx_ports.push(Box::new(ZmqTxPort::open(&context, port, stats.clone())?));
    }

    let mut rx_ports: Vec<Box<dyn RxPort>> = Vec::with_capacity(config.rx_ports.len());
    for port in &config.rx_ports {
        rx_ports.push(Box::new(ZmqRxPort::open(
            &context,
            port,
            errors.clone(),
            stats.clone(),
        )?));
    }

    let handler_config = HandlerConfig::from_args(ZMQ_DEVICE, args, nof_channels, config.base_srate)?;
    Ok(DeviceHandler::new(handler_config, rx_ports, tx_ports, errors, stats))
}

/// Registry entry for the ZMQ backend
pub struct ZmqFactory;

impl DeviceFactory for ZmqFactory {
    fn name(&self) -> &'static str {
        ZMQ_DEVICE
    }

    fn open(&self, args: &DeviceArgs, nof_channels: usize) -> Result<Box<dyn RfDevice>, RadioError> {
        Ok(Box::new(open(args, nof_channels)?))
    }
}
