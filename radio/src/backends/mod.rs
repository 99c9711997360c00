//! Radio Backends
//!
//! - `zmq`: virtual radio exchanging samples with a peer over ZeroMQ
//! - `file`: virtual radio replaying and recording raw sample files
//! - `loopback`: in-process emulation of a timestamped hardware radio

pub mod file;
pub mod loopback;
pub mod zmq;

pub use file::FileFactory;
pub use loopback::{LoopbackController, LoopbackDevice, LoopbackFactory};
pub use zmq::ZmqFactory;
