//! Common Utilities and Types Library
//!
//! This crate provides the sample, timestamp and argument types shared by the
//! radio transports and device backends.

pub mod args;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use args::*;
pub use types::*;
pub use utils::*;
