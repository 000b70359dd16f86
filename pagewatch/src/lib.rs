//! User-space side of the page fault collector: probe lifecycle, transports,
//! the consumer loop and its reporter.

// region:    --- Modules
pub mod cli;
mod config;
pub mod consumer;
pub mod decode;
mod error;
pub mod layout;
pub mod lifecycle;
pub mod report;
pub mod sim;
pub mod transport;
// endregion: --- Modules

pub use config::Config;
pub use error::{Error, Result};
