//! Logging utilities.
//!
//! Everything in the crate logs through the `log` facade; this module only owns
//! the one-time `env_logger` setup used by binaries and examples.

mod init;

pub use init::{init_logging, LoggingConfig};
