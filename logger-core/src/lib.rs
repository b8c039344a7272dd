//! wraplog - a persistent circular block log
//!
//! This crate provides a power-loss tolerant, wrap-counted block log for
//! storage media of varying shape. Blocks are addressed by an ever
//! increasing logical index, mapped onto a fixed number of physical blocks,
//! and every block carries a small header from which the write cursor can be
//! rebuilt after an arbitrary crash.
//!
//! The engine ([`DataLogger`]) talks to storage through the
//! [`LoggerBackend`] trait. It can optionally coalesce small writes in a RAM
//! buffer and can be moved onto a dedicated worker task
//! ([`OffloadedLogger`]) so that many producers share one serialized writer.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod header;
pub mod logger;
pub mod offload;
pub mod power;
pub mod ram_buffer;
pub mod recovery;
pub mod watchdog;

pub use backend::{BackendError, BackendGeometry, FileBackend, LoggerBackend, MemoryBackend};
pub use config::{ConfigError, FileBackendConfig, LoggerConfig, OffloadConfig};
pub use error::{Error, Result};
pub use events::LoggerEvents;
pub use header::BlockHeader;
pub use logger::{DataLogger, EraseError, LoggerState, ReadError, WriteError};
pub use offload::{LoggerHandle, OffloadError, OffloadedLogger};
pub use recovery::RecoveryError;

/// Re-export common types and traits
pub mod prelude {
    pub use crate::backend::LoggerBackend;
    pub use crate::config::LoggerConfig;
    pub use crate::error::Result;
    pub use crate::logger::{DataLogger, LoggerState};
}
