use std::io;

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::logger::{EraseError, ReadError, WriteError};
use crate::offload::OffloadError;
use crate::recovery::RecoveryError;

/// Crate-level error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),
    #[error("Write failed: {0}")]
    Write(#[from] WriteError),
    #[error("Read failed: {0}")]
    Read(#[from] ReadError),
    #[error("Erase failed: {0}")]
    Erase(#[from] EraseError),
    #[error(transparent)]
    Offload(#[from] OffloadError),
}

/// A specialized `Result` type for wraplog operations
pub type Result<T> = std::result::Result<T, Error>;
