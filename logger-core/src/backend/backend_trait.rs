//! Backend trait definitions for wraplog

use std::io;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest generation counter a single-byte block header can carry
pub const MAX_WRAP: u8 = 254;

/// Error type for backend operations
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u32),
    #[error("Access of {len} bytes at byte {offset} runs past the end of the medium")]
    OutOfRange { offset: u64, len: usize },
    #[error("Block data of {0} bytes does not fit in a block")]
    InvalidLength(usize),
    #[error("Write to non-erased byte {0}")]
    NotErased(u64),
    #[error("Operation not supported by backend")]
    Unsupported,
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Backend fault: {0}")]
    Fault(String),
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Shape of the medium behind a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendGeometry {
    /// Number of blocks the medium can hold at once
    pub physical_blocks: u32,
    /// Lifetime block limit across all generations
    pub logical_blocks: u32,
    /// Size of a single block in bytes (0 while disconnected)
    pub block_size: u16,
    /// Smallest erasable region in bytes
    pub erase_size: u16,
    /// Value an erased byte reads back as
    pub erase_val: u8,
    /// Writes are padded up to a multiple of this many bytes
    pub block_write_align: u8,
    /// Writes must always contain a complete block
    pub requires_full_block_write: bool,
}

impl BackendGeometry {
    /// Number of blocks in one erase unit
    pub fn erase_blocks(&self) -> u32 {
        if self.block_size == 0 {
            return 0;
        }
        (self.erase_size / self.block_size) as u32
    }

    /// Largest logical block count the header generation counter can address
    pub fn max_logical_blocks(&self) -> u32 {
        self.physical_blocks.saturating_mul(MAX_WRAP as u32)
    }
}

/// Storage driver consumed by the data logger
///
/// Backends only deal in physical block indices. Generation counters,
/// retention and erase scheduling all live in the logger.
#[async_trait::async_trait]
pub trait LoggerBackend: Send + 'static {
    /// Current geometry of the medium
    fn geometry(&self) -> BackendGeometry;

    /// Whether previously written blocks can be read back
    fn is_persistent(&self) -> bool {
        true
    }

    /// Write a block of data to a physical block
    async fn write(&mut self, phys_block: u32, block_type: u8, data: &[u8]) -> Result<()>;

    /// Read data starting at a byte offset within a physical block
    ///
    /// Reads may continue into the following physical blocks.
    async fn read(&mut self, _phys_block: u32, _offset: u16, _buf: &mut [u8]) -> Result<()> {
        Err(BackendError::Unsupported)
    }

    /// Erase `num` physical blocks starting at `phys_block`
    async fn erase(&mut self, phys_block: u32, num: u32) -> Result<()>;

    /// Return the medium to an empty state
    ///
    /// `block_hint` is the number of blocks that may hold data. `progress`
    /// is invoked with the cumulative number of blocks erased.
    async fn reset(
        &mut self,
        _block_hint: u32,
        _progress: Option<&(dyn Fn(u32) + Send + Sync)>,
    ) -> Result<()> {
        Err(BackendError::Unsupported)
    }

    /// Physical block range that contains the last written block
    async fn search_hint(&mut self) -> Result<(u32, u32)> {
        Err(BackendError::Unsupported)
    }
}
