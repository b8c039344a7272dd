//! Circular block log engine
//!
//! Logical block `L` lives in physical block `L % physical_blocks` and is
//! stamped with generation `L / physical_blocks + 1`. Once the medium has
//! been filled, every write that lands on an erase unit boundary erases the
//! unit first and moves the retention boundary forward by one unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendError, BackendGeometry, LoggerBackend, MAX_WRAP};
use crate::config::LoggerConfig;
use crate::error::Result;
use crate::events::LoggerEvents;
use crate::header::{BlockHeader, HeaderError};
use crate::power::{AlwaysOn, DevicePower, PowerGate};
use crate::ram_buffer::{Admission, RamBuffer};
use crate::recovery::{self, BackendHeaders, RecoveryError, RecoveryParams};

/// Write failures
#[derive(Error, Debug)]
pub enum WriteError {
    /// Backend has not reported a block size yet
    #[error("Backend is not ready")]
    NotReady,
    /// Record is larger than a block (or the offload queue limit)
    #[error("Record of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    /// Logical address space exhausted
    #[error("Logger is full")]
    Full,
    /// Offload queue has no free slots
    #[error("Write queue is full")]
    QueueFull,
    #[error("Logger worker has stopped")]
    WorkerStopped,
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Read failures
#[derive(Error, Debug)]
pub enum ReadError {
    /// Logger cannot read back what it wrote
    #[error("Logger does not support reads")]
    NotSupported,
    /// Requested range is outside the retained blocks
    #[error("Requested data is not present")]
    NotFound,
    /// Log is being erased
    #[error("Logger is busy erasing")]
    Busy,
    #[error("Logger worker has stopped")]
    WorkerStopped,
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Erase failures
#[derive(Error, Debug)]
pub enum EraseError {
    /// Logger or backend cannot be reset
    #[error("Logger does not support erasing")]
    NotSupported,
    #[error("Logger worker has stopped")]
    WorkerStopped,
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Snapshot of a logger's addressing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoggerState {
    /// Bytes committed to the backend since attach
    pub bytes_logged: u64,
    /// Lifetime block limit
    pub logical_blocks: u32,
    /// Blocks the medium holds at once
    pub physical_blocks: u32,
    /// Write cursor immediately after recovery
    pub boot_block: u32,
    /// Next logical block to be written
    pub current_block: u32,
    /// Oldest logical block still readable
    pub earliest_block: u32,
    pub block_size: u16,
    /// Bytes at the front of each block owned by the logger
    pub block_overhead: u16,
    /// Erase unit in bytes
    pub erase_unit: u16,
    pub requires_full_block_write: bool,
}

impl LoggerState {
    /// Blocks per erase unit
    pub fn erase_blocks(&self) -> u32 {
        if self.block_size == 0 {
            return 0;
        }
        (self.erase_unit / self.block_size) as u32
    }

    /// Number of blocks that can currently be read
    pub fn retained_blocks(&self) -> u32 {
        self.current_block - self.earliest_block
    }

    /// Validate a record of `len` bytes against the current state
    pub fn check_write(&self, len: usize) -> std::result::Result<(), WriteError> {
        if self.block_size == 0 {
            return Err(WriteError::NotReady);
        }
        if len > self.block_size as usize {
            return Err(WriteError::TooLarge {
                len,
                max: self.block_size as usize,
            });
        }
        if self.current_block >= self.logical_blocks {
            return Err(WriteError::Full);
        }
        Ok(())
    }
}

/// A circular block log on top of a backend
///
/// All mutation goes through `&mut self`, so a logger has exactly one
/// writer. Share it between tasks with [`OffloadedLogger`](crate::OffloadedLogger).
pub struct DataLogger<B: LoggerBackend> {
    name: String,
    backend: B,
    state: LoggerState,
    erase_val: u8,
    block_write_align: u8,
    persistent: bool,
    ram: Option<RamBuffer>,
    power: PowerGate,
    events: Vec<Arc<dyn LoggerEvents>>,
    erasing: Arc<AtomicBool>,
    scan_erase_units: u32,
}

impl<B: LoggerBackend> std::fmt::Debug for DataLogger<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLogger")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("persistent", &self.persistent)
            .finish()
    }
}

impl<B: LoggerBackend> DataLogger<B> {
    /// Attach to a backend and recover the log state from its medium
    pub async fn attach(backend: B, config: &LoggerConfig) -> Result<Self> {
        Self::attach_with_power(backend, config, Arc::new(AlwaysOn)).await
    }

    /// Attach to a backend whose device power is managed by `power`
    pub async fn attach_with_power(
        backend: B,
        config: &LoggerConfig,
        power: Arc<dyn DevicePower>,
    ) -> Result<Self> {
        config.validate()?;

        let geometry = backend.geometry();
        let persistent = backend.is_persistent();
        let physical = geometry.physical_blocks;

        validate_geometry(&geometry)?;
        let logical_blocks = logical_limit(&geometry, persistent, &config.name);

        let state = LoggerState {
            logical_blocks,
            physical_blocks: physical,
            block_size: geometry.block_size,
            block_overhead: if persistent { BlockHeader::SIZE as u16 } else { 0 },
            erase_unit: geometry.erase_size,
            requires_full_block_write: geometry.requires_full_block_write,
            ..LoggerState::default()
        };

        let mut logger = Self {
            name: config.name.clone(),
            backend,
            state,
            erase_val: geometry.erase_val,
            block_write_align: geometry.block_write_align,
            persistent,
            ram: (config.ram_buffer_size > 0).then(|| RamBuffer::new(config.ram_buffer_size)),
            power: PowerGate::new(power, config.power_release_delay()),
            events: Vec::new(),
            erasing: Arc::new(AtomicBool::new(false)),
            scan_erase_units: config.scan_erase_units,
        };

        if !persistent {
            log::info!("Write-only logger {}", logger.name);
            return Ok(logger);
        }
        if geometry.block_size == 0 {
            log::info!("{} has no block size yet, skipping recovery", logger.name);
            return Ok(logger);
        }

        logger.recover().await?;
        if let Some(ram) = &logger.ram {
            log::info!("{} -> Extra {} byte RAM buffer", logger.name, ram.capacity());
        }
        Ok(logger)
    }

    async fn recover(&mut self) -> std::result::Result<(), RecoveryError> {
        let params = RecoveryParams {
            physical_blocks: self.state.physical_blocks,
            erase_blocks: self.state.erase_blocks(),
            scan_erase_units: self.scan_erase_units,
        };

        self.power.get().await?;
        let result = recovery::recover(&mut BackendHeaders::new(&mut self.backend), &params).await;
        self.power.put_async().await;

        let recovered = result
            .and_then(|recovered| {
                if recovered.current_block > self.state.logical_blocks {
                    return Err(RecoveryError::BeyondLogicalLimit {
                        current_block: recovered.current_block,
                        logical_blocks: self.state.logical_blocks,
                    });
                }
                Ok(recovered)
            })
            .map_err(|e| {
                log::error!("{} failed to search for current state ({})", self.name, e);
                e
            })?;
        self.state.current_block = recovered.current_block;
        self.state.earliest_block = recovered.earliest_block;
        self.state.boot_block = recovered.current_block;
        log::info!(
            "{} -> {}/{} blocks",
            self.name,
            self.state.current_block,
            self.state.logical_blocks
        );
        Ok(())
    }

    /// Current state snapshot
    pub fn state(&self) -> LoggerState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether blocks can be read back
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Detach from the backend, dropping any unflushed RAM buffer contents
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Number of records waiting in the RAM buffer
    pub fn ram_pending(&self) -> usize {
        self.ram.as_ref().map_or(0, RamBuffer::pending)
    }

    /// Subscribe to logger events
    pub fn register_events(&mut self, events: Arc<dyn LoggerEvents>) {
        self.events.push(events);
    }

    /// Update the block size after the backend geometry changed
    ///
    /// The rest of the geometry is re-read from the backend and validated. A
    /// persistent logger attached without a block size recovers its cursor
    /// here, before any block can be written or read. On failure the logger
    /// keeps its previous geometry.
    pub async fn block_size_changed(
        &mut self,
        block_size: u16,
    ) -> std::result::Result<(), RecoveryError> {
        log::info!(
            "{} block size changed {} -> {}",
            self.name,
            self.state.block_size,
            block_size
        );
        let mut geometry = self.backend.geometry();
        geometry.block_size = block_size;
        validate_geometry(&geometry)?;

        let previous = self.state;
        let needs_recovery = self.persistent && previous.block_size == 0 && block_size > 0;
        self.state.block_size = block_size;
        self.state.physical_blocks = geometry.physical_blocks;
        self.state.erase_unit = geometry.erase_size;
        self.state.logical_blocks = logical_limit(&geometry, self.persistent, &self.name);
        if needs_recovery {
            if let Err(e) = self.recover().await {
                self.state = previous;
                return Err(e);
            }
        }

        for events in &self.events {
            events.block_size_update(block_size);
        }
        Ok(())
    }

    pub(crate) fn erasing_flag(&self) -> Arc<AtomicBool> {
        self.erasing.clone()
    }

    /// Write a record as the next logical block
    ///
    /// On persistent loggers the first [`BlockHeader::SIZE`] bytes of the
    /// record are replaced by the block header.
    pub async fn write(&mut self, block_type: u8, data: &[u8]) -> std::result::Result<(), WriteError> {
        if let Err(e) = self.state.check_write(data.len()) {
            self.notify_write_failure(block_type, data, &e);
            return Err(e);
        }
        if self.erasing.load(Ordering::Acquire) {
            // Records logged during an erase are dropped
            return Ok(());
        }

        let record = self.pad_record(data);
        let admission = self.ram.as_mut().map(|ram| ram.submit(block_type, &record));
        match admission {
            Some(Admission::Buffered) => Ok(()),
            Some(Admission::FlushThenDirect) => {
                if let Err(e) = self.flush_ram().await {
                    log::warn!("{} lost buffered blocks during flush: {}", self.name, e);
                }
                self.commit_block(block_type, record).await
            }
            Some(Admission::Direct) | None => self.commit_block(block_type, record).await,
        }
    }

    /// Write out everything held in the RAM buffer
    ///
    /// Every buffered record is attempted. The first failure is returned.
    pub async fn flush(&mut self) -> std::result::Result<(), WriteError> {
        self.flush_ram().await
    }

    /// Read `out.len()` bytes starting at `offset` within logical block `block_idx`
    ///
    /// Reads may continue through following blocks, including across the
    /// physical wrap point.
    pub async fn read(
        &mut self,
        block_idx: u32,
        offset: u16,
        out: &mut [u8],
    ) -> std::result::Result<(), ReadError> {
        if !self.persistent {
            return Err(ReadError::NotSupported);
        }
        if self.erasing.load(Ordering::Acquire) {
            return Err(ReadError::Busy);
        }

        let block_size = self.state.block_size as u64;
        if offset as u64 >= block_size || block_idx < self.state.earliest_block {
            return Err(ReadError::NotFound);
        }
        let len = out.len() as u64;
        let end_logical = (block_size * block_idx as u64 + offset as u64 + len.max(1) - 1) / block_size;
        if end_logical >= self.state.current_block as u64 {
            return Err(ReadError::NotFound);
        }
        if out.is_empty() {
            return Ok(());
        }

        let physical = self.state.physical_blocks;
        let phys = block_idx % physical;
        let end_phys = (end_logical % physical as u64) as u32;
        let first_len = if end_phys < phys {
            let to_wrap = ((physical - phys) as u64 * block_size - offset as u64) as usize;
            log::debug!("{} read wraps across boundary after {} bytes", self.name, to_wrap);
            to_wrap
        } else {
            out.len()
        };

        self.power.get().await?;
        let result = self.read_split(phys, offset, out, first_len).await;
        self.power.put_async().await;
        result
    }

    async fn read_split(
        &mut self,
        phys: u32,
        offset: u16,
        out: &mut [u8],
        first_len: usize,
    ) -> std::result::Result<(), ReadError> {
        let (head, tail) = out.split_at_mut(first_len);
        if let Err(e) = self.backend.read(phys, offset, head).await {
            log::error!("{} failed to read from backend: {}", self.name, e);
            return Err(e.into());
        }
        if !tail.is_empty() {
            log::debug!("{} reading remaining {} bytes", self.name, tail.len());
            if let Err(e) = self.backend.read(0, 0, tail).await {
                log::error!("{} failed to read from backend: {}", self.name, e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Erase the log and reset the block counters
    ///
    /// With `erase_all` the whole medium is reset, otherwise only the blocks
    /// that may have been written. `progress` receives the cumulative number
    /// of blocks erased.
    pub async fn erase(
        &mut self,
        erase_all: bool,
        progress: Option<&(dyn Fn(u32) + Send + Sync)>,
    ) -> std::result::Result<(), EraseError> {
        if !self.persistent {
            return Err(EraseError::NotSupported);
        }

        if let Err(e) = self.power.get().await {
            log::error!("Failed to power up {} for reset ({})", self.name, e);
            return Err(e.into());
        }

        let block_hint = if erase_all {
            self.state.physical_blocks
        } else {
            self.state.current_block.min(self.state.physical_blocks)
        };

        self.erasing.store(true, Ordering::Release);
        let rc = self.backend.reset(block_hint, progress).await;
        if rc.is_ok() {
            self.state.current_block = 0;
            self.state.earliest_block = 0;
            self.state.boot_block = 0;
        }
        self.power.put().await;
        self.erasing.store(false, Ordering::Release);

        match rc {
            Ok(()) => {
                log::info!("{} erased ({} blocks)", self.name, block_hint);
                Ok(())
            }
            Err(BackendError::Unsupported) => Err(EraseError::NotSupported),
            Err(e) => {
                log::error!("{} failed to erase ({})", self.name, e);
                Err(e.into())
            }
        }
    }

    /// Pad a record to the backend write alignment
    fn pad_record(&self, data: &[u8]) -> Vec<u8> {
        let mut record = data.to_vec();
        let align = self.block_write_align as usize;
        if !self.state.requires_full_block_write && align > 1 {
            let unaligned = record.len() % align;
            if unaligned > 0 {
                let padded = (record.len() + align - unaligned).min(self.state.block_size as usize);
                record.resize(padded, self.erase_val);
            }
        }
        record
    }

    async fn flush_ram(&mut self) -> std::result::Result<(), WriteError> {
        let frames = match self.ram.as_mut() {
            Some(ram) if !ram.is_empty() => ram.drain_frames(),
            _ => return Ok(()),
        };

        let flush_start = Instant::now();
        let flushed = frames.len();
        let mut first_err = None;
        for frame in frames {
            let len = frame.data.len();
            let block_type = frame.block_type;
            match self.commit_block(block_type, frame.data).await {
                Ok(()) => log::debug!("Flushed {} byte {:02X} block", len, block_type),
                Err(e) => {
                    log::debug!("Flushed {} byte {:02X} block ({})", len, block_type, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        log::info!(
            "{} -> Flushed {} blocks in {} ms",
            self.name,
            flushed,
            flush_start.elapsed().as_millis()
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write one record to the block under the cursor
    async fn commit_block(&mut self, block_type: u8, mut record: Vec<u8>) -> std::result::Result<(), WriteError> {
        let result = self.program_block(block_type, &mut record).await;
        match result {
            Ok(()) => {
                self.state.bytes_logged += record.len() as u64;
                self.state.current_block += 1;
                Ok(())
            }
            Err(e) => {
                self.notify_write_failure(block_type, &record, &e);
                Err(e)
            }
        }
    }

    async fn program_block(&mut self, block_type: u8, record: &mut Vec<u8>) -> std::result::Result<(), WriteError> {
        // Frames flushed from the RAM buffer were validated before the cursor moved
        if self.state.current_block >= self.state.logical_blocks {
            return Err(WriteError::Full);
        }

        let current = self.state.current_block;
        let physical = self.state.physical_blocks;
        let erase_blocks = self.state.erase_blocks();
        if erase_blocks == 0 {
            return Err(WriteError::NotReady);
        }
        let phys = current % physical;

        log::debug!(
            "{} writing to logical block {} (Phy block {})",
            self.name,
            current,
            phys
        );

        self.power.get().await?;
        let result = self.erase_and_write(phys, erase_blocks, block_type, record).await;
        self.power.put_async().await;
        result
    }

    async fn erase_and_write(
        &mut self,
        phys: u32,
        erase_blocks: u32,
        block_type: u8,
        record: &mut Vec<u8>,
    ) -> std::result::Result<(), WriteError> {
        let current = self.state.current_block;
        let physical = self.state.physical_blocks;

        if current >= physical && current % erase_blocks == 0 {
            log::debug!("{} preparing block for write", self.name);
            if let Err(e) = self.backend.erase(phys, erase_blocks).await {
                log::error!("{} failed to prepare block ({})", self.name, e);
                return Err(e.into());
            }
            // Old data is no longer present
            self.state.earliest_block = (self.state.earliest_block + erase_blocks).min(current);
        }

        if self.persistent {
            if record.len() < BlockHeader::SIZE {
                record.resize(BlockHeader::SIZE, self.erase_val);
            }
            BlockHeader::for_logical_block(block_type, current, physical).encode_into(record)?;
        }

        if let Err(e) = self.backend.write(phys, block_type, record).await {
            log::error!("{} failed to write to backend ({})", self.name, e);
            return Err(e.into());
        }
        Ok(())
    }

    fn notify_write_failure(&self, block_type: u8, data: &[u8], error: &WriteError) {
        for events in &self.events {
            events.write_failure(block_type, data, error);
        }
    }
}

/// Check that a backend geometry can be addressed by the engine
fn validate_geometry(geometry: &BackendGeometry) -> std::result::Result<(), RecoveryError> {
    let physical = geometry.physical_blocks;
    if physical == 0 || physical.checked_mul(MAX_WRAP as u32 + 1).is_none() {
        return Err(RecoveryError::InvalidGeometry(format!(
            "{} physical blocks cannot be addressed",
            physical
        )));
    }
    if geometry.block_size == 0 {
        // Block size not known yet
        return Ok(());
    }
    let erase_blocks = geometry.erase_blocks();
    if erase_blocks == 0 || geometry.erase_size % geometry.block_size != 0 {
        return Err(RecoveryError::InvalidGeometry(format!(
            "erase size {} is not a multiple of block size {}",
            geometry.erase_size, geometry.block_size
        )));
    }
    if physical % erase_blocks != 0 {
        return Err(RecoveryError::InvalidGeometry(format!(
            "{} physical blocks is not a whole number of {} block erase units",
            physical, erase_blocks
        )));
    }
    Ok(())
}

/// Lifetime block limit for a backend geometry
fn logical_limit(geometry: &BackendGeometry, persistent: bool, name: &str) -> u32 {
    if !persistent {
        return if geometry.logical_blocks == 0 {
            u32::MAX
        } else {
            geometry.logical_blocks
        };
    }
    let max = geometry.max_logical_blocks();
    if geometry.logical_blocks > max {
        log::warn!("{} limited to {} logical blocks by the generation counter", name, max);
    }
    if geometry.logical_blocks == 0 || geometry.logical_blocks > max {
        max
    } else {
        geometry.logical_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Op};
    use crate::error::Error;
    use parking_lot::Mutex;

    fn test_config() -> LoggerConfig {
        LoggerConfig {
            name: "test".to_string(),
            power_release_delay_ms: 0,
            ..LoggerConfig::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        failures: Mutex<Vec<(u8, usize, String)>>,
        block_sizes: Mutex<Vec<u16>>,
    }

    impl LoggerEvents for Recorder {
        fn block_size_update(&self, block_size: u16) {
            self.block_sizes.lock().push(block_size);
        }

        fn write_failure(&self, block_type: u8, data: &[u8], error: &WriteError) {
            self.failures
                .lock()
                .push((block_type, data.len(), error.to_string()));
        }
    }

    #[tokio::test]
    async fn test_attach_empty() {
        let backend = MemoryBackend::new(16, 64, 256);
        let logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        let state = logger.state();

        assert_eq!(state.current_block, 0);
        assert_eq!(state.earliest_block, 0);
        assert_eq!(state.physical_blocks, 16);
        assert_eq!(state.logical_blocks, 16 * 254);
        assert_eq!(state.block_overhead, 2);
        assert_eq!(state.erase_blocks(), 4);
    }

    #[tokio::test]
    async fn test_logical_limit_clamped() {
        let backend = MemoryBackend::new(4, 16, 32).with_logical_blocks(u32::MAX);
        let logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        assert_eq!(logger.state().logical_blocks, 4 * 254);
    }

    #[tokio::test]
    async fn test_invalid_geometry() {
        let backend = MemoryBackend::new(4, 16, 24);
        assert!(DataLogger::attach(backend, &test_config()).await.is_err());

        let backend = MemoryBackend::new(6, 16, 64);
        assert!(DataLogger::attach(backend, &test_config()).await.is_err());
    }

    #[tokio::test]
    async fn test_write_stamps_header() {
        let backend = MemoryBackend::new(4, 16, 32);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();

        for i in 0..6u8 {
            logger.write(0x20 + i, &[i; 16]).await.unwrap();
        }
        // Block 4 and 5 are the second generation
        let block = probe.block(1);
        assert_eq!(&block[..2], &[2, 0x25]);
        assert_eq!(&block[2..], &[5; 14]);
        assert_eq!(&probe.block(2)[..2], &[1, 0x22]);
        assert_eq!(logger.state().bytes_logged, 6 * 16);
    }

    #[tokio::test]
    async fn test_write_validation() {
        let backend = MemoryBackend::new(4, 16, 16).with_logical_blocks(2);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        logger.register_events(recorder.clone());

        assert!(matches!(
            logger.write(0x10, &[0; 17]).await,
            Err(WriteError::TooLarge { len: 17, max: 16 })
        ));
        logger.write(0x10, &[0; 16]).await.unwrap();
        logger.write(0x10, &[0; 16]).await.unwrap();
        assert!(matches!(logger.write(0x11, &[0; 16]).await, Err(WriteError::Full)));

        assert_eq!(logger.state().current_block, 2);
        assert_eq!(probe.calls(Op::Write), 2);
        let failures = recorder.failures.lock();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[1].0, 0x11);
    }

    #[tokio::test]
    async fn test_not_ready_until_block_size() {
        let backend = MemoryBackend::new(4, 0, 0);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        logger.register_events(recorder.clone());

        assert!(matches!(logger.write(0x10, &[0; 4]).await, Err(WriteError::NotReady)));
        assert!(matches!(
            logger.read(0, 0, &mut [0; 4]).await,
            Err(ReadError::NotFound)
        ));

        // Still no erase size, so the new block size is refused
        probe.set_block_size(16);
        assert!(matches!(
            logger.block_size_changed(16).await,
            Err(RecoveryError::InvalidGeometry(_))
        ));
        assert_eq!(logger.state().block_size, 0);
        assert!(recorder.block_sizes.lock().is_empty());
        assert!(matches!(logger.write(0x10, &[0; 4]).await, Err(WriteError::NotReady)));
    }

    #[tokio::test]
    async fn test_block_size_change_recovers_cursor() {
        let backend = MemoryBackend::new(4, 16, 32);
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        for i in 0..5u8 {
            logger.write(0x20 + i, &[i; 16]).await.unwrap();
        }
        assert_eq!(logger.state().earliest_block, 2);

        let backend = logger.into_backend();
        let probe = backend.probe();
        probe.set_block_size(0);
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        logger.register_events(recorder.clone());
        assert_eq!(logger.state().current_block, 0);
        assert!(matches!(logger.write(0x30, &[0; 4]).await, Err(WriteError::NotReady)));

        probe.set_block_size(16);
        logger.block_size_changed(16).await.unwrap();
        let state = logger.state();
        assert_eq!(state.block_size, 16);
        assert_eq!(state.current_block, 5);
        assert_eq!(state.earliest_block, 2);
        assert_eq!(state.boot_block, 5);
        assert_eq!(*recorder.block_sizes.lock(), vec![16]);

        // Next record continues the second generation instead of overwriting it
        logger.write(0x30, &[9; 16]).await.unwrap();
        assert_eq!(&probe.block(0)[..2], &[2, 0x24]);
        assert_eq!(&probe.block(1)[..2], &[2, 0x30]);
        let mut header = [0u8; 2];
        logger.read(4, 0, &mut header).await.unwrap();
        assert_eq!(header, [2, 0x24]);
    }

    #[tokio::test]
    async fn test_block_size_larger_than_erase_unit() {
        let backend = MemoryBackend::new(4, 16, 32);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        logger.write(0x10, &[0; 16]).await.unwrap();

        probe.set_block_size(64);
        assert!(matches!(
            logger.block_size_changed(64).await,
            Err(RecoveryError::InvalidGeometry(_))
        ));
        let state = logger.state();
        assert_eq!(state.block_size, 16);
        assert_eq!(state.physical_blocks, 4);
        assert_eq!(state.erase_blocks(), 2);
    }

    #[tokio::test]
    async fn test_recovered_cursor_past_logical_limit() {
        let backend = MemoryBackend::new(4, 16, 32).with_logical_blocks(6);
        backend.probe().fill_all(0x03);
        assert!(matches!(
            DataLogger::attach(backend, &test_config()).await,
            Err(Error::Recovery(RecoveryError::BeyondLogicalLimit {
                current_block: 12,
                logical_blocks: 6,
            }))
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_cursor() {
        let backend = MemoryBackend::new(4, 16, 16);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        logger.register_events(recorder.clone());

        probe.inject_failures(Op::Write, 1);
        assert!(matches!(
            logger.write(0x30, &[0; 16]).await,
            Err(WriteError::Backend(BackendError::Fault(_)))
        ));
        assert_eq!(logger.state().current_block, 0);
        assert_eq!(logger.state().bytes_logged, 0);
        assert_eq!(recorder.failures.lock().len(), 1);

        logger.write(0x30, &[0; 16]).await.unwrap();
        assert_eq!(logger.state().current_block, 1);
    }

    #[tokio::test]
    async fn test_erase_failure_before_write() {
        let backend = MemoryBackend::new(4, 16, 32);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        for _ in 0..4 {
            logger.write(0x10, &[0; 16]).await.unwrap();
        }

        probe.inject_failures(Op::Erase, 1);
        assert!(logger.write(0x10, &[0; 16]).await.is_err());
        assert_eq!(logger.state().current_block, 4);
        assert_eq!(logger.state().earliest_block, 0);

        logger.write(0x10, &[0; 16]).await.unwrap();
        assert_eq!(logger.state().current_block, 5);
        assert_eq!(logger.state().earliest_block, 2);
    }

    #[tokio::test]
    async fn test_alignment_padding() {
        let backend = MemoryBackend::new(4, 16, 16).with_write_align(4);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();

        logger.write(0x10, &[0xAA; 5]).await.unwrap();
        let written = probe.last_write().unwrap();
        assert_eq!(written.data.len(), 8);
        assert_eq!(&written.data[5..], &[0xFF; 3]);
        assert_eq!(logger.state().bytes_logged, 8);
    }

    #[tokio::test]
    async fn test_short_records_get_header_room() {
        let backend = MemoryBackend::new(4, 16, 16);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();

        logger.write(0x42, &[]).await.unwrap();
        assert_eq!(probe.last_write().unwrap().data, vec![1, 0x42]);
    }

    #[tokio::test]
    async fn test_write_only_logger() {
        let backend = MemoryBackend::new(4, 16, 16).non_persistent();
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        assert_eq!(logger.state().block_overhead, 0);

        logger.write(0x10, &[0x11; 16]).await.unwrap();
        // No header stamped
        assert_eq!(probe.last_write().unwrap().data, vec![0x11; 16]);
        assert!(matches!(
            logger.read(0, 0, &mut [0; 16]).await,
            Err(ReadError::NotSupported)
        ));
        assert!(matches!(logger.erase(true, None).await, Err(EraseError::NotSupported)));
    }

    #[tokio::test]
    async fn test_read_rejects_missing_data() {
        let backend = MemoryBackend::new(4, 16, 16);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        logger.write(0x10, &[0; 16]).await.unwrap();
        logger.write(0x10, &[0; 16]).await.unwrap();
        probe.clear();

        let mut buf = [0u8; 16];
        logger.read(1, 0, &mut buf).await.unwrap();
        assert!(matches!(logger.read(2, 0, &mut buf).await, Err(ReadError::NotFound)));
        assert!(matches!(logger.read(1, 16, &mut buf).await, Err(ReadError::NotFound)));
        let mut long = [0u8; 32];
        assert!(matches!(logger.read(1, 0, &mut long).await, Err(ReadError::NotFound)));
        assert_eq!(probe.calls(Op::Read), 1);
    }

    #[tokio::test]
    async fn test_erase_resets_counters() {
        let backend = MemoryBackend::new(8, 16, 32);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        for _ in 0..3 {
            logger.write(0x10, &[0; 16]).await.unwrap();
        }

        logger.erase(false, None).await.unwrap();
        assert_eq!(probe.last_reset_hint(), Some(3));
        let state = logger.state();
        assert_eq!((state.current_block, state.earliest_block, state.boot_block), (0, 0, 0));
        assert_eq!(state.bytes_logged, 48);

        logger.erase(true, None).await.unwrap();
        assert_eq!(probe.last_reset_hint(), Some(8));
    }

    #[tokio::test]
    async fn test_erase_failure_keeps_state() {
        let backend = MemoryBackend::new(8, 16, 32);
        let probe = backend.probe();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        logger.write(0x10, &[0; 16]).await.unwrap();

        probe.inject_failures(Op::Reset, 1);
        assert!(matches!(logger.erase(true, None).await, Err(EraseError::Backend(_))));
        assert_eq!(logger.state().current_block, 1);

        let backend = MemoryBackend::new(8, 16, 32).without_reset();
        let mut logger = DataLogger::attach(backend, &test_config()).await.unwrap();
        assert!(matches!(logger.erase(true, None).await, Err(EraseError::NotSupported)));
    }
}
