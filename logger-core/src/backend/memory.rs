//! In-memory NOR flash style backend
//!
//! Erasing sets bytes to the erase value and writes may only land on erased
//! bytes. A [`MemoryProbe`] shares the media with the backend, so tests can
//! still reach the raw bytes and call history once the backend has been
//! moved into a logger.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::backend_trait::{BackendError, BackendGeometry, LoggerBackend, Result, MAX_WRAP};

/// Backend operations tracked by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Write,
    Read,
    Erase,
    Reset,
    SearchHint,
}

impl Op {
    fn index(self) -> usize {
        match self {
            Op::Write => 0,
            Op::Read => 1,
            Op::Erase => 2,
            Op::Reset => 3,
            Op::SearchHint => 4,
        }
    }
}

/// Arguments of the most recent write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub phys_block: u32,
    pub block_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Shared {
    media: Vec<u8>,
    geometry: BackendGeometry,
    persistent: bool,
    supports_reset: bool,
    checked_writes: bool,
    search_hint: Option<(u32, u32)>,
    calls: [u32; 5],
    pending_faults: [u32; 5],
    last_write: Option<WriteRecord>,
    last_read: Option<(u32, u16, usize)>,
    last_erase: Option<(u32, u32)>,
    last_reset_hint: Option<u32>,
    reset_gate: Option<Arc<Semaphore>>,
}

impl Shared {
    /// Count the call and consume a pending fault if one is armed
    fn enter(&mut self, op: Op) -> Result<()> {
        self.calls[op.index()] += 1;
        let faults = &mut self.pending_faults[op.index()];
        if *faults > 0 {
            if *faults != u32::MAX {
                *faults -= 1;
            }
            return Err(BackendError::Fault(format!("injected {:?} failure", op)));
        }
        Ok(())
    }

    fn block_offset(&self, phys_block: u32) -> Result<usize> {
        if phys_block >= self.geometry.physical_blocks {
            return Err(BackendError::InvalidBlockNumber(phys_block));
        }
        Ok(phys_block as usize * self.geometry.block_size as usize)
    }

    fn erase_range(&mut self, phys_block: u32, num: u32) -> Result<()> {
        let start = self.block_offset(phys_block)?;
        let len = num as usize * self.geometry.block_size as usize;
        let end = start + len;
        if end > self.media.len() {
            return Err(BackendError::OutOfRange { offset: start as u64, len });
        }
        let erase_val = self.geometry.erase_val;
        self.media[start..end].fill(erase_val);
        Ok(())
    }
}

/// Simulated flash medium held entirely in memory
#[derive(Debug)]
pub struct MemoryBackend {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side view onto a [`MemoryBackend`]
#[derive(Debug, Clone)]
pub struct MemoryProbe {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryBackend {
    /// Create an erased medium of `physical_blocks` blocks
    pub fn new(physical_blocks: u32, block_size: u16, erase_size: u16) -> Self {
        let geometry = BackendGeometry {
            physical_blocks,
            logical_blocks: physical_blocks.saturating_mul(MAX_WRAP as u32),
            block_size,
            erase_size,
            erase_val: 0xFF,
            block_write_align: 1,
            requires_full_block_write: false,
        };
        let shared = Shared {
            media: vec![0xFF; physical_blocks as usize * block_size as usize],
            geometry,
            persistent: true,
            supports_reset: true,
            checked_writes: true,
            search_hint: None,
            calls: [0; 5],
            pending_faults: [0; 5],
            last_write: None,
            last_read: None,
            last_erase: None,
            last_reset_hint: None,
            reset_gate: None,
        };
        Self {
            shared: Arc::new(Mutex::new(shared)),
        }
    }

    /// Get a probe sharing this backend's media
    pub fn probe(&self) -> MemoryProbe {
        MemoryProbe {
            shared: self.shared.clone(),
        }
    }

    /// Limit the lifetime block count
    pub fn with_logical_blocks(self, logical_blocks: u32) -> Self {
        self.shared.lock().geometry.logical_blocks = logical_blocks;
        self
    }

    /// Use a different erased byte value and re-erase the medium
    pub fn with_erase_val(self, erase_val: u8) -> Self {
        {
            let mut shared = self.shared.lock();
            shared.geometry.erase_val = erase_val;
            shared.media.fill(erase_val);
        }
        self
    }

    /// Require write lengths to be a multiple of `align`
    pub fn with_write_align(self, align: u8) -> Self {
        self.shared.lock().geometry.block_write_align = align;
        self
    }

    /// Only accept writes of exactly one block
    pub fn full_block_writes(self) -> Self {
        self.shared.lock().geometry.requires_full_block_write = true;
        self
    }

    /// Behave as a write-only backend without read-back
    pub fn non_persistent(self) -> Self {
        self.shared.lock().persistent = false;
        self
    }

    /// Report a recovery search range
    pub fn with_search_hint(self, low: u32, high: u32) -> Self {
        self.shared.lock().search_hint = Some((low, high));
        self
    }

    /// Drop support for `reset`
    pub fn without_reset(self) -> Self {
        self.shared.lock().supports_reset = false;
        self
    }

    /// Allow writes over bytes that have not been erased
    pub fn unchecked_writes(self) -> Self {
        self.shared.lock().checked_writes = false;
        self
    }
}

impl MemoryProbe {
    /// Number of times `op` has been called
    pub fn calls(&self, op: Op) -> u32 {
        self.shared.lock().calls[op.index()]
    }

    /// Fail the next `count` calls of `op` (`u32::MAX` fails forever)
    pub fn inject_failures(&self, op: Op, count: u32) {
        self.shared.lock().pending_faults[op.index()] = count;
    }

    /// Clear all call counters and armed faults
    pub fn clear(&self) {
        let mut shared = self.shared.lock();
        shared.calls = [0; 5];
        shared.pending_faults = [0; 5];
        shared.last_write = None;
        shared.last_read = None;
        shared.last_erase = None;
        shared.last_reset_hint = None;
    }

    pub fn last_write(&self) -> Option<WriteRecord> {
        self.shared.lock().last_write.clone()
    }

    pub fn last_read(&self) -> Option<(u32, u16, usize)> {
        self.shared.lock().last_read
    }

    pub fn last_erase(&self) -> Option<(u32, u32)> {
        self.shared.lock().last_erase
    }

    pub fn last_reset_hint(&self) -> Option<u32> {
        self.shared.lock().last_reset_hint
    }

    /// Copy of the raw media bytes
    pub fn media(&self) -> Vec<u8> {
        self.shared.lock().media.clone()
    }

    /// Raw bytes of one physical block
    pub fn block(&self, phys_block: u32) -> Vec<u8> {
        let shared = self.shared.lock();
        let bs = shared.geometry.block_size as usize;
        let start = phys_block as usize * bs;
        shared.media[start..start + bs].to_vec()
    }

    /// Overwrite `len` media bytes starting at `offset` with `value`
    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        let mut shared = self.shared.lock();
        let end = (offset + len).min(shared.media.len());
        shared.media[offset..end].fill(value);
    }

    /// Overwrite the whole medium with `value`
    pub fn fill_all(&self, value: u8) {
        self.shared.lock().media.fill(value);
    }

    /// Change the reported block size, keeping the media length
    ///
    /// A medium created without a block size is allocated erased on the
    /// first non-zero size.
    pub fn set_block_size(&self, block_size: u16) {
        let mut shared = self.shared.lock();
        shared.geometry.block_size = block_size;
        if block_size == 0 {
            // Block count is kept until a size is known again
            return;
        }
        if shared.media.is_empty() {
            let len = shared.geometry.physical_blocks as usize * block_size as usize;
            let erase_val = shared.geometry.erase_val;
            shared.media = vec![erase_val; len];
        } else {
            shared.geometry.physical_blocks = (shared.media.len() / block_size as usize) as u32;
        }
    }

    /// Hold every `reset` until [`MemoryProbe::release_reset`] is called
    pub fn gate_reset(&self) {
        self.shared.lock().reset_gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one gated `reset` complete
    pub fn release_reset(&self) {
        if let Some(gate) = &self.shared.lock().reset_gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl LoggerBackend for MemoryBackend {
    fn geometry(&self) -> BackendGeometry {
        self.shared.lock().geometry
    }

    fn is_persistent(&self) -> bool {
        self.shared.lock().persistent
    }

    async fn write(&mut self, phys_block: u32, block_type: u8, data: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.enter(Op::Write)?;
        shared.last_write = Some(WriteRecord {
            phys_block,
            block_type,
            data: data.to_vec(),
        });

        let geometry = shared.geometry;
        if data.len() > geometry.block_size as usize {
            return Err(BackendError::InvalidLength(data.len()));
        }
        if geometry.requires_full_block_write && data.len() != geometry.block_size as usize {
            return Err(BackendError::InvalidLength(data.len()));
        }
        let align = geometry.block_write_align.max(1) as usize;
        if data.len() % align != 0 {
            return Err(BackendError::InvalidLength(data.len()));
        }

        let start = shared.block_offset(phys_block)?;
        let end = start + data.len();
        if shared.checked_writes {
            let dirty = shared.media[start..end]
                .iter()
                .position(|b| *b != geometry.erase_val);
            if let Some(pos) = dirty {
                return Err(BackendError::NotErased((start + pos) as u64));
            }
        }
        shared.media[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read(&mut self, phys_block: u32, offset: u16, buf: &mut [u8]) -> Result<()> {
        let mut shared = self.shared.lock();
        if !shared.persistent {
            return Err(BackendError::Unsupported);
        }
        shared.enter(Op::Read)?;
        shared.last_read = Some((phys_block, offset, buf.len()));

        let start = shared.block_offset(phys_block)? + offset as usize;
        let end = start + buf.len();
        if end > shared.media.len() {
            return Err(BackendError::OutOfRange {
                offset: start as u64,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&shared.media[start..end]);
        Ok(())
    }

    async fn erase(&mut self, phys_block: u32, num: u32) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.enter(Op::Erase)?;
        shared.last_erase = Some((phys_block, num));
        shared.erase_range(phys_block, num)
    }

    async fn reset(
        &mut self,
        block_hint: u32,
        progress: Option<&(dyn Fn(u32) + Send + Sync)>,
    ) -> Result<()> {
        let gate = {
            let mut shared = self.shared.lock();
            if !shared.supports_reset {
                return Err(BackendError::Unsupported);
            }
            shared.enter(Op::Reset)?;
            shared.last_reset_hint = Some(block_hint);
            shared.reset_gate.clone()
        };
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| BackendError::Fault(e.to_string()))?;
            permit.forget();
        }

        let mut shared = self.shared.lock();
        let geometry = shared.geometry;
        let erase_blocks = geometry.erase_blocks().max(1);
        let mut erased = 0;
        while erased < block_hint.min(geometry.physical_blocks) {
            let num = erase_blocks.min(geometry.physical_blocks - erased);
            shared.erase_range(erased, num)?;
            erased += num;
            if let Some(progress) = progress {
                progress(erased);
            }
        }
        Ok(())
    }

    async fn search_hint(&mut self) -> Result<(u32, u32)> {
        let mut shared = self.shared.lock();
        shared.enter(Op::SearchHint)?;
        shared.search_hint.ok_or(BackendError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_erase_then_write() {
        let mut backend = MemoryBackend::new(4, 16, 32);
        let probe = backend.probe();

        backend.write(0, 0x10, &[0xAA; 16]).await.unwrap();
        assert!(matches!(
            backend.write(0, 0x10, &[0xBB; 16]).await,
            Err(BackendError::NotErased(0))
        ));

        backend.erase(0, 2).await.unwrap();
        backend.write(0, 0x10, &[0xBB; 16]).await.unwrap();
        assert_eq!(probe.block(0), vec![0xBB; 16]);
        assert_eq!(probe.last_erase(), Some((0, 2)));
        assert_eq!(probe.calls(Op::Write), 3);
    }

    #[tokio::test]
    async fn test_read_spans_blocks() {
        let mut backend = MemoryBackend::new(4, 16, 16);
        backend.write(1, 0, &[1; 16]).await.unwrap();
        backend.write(2, 0, &[2; 16]).await.unwrap();

        let mut buf = [0u8; 8];
        backend.read(1, 12, &mut buf).await.unwrap();
        assert_eq!(buf, [1, 1, 1, 1, 2, 2, 2, 2]);

        let mut buf = [0u8; 32];
        assert!(matches!(
            backend.read(3, 0, &mut buf).await,
            Err(BackendError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let mut backend = MemoryBackend::new(4, 16, 16);
        let probe = backend.probe();
        probe.inject_failures(Op::Write, 1);

        assert!(matches!(
            backend.write(0, 0, &[0; 4]).await,
            Err(BackendError::Fault(_))
        ));
        backend.write(0, 0, &[0; 4]).await.unwrap();
        assert_eq!(probe.calls(Op::Write), 2);
    }

    #[tokio::test]
    async fn test_reset_reports_progress() {
        let mut backend = MemoryBackend::new(8, 16, 32);
        let probe = backend.probe();
        probe.fill_all(0x00);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = move |blocks: u32| sink.lock().push(blocks);
        backend.reset(5, Some(&progress)).await.unwrap();

        assert_eq!(*seen.lock(), vec![2, 4, 6]);
        assert_eq!(probe.last_reset_hint(), Some(5));
        assert_eq!(probe.block(5), vec![0xFF; 16]);
        assert_eq!(probe.block(6), vec![0x00; 16]);
    }

    #[tokio::test]
    async fn test_alignment_and_full_blocks() {
        let mut aligned = MemoryBackend::new(4, 16, 16).with_write_align(4);
        assert!(aligned.write(0, 0, &[0; 6]).await.is_err());
        aligned.write(0, 0, &[0; 8]).await.unwrap();

        let mut full = MemoryBackend::new(4, 16, 16).full_block_writes();
        assert!(full.write(0, 0, &[0; 8]).await.is_err());
        full.write(0, 0, &[0; 16]).await.unwrap();
    }
}
