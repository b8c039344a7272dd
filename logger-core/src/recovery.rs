//! Power-loss recovery of the write cursor
//!
//! All logger state is rebuilt from the block headers already on the medium.
//! The search works over any [`HeaderSource`], so it can run against a live
//! backend or against a synthetic array of headers.

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::{BackendError, LoggerBackend};
use crate::header::{BlockHeader, HeaderError};

/// Recovery failures
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// Reading a header from the backend failed
    #[error("Backend error during recovery: {0}")]
    Backend(#[from] BackendError),

    /// A header could not be decoded
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// No engine-written data was found where the search expected it
    #[error("Inconsistent medium: no valid block within {probes} blocks of logical block {start}")]
    Inconsistent { start: u32, probes: u32 },

    /// The backend reported a geometry the logger cannot address
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The recovered cursor lies past the configured lifetime limit
    #[error("Recovered block {current_block} is past the {logical_blocks} block limit")]
    BeyondLogicalLimit { current_block: u32, logical_blocks: u32 },
}

/// Read access to the header of each physical block
#[async_trait]
pub trait HeaderSource: Send {
    /// Header stored at the front of `phys_block`
    async fn read_header(&mut self, phys_block: u32) -> Result<BlockHeader, RecoveryError>;

    /// Inclusive physical range known to contain the last written block
    async fn search_hint(&mut self) -> Option<(u32, u32)> {
        None
    }
}

#[async_trait]
impl HeaderSource for Vec<BlockHeader> {
    async fn read_header(&mut self, phys_block: u32) -> Result<BlockHeader, RecoveryError> {
        self.get(phys_block as usize)
            .copied()
            .ok_or(RecoveryError::Backend(BackendError::InvalidBlockNumber(phys_block)))
    }
}

/// Header reads served by a live backend
pub struct BackendHeaders<'a, B: LoggerBackend> {
    backend: &'a mut B,
}

impl<'a, B: LoggerBackend> BackendHeaders<'a, B> {
    pub fn new(backend: &'a mut B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<'a, B: LoggerBackend> HeaderSource for BackendHeaders<'a, B> {
    async fn read_header(&mut self, phys_block: u32) -> Result<BlockHeader, RecoveryError> {
        let mut buf = [0u8; BlockHeader::SIZE];
        self.backend.read(phys_block, 0, &mut buf).await?;
        Ok(BlockHeader::decode(&buf)?)
    }

    async fn search_hint(&mut self) -> Option<(u32, u32)> {
        match self.backend.search_hint().await {
            Ok(range) => Some(range),
            Err(BackendError::Unsupported) => None,
            Err(e) => {
                log::debug!("Search hint failed, using full range: {}", e);
                None
            }
        }
    }
}

/// Medium shape used by the search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryParams {
    pub physical_blocks: u32,
    /// Blocks per erase unit
    pub erase_blocks: u32,
    /// Retention scan budget, in erase units
    pub scan_erase_units: u32,
}

/// Cursor state rebuilt from the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Recovered {
    pub current_block: u32,
    pub earliest_block: u32,
}

/// Rebuild the write cursor and retention boundary from block headers
pub async fn recover<S>(source: &mut S, params: &RecoveryParams) -> Result<Recovered, RecoveryError>
where
    S: HeaderSource + ?Sized,
{
    let physical = params.physical_blocks;
    if physical == 0 {
        return Err(RecoveryError::InvalidGeometry(
            "medium has no physical blocks".to_string(),
        ));
    }

    let first = source.read_header(0).await?;
    let last = source.read_header(physical - 1).await?;

    if first.is_erased() && last.is_erased() {
        // Nothing written yet
        return Ok(Recovered::default());
    }

    if first.block_wrap == last.block_wrap {
        // Every block holds the same generation
        let current_block = first.block_wrap as u32 * physical;
        return Ok(Recovered {
            current_block,
            earliest_block: current_block - physical,
        });
    }

    if first.is_erased() {
        // Front erase unit cleared ahead of the next pass
        let current_block = last.block_wrap as u32 * physical;
        return Ok(Recovered {
            current_block,
            earliest_block: current_block - physical + params.erase_blocks,
        });
    }

    let range = source
        .search_hint()
        .await
        .filter(|(low, high)| low <= high && *high < physical)
        .unwrap_or((0, physical - 1));
    let last_old = search_last_with_wrap(source, first.block_wrap, range).await?;
    let current_block = (first.block_wrap as u32 - 1) * physical + last_old + 1;

    if first.block_wrap == 1 {
        // First pass still in progress, nothing has been erased
        return Ok(Recovered {
            current_block,
            earliest_block: 0,
        });
    }

    let earliest_block = scan_earliest(source, current_block - physical, params).await?;
    Ok(Recovered {
        current_block,
        earliest_block,
    })
}

/// Highest physical index in `range` whose header carries `wrap`
///
/// Headers matching `wrap` must form a prefix of the range. Returns the
/// start of the range when nothing matches.
pub async fn search_last_with_wrap<S>(
    source: &mut S,
    wrap: u8,
    range: (u32, u32),
) -> Result<u32, RecoveryError>
where
    S: HeaderSource + ?Sized,
{
    let (low, high) = range;
    let mut lo = low;
    let mut hi = high + 1;
    let mut res = low;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let header = source.read_header(mid).await?;
        if header.block_wrap == wrap {
            res = mid;
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(res)
}

/// First logical block at or after `start` that still holds data
///
/// Erased slots are skipped one block at a time. Reaching the end of the
/// medium ends the scan successfully.
pub async fn scan_earliest<S>(
    source: &mut S,
    start: u32,
    params: &RecoveryParams,
) -> Result<u32, RecoveryError>
where
    S: HeaderSource + ?Sized,
{
    let physical = params.physical_blocks;
    let probes = params.scan_erase_units.saturating_mul(params.erase_blocks);
    let mut earliest = start;
    let mut phys = start % physical;

    for _ in 0..probes {
        let header = source.read_header(phys).await?;
        if !header.is_erased() {
            return Ok(earliest);
        }
        earliest += 1;
        phys += 1;
        if phys == physical {
            return Ok(earliest);
        }
    }

    log::warn!(
        "Data search failed after {} probes from block {} (pre-existing data on medium?)",
        probes,
        start
    );
    Err(RecoveryError::Inconsistent { start, probes })
}
