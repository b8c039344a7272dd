//! Persistence header stamped onto the front of every block
//!
//! Byte 0 holds the generation counter of the logical pass occupying the
//! physical slot, byte 1 holds the caller supplied block type. The counter
//! values `0x00` and `0xFF` mean the slot is erased.

use thiserror::Error;

use crate::backend::MAX_WRAP;

/// Header decode/encode failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Buffer of {actual} bytes cannot hold a {needed} byte block header")]
    Truncated { needed: usize, actual: usize },
}

/// Generation value left behind by an erased slot
pub fn is_sentinel(wrap: u8) -> bool {
    wrap == 0x00 || wrap == 0xFF
}

/// Block header of a persistent logger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// 1-based generation counter
    pub block_wrap: u8,
    /// Caller supplied tag
    pub block_type: u8,
}

impl BlockHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 2;

    pub fn new(block_wrap: u8, block_type: u8) -> Self {
        Self {
            block_wrap,
            block_type,
        }
    }

    /// Header for logical block `logical` on a medium of `physical_blocks`
    ///
    /// Callers keep `logical` below `physical_blocks * MAX_WRAP`, so the
    /// counter never reaches the `0xFF` sentinel.
    pub fn for_logical_block(block_type: u8, logical: u32, physical_blocks: u32) -> Self {
        let wrap = (logical / physical_blocks + 1).min(MAX_WRAP as u32);
        Self::new(wrap as u8, block_type)
    }

    /// Whether this header belongs to an erased slot
    pub fn is_erased(&self) -> bool {
        is_sentinel(self.block_wrap)
    }

    /// Decode a header from the front of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        match buf {
            [block_wrap, block_type, ..] => Ok(Self::new(*block_wrap, *block_type)),
            _ => Err(HeaderError::Truncated {
                needed: Self::SIZE,
                actual: buf.len(),
            }),
        }
    }

    /// Encode this header over the front of `buf`
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), HeaderError> {
        match buf {
            [block_wrap, block_type, ..] => {
                *block_wrap = self.block_wrap;
                *block_type = self.block_type;
                Ok(())
            }
            _ => Err(HeaderError::Truncated {
                needed: Self::SIZE,
                actual: buf.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = [0xAAu8; 6];
        BlockHeader::new(3, 0x42).encode_into(&mut buf).unwrap();
        assert_eq!(buf, [3, 0x42, 0xAA, 0xAA, 0xAA, 0xAA]);
        assert_eq!(BlockHeader::decode(&buf).unwrap(), BlockHeader::new(3, 0x42));
    }

    #[test]
    fn test_truncated_buffers() {
        assert_eq!(
            BlockHeader::decode(&[1]),
            Err(HeaderError::Truncated { needed: 2, actual: 1 })
        );
        let mut empty: [u8; 0] = [];
        assert!(BlockHeader::new(1, 1).encode_into(&mut empty).is_err());
    }

    #[test]
    fn test_generation_counter() {
        assert_eq!(BlockHeader::for_logical_block(7, 0, 4).block_wrap, 1);
        assert_eq!(BlockHeader::for_logical_block(7, 3, 4).block_wrap, 1);
        assert_eq!(BlockHeader::for_logical_block(7, 4, 4).block_wrap, 2);
        assert_eq!(BlockHeader::for_logical_block(7, 4 * 254 - 1, 4).block_wrap, 254);
    }

    #[test]
    fn test_sentinels() {
        assert!(BlockHeader::new(0x00, 0).is_erased());
        assert!(BlockHeader::new(0xFF, 0x10).is_erased());
        assert!(!BlockHeader::new(0xFE, 0x10).is_erased());
        assert!(!is_sentinel(1));
    }
}
