//! # Swap index
//!
//! When tiles leave memory, their pixel data goes to a swap file and a record of where it went is kept in
//! that same file: a header, followed by a singly linked chain of blocks, each tile's block naming its
//! coordinate, mip level, and payload offset. Reading the chain back rebuilds the tile -> offset map without
//! touching any payloads.
//!
//! Records are never unlinked from the chain. A tile that is evicted has its block flagged free, and the
//! next record written reuses the earliest free block that fits.
//!
//! The chain is untrusted input: [`walk`] stops on cycles, on runaway lengths, and on offsets leading
//! outside the file, handing back whatever it managed to collect.

pub mod chain;
pub mod index;
pub mod layout;

pub use chain::{walk, ChainFault, CountMismatch, FreeBlock, TileEntry, Traversal, TraversalLimits};
pub use index::SwapIndex;
pub use layout::{
    verify_layout, BlockFlags, BlockRecord, BufferHeader, Description, HeaderInfo, LayoutMismatch,
    Record, TileRecord,
};

/// Address of one tile: its position in tile units and mip level.
/// `z == 0` is full resolution, each level above halves it. Levels of the same (x, y) are independent tiles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}
impl TileKey {
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
    /// Full resolution tile at (x, y).
    #[must_use]
    pub const fn full(x: i32, y: i32) -> Self {
        Self { x, y, z: 0 }
    }
}
impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}) @ {}", self.x, self.y, self.z)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SwapError {
    #[error("structural integrity failure: {0}")]
    StructuralIntegrity(#[from] LayoutMismatch),
    #[error("bad magic {0:x?}")]
    BadMagic([u8; 4]),
    #[error("first block is not a header (flags {0:?})")]
    NotAHeader(BlockFlags),
    #[error("format name {0:?} does not fit a swap description")]
    BadDescription(String),
    #[error("index is unusable after an earlier failure")]
    Poisoned,
    #[error("chain was cut short by its hop limit, reopen with more slack to modify it")]
    Incomplete,
    #[error("too many tile entries")]
    TooManyEntries,
    #[error("file offset overflow")]
    OffsetOverflow,
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}
impl SwapError {
    /// Whether the index that raised this can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StructuralIntegrity(_) | Self::IOError(_) | Self::Poisoned
        )
    }
}
