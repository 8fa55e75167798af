//! Bounded traversal of the block chain.

use std::io::{ErrorKind as IOErrorKind, Read, Seek, SeekFrom};

use super::layout::{self, BlockFlags, BlockRecord, BufferHeader, Record, TileRecord};
use super::{SwapError, TileKey};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraversalLimits {
    /// Live and unrecognized blocks allowed past the header's `entry_count`. Free blocks are not charged.
    pub slack_hops: u32,
}
impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            slack_hops: crate::config::DEFAULT_SLACK_HOPS,
        }
    }
}

/// Why a walk stopped early.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainFault {
    /// `offset` was reached a second time.
    Cycle { offset: u64 },
    /// The chain holds more than `limit` charged blocks, or more blocks than could fit in the file.
    HopLimit { limit: u64 },
    /// A link points into the header or past the end of the file.
    OutOfBounds { offset: u64 },
    /// The file ended partway through the block at `offset`.
    Truncated { offset: u64 },
    /// A tile block too short to hold a tile record.
    BadBlock { offset: u64, length: u32 },
}
impl std::fmt::Display for ChainFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle { offset } => write!(f, "cycle back to block at {offset}"),
            Self::HopLimit { limit } => write!(f, "chain exceeds {limit} blocks"),
            Self::OutOfBounds { offset } => write!(f, "link to {offset} is out of bounds"),
            Self::Truncated { offset } => write!(f, "block at {offset} is truncated"),
            Self::BadBlock { offset, length } => {
                write!(f, "tile block at {offset} has bad length {length}")
            }
        }
    }
}

/// The number of live tiles found didn't match the header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CountMismatch {
    pub expected: u32,
    pub found: usize,
}

/// A live tile record, as found in the chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TileEntry {
    pub key: TileKey,
    pub payload_offset: u64,
    pub record_offset: u64,
    /// Index of the block within the chain.
    pub position: usize,
}

/// A tile block flagged free.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: u64,
    pub length: u32,
    /// Index of the block within the chain.
    pub position: usize,
}
impl FreeBlock {
    /// Whether a tile record can be written here.
    #[must_use]
    pub fn fits_tile(&self) -> bool {
        self.length as usize >= TileRecord::SIZE
    }
}

/// Everything learned from one walk of the chain.
#[derive(Clone, Debug, Default)]
pub struct Traversal {
    /// Live tiles, in chain order.
    pub tiles: Vec<TileEntry>,
    /// Free tile blocks, in chain order.
    pub free: Vec<FreeBlock>,
    /// Offsets of every block visited, in chain order.
    pub blocks: Vec<u64>,
    /// Set if the walk was cut short. Everything above is still valid up to that point.
    pub fault: Option<ChainFault>,
    /// Set if the walk completed but found a different number of tiles than the header claims.
    pub count_mismatch: Option<CountMismatch>,
}
impl Traversal {
    /// Walked to the end and found what the header promised.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.fault.is_none() && self.count_mismatch.is_none()
    }
    /// The last block reached, to which new blocks get linked.
    #[must_use]
    pub fn tail(&self) -> Option<u64> {
        self.blocks.last().copied()
    }
}

/// Walk the chain starting from `header`, collecting tile and free block records.
///
/// The walk never loops: it never visits the same offset twice. Live tile and unrecognized blocks are charged
/// against `entry_count + slack_hops`. Free blocks are not, since removal leaves them linked, but the whole
/// chain may hold no more blocks than the file has room for.
/// Corruption ends the walk early with [`Traversal::fault`] set rather than failing.
/// # Errors
/// I/O errors from `stream` other than hitting the end of the file.
pub fn walk<S: Read + Seek>(
    stream: &mut S,
    header: &BufferHeader,
    limits: TraversalLimits,
) -> Result<Traversal, SwapError> {
    let file_len = stream.seek(SeekFrom::End(0))?;
    let limit = u64::from(header.entry_count()) + u64::from(limits.slack_hops);
    let max_blocks = file_len.saturating_sub(BufferHeader::SIZE as u64) / BlockRecord::SIZE as u64;

    let mut traversal = Traversal::default();
    let mut charged = 0u64;
    let mut visited = hashbrown::HashSet::<u64>::new();
    let mut cursor = header.next();

    let fault = loop {
        if cursor == 0 {
            break None;
        }
        if traversal.blocks.len() as u64 >= max_blocks {
            break Some(ChainFault::HopLimit { limit: max_blocks });
        }
        if !visited.insert(cursor) {
            break Some(ChainFault::Cycle { offset: cursor });
        }
        let in_bounds = cursor >= BufferHeader::SIZE as u64
            && cursor
                .checked_add(BlockRecord::SIZE as u64)
                .is_some_and(|end| end <= file_len);
        if !in_bounds {
            break Some(ChainFault::OutOfBounds { offset: cursor });
        }

        let block: BlockRecord = match layout::read_record(stream, cursor) {
            Ok(block) => block,
            Err(e) if e.kind() == IOErrorKind::UnexpectedEof => {
                break Some(ChainFault::Truncated { offset: cursor })
            }
            Err(e) => return Err(e.into()),
        };
        let position = traversal.blocks.len();

        if !block.is_free_tile() {
            if charged >= limit {
                break Some(ChainFault::HopLimit { limit });
            }
            charged += 1;
        }
        if block.flags().contains(BlockFlags::TILE) {
            if block.is_free_tile() {
                traversal.free.push(FreeBlock {
                    offset: cursor,
                    length: block.length(),
                    position,
                });
            } else {
                if (block.length() as usize) < TileRecord::SIZE {
                    break Some(ChainFault::BadBlock {
                        offset: cursor,
                        length: block.length(),
                    });
                }
                let tile: TileRecord = match layout::read_record(stream, cursor) {
                    Ok(tile) => tile,
                    Err(e) if e.kind() == IOErrorKind::UnexpectedEof => {
                        break Some(ChainFault::Truncated { offset: cursor })
                    }
                    Err(e) => return Err(e.into()),
                };
                traversal.tiles.push(TileEntry {
                    key: tile.key(),
                    payload_offset: tile.payload_offset(),
                    record_offset: cursor,
                    position,
                });
            }
        } else {
            // Not ours to interpret. Follow the link regardless.
            log::debug!("skipping block at {cursor} with flags {:?}", block.flags());
        }
        traversal.blocks.push(cursor);
        cursor = block.next();
    };

    if let Some(fault) = fault {
        log::warn!(
            "swap chain corrupt: {fault}. Recovered {} tiles.",
            traversal.tiles.len()
        );
        traversal.fault = Some(fault);
    } else if traversal.tiles.len() != header.entry_count() as usize {
        log::warn!(
            "swap header expects {} tiles, chain holds {}",
            header.entry_count(),
            traversal.tiles.len()
        );
        traversal.count_mismatch = Some(CountMismatch {
            expected: header.entry_count(),
            found: traversal.tiles.len(),
        });
    }
    Ok(traversal)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::{walk, ChainFault, TraversalLimits};
    use crate::swap::layout::{write_record, BlockFlags, BlockRecord, BufferHeader, TileRecord};
    use crate::swap::{Description, HeaderInfo, TileKey};

    fn header(next: u64, entry_count: u32) -> BufferHeader {
        let mut header = BufferHeader::new(&HeaderInfo {
            tile_width: 32,
            tile_height: 32,
            bytes_per_pixel: 1,
            description: Description::new("Y u8", None).unwrap(),
            bounds: crate::view::Rect {
                x: 0,
                y: 0,
                width: 32,
                height: 32,
            },
        });
        header.set_next(next);
        header.set_entry_count(entry_count);
        header
    }

    #[test]
    fn skips_foreign_blocks() {
        let header = header(256, 1);
        let mut file = Cursor::new(Vec::new());
        write_record(&mut file, 0, &header).unwrap();
        // Some other kind of block, with bits nobody here knows.
        let foreign = BlockRecord::new(32, BlockFlags::from_bits_retain(0x100), 288);
        write_record(&mut file, 256, &foreign).unwrap();
        write_record(&mut file, 288, &TileRecord::new(TileKey::new(4, 5, 1), 77)).unwrap();

        let traversal = walk(&mut file, &header, TraversalLimits::default()).unwrap();
        assert!(traversal.is_clean(), "{traversal:?}");
        assert_eq!(traversal.blocks, &[256, 288]);
        assert_eq!(traversal.tiles.len(), 1);
        assert_eq!(traversal.tiles[0].key, TileKey::new(4, 5, 1));
        assert_eq!(traversal.tiles[0].payload_offset, 77);
        assert_eq!(traversal.tiles[0].position, 1);
        assert_eq!(traversal.tail(), Some(288));
    }
    #[test]
    fn short_tile_block() {
        let header = header(256, 1);
        let mut file = Cursor::new(Vec::new());
        write_record(&mut file, 0, &header).unwrap();
        let tile = TileRecord::new(TileKey::full(0, 0), 0)
            .with_block(BlockRecord::new(64, BlockFlags::TILE, 0));
        write_record(&mut file, 256, &tile).unwrap();

        let traversal = walk(&mut file, &header, TraversalLimits::default()).unwrap();
        assert_eq!(
            traversal.fault,
            Some(ChainFault::BadBlock {
                offset: 256,
                length: 64
            })
        );
        assert!(traversal.tiles.is_empty());
        // A fault means the count goes unchecked.
        assert_eq!(traversal.count_mismatch, None);
    }
    #[test]
    fn free_blocks_uncharged() {
        let header = header(256, 1);
        let mut file = Cursor::new(Vec::new());
        write_record(&mut file, 0, &header).unwrap();
        for offset in [256, 384] {
            let free = TileRecord::new(TileKey::full(0, 0), 0)
                .with_block(BlockRecord::new(128, BlockFlags::TILE_FREE, offset + 128));
            write_record(&mut file, offset, &free).unwrap();
        }
        write_record(&mut file, 512, &TileRecord::new(TileKey::full(1, 1), 9)).unwrap();

        let traversal = walk(&mut file, &header, TraversalLimits { slack_hops: 0 }).unwrap();
        assert!(traversal.is_clean(), "{traversal:?}");
        assert_eq!(traversal.free.len(), 2);
        assert_eq!(traversal.tiles.len(), 1);
    }
    #[test]
    fn zero_limit() {
        let header = header(256, 0);
        let mut file = Cursor::new(Vec::new());
        write_record(&mut file, 0, &header).unwrap();
        write_record(&mut file, 256, &TileRecord::new(TileKey::full(0, 0), 0)).unwrap();

        let traversal = walk(&mut file, &header, TraversalLimits { slack_hops: 0 }).unwrap();
        assert_eq!(traversal.fault, Some(ChainFault::HopLimit { limit: 0 }));
        assert!(traversal.blocks.is_empty());
    }
}
