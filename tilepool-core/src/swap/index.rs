//! In-memory view of a swap file's tile index, kept in step with the file on every change.

use std::io::{Read, Seek, SeekFrom, Write};

use az::CheckedAs;

use super::chain::{self, ChainFault, FreeBlock, Traversal, TraversalLimits};
use super::layout::{self, BlockFlags, BlockRecord, BufferHeader, HeaderInfo, Record, TileRecord};
use super::{SwapError, TileKey};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TileSlot {
    record_offset: u64,
    payload_offset: u64,
    /// Index of the record's block within the chain.
    position: usize,
}

/// Tile index over a swap stream `S`.
///
/// Any I/O failure while writing leaves the file in an unknown state relative to this index, so after one
/// every further operation fails with [`SwapError::Poisoned`].
pub struct SwapIndex<S> {
    stream: S,
    header: BufferHeader,
    tiles: hashbrown::HashMap<TileKey, TileSlot>,
    /// Older records for a key in `tiles`, left over from a damaged chain. Still live on disk.
    shadowed: hashbrown::HashMap<TileKey, smallvec::SmallVec<[TileSlot; 1]>>,
    /// Reusable blocks, keyed by chain position so that iteration is in chain order.
    free: std::collections::BTreeMap<usize, FreeBlock>,
    /// Last block of the chain, None if empty.
    tail: Option<u64>,
    chain_len: usize,
    /// Live tile records in the chain. Usually `tiles.len()`, but more if a damaged chain held duplicates.
    live_records: u32,
    /// Where the next appended block or payload goes.
    end: u64,
    /// The walk stopped at its hop limit, so the true end of the chain is unknown.
    incomplete: bool,
    poisoned: bool,
}

impl<S: Read + Seek> SwapIndex<S> {
    /// Read the header and walk the chain, returning the index along with what the walk found.
    ///
    /// A damaged chain is not an error: the index holds whatever could be recovered, see [`Traversal::fault`].
    /// If a tile appears more than once, the record latest in the chain wins. Removing it frees the others too.
    ///
    /// If the walk hit its hop limit, the index is read only: see [`SwapError::Incomplete`].
    /// # Errors
    /// * [`SwapError::StructuralIntegrity`] if record layouts are wrong for this build.
    /// * [`SwapError::BadMagic`] or [`SwapError::NotAHeader`] if this isn't a swap file.
    /// * I/O errors from the stream.
    pub fn open(mut stream: S, limits: TraversalLimits) -> Result<(Self, Traversal), SwapError> {
        layout::verify_layout()?;
        let header: BufferHeader = layout::read_record(&mut stream, 0)?;
        header.validate()?;
        let traversal = chain::walk(&mut stream, &header, limits)?;
        let end = stream
            .seek(SeekFrom::End(0))?
            .max(BufferHeader::SIZE as u64);

        let mut tiles = hashbrown::HashMap::with_capacity(traversal.tiles.len());
        let mut shadowed = hashbrown::HashMap::<TileKey, smallvec::SmallVec<[TileSlot; 1]>>::new();
        for entry in &traversal.tiles {
            let slot = TileSlot {
                record_offset: entry.record_offset,
                payload_offset: entry.payload_offset,
                position: entry.position,
            };
            if let Some(older) = tiles.insert(entry.key, slot) {
                log::debug!(
                    "tile {} at {} shadowed by record at {}",
                    entry.key,
                    older.record_offset,
                    entry.record_offset
                );
                shadowed.entry(entry.key).or_default().push(older);
            }
        }
        let live_records = traversal
            .tiles
            .len()
            .checked_as::<u32>()
            .ok_or(SwapError::TooManyEntries)?;

        let this = Self {
            stream,
            header,
            tiles,
            shadowed,
            free: traversal
                .free
                .iter()
                .map(|block| (block.position, *block))
                .collect(),
            tail: traversal.tail(),
            chain_len: traversal.blocks.len(),
            live_records,
            end,
            incomplete: matches!(traversal.fault, Some(ChainFault::HopLimit { .. })),
            poisoned: false,
        };
        Ok((this, traversal))
    }
    fn ensure_usable(&self) -> Result<(), SwapError> {
        if self.poisoned {
            Err(SwapError::Poisoned)
        } else {
            Ok(())
        }
    }
    /// Payload offset of a tile.
    /// # Errors
    /// [`SwapError::Poisoned`]
    pub fn get(&self, key: TileKey) -> Result<Option<u64>, SwapError> {
        self.ensure_usable()?;
        Ok(self.tiles.get(&key).map(|slot| slot.payload_offset))
    }
    /// All mip levels present for tile (x, y), ascending.
    /// # Errors
    /// [`SwapError::Poisoned`]
    pub fn levels(&self, x: i32, y: i32) -> Result<smallvec::SmallVec<[i32; 4]>, SwapError> {
        self.ensure_usable()?;
        let mut levels: smallvec::SmallVec<[i32; 4]> = self
            .tiles
            .keys()
            .filter(|key| key.x == x && key.y == y)
            .map(|key| key.z)
            .collect();
        levels.sort_unstable();
        Ok(levels)
    }
    /// Every indexed tile and its payload offset, in no particular order.
    pub fn tiles(&self) -> impl Iterator<Item = (TileKey, u64)> + '_ {
        self.tiles
            .iter()
            .map(|(key, slot)| (*key, slot.payload_offset))
    }
    /// Reusable blocks, in chain order.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlock> + '_ {
        self.free.values().copied()
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
    #[must_use]
    pub fn header(&self) -> &BufferHeader {
        &self.header
    }
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write + Seek> SwapIndex<S> {
    /// Start a new swap file in `stream` with an empty chain. Anything already in the stream past the header
    /// is unreachable from the chain, but may be overwritten by later appends.
    /// # Errors
    /// [`SwapError::StructuralIntegrity`], or I/O errors writing the header.
    pub fn create(mut stream: S, info: &HeaderInfo) -> Result<Self, SwapError> {
        layout::verify_layout()?;
        let header = BufferHeader::new(info);
        layout::write_record(&mut stream, 0, &header)?;
        stream.flush()?;
        Ok(Self {
            stream,
            header,
            tiles: hashbrown::HashMap::new(),
            shadowed: hashbrown::HashMap::new(),
            free: std::collections::BTreeMap::new(),
            tail: None,
            chain_len: 0,
            live_records: 0,
            end: BufferHeader::SIZE as u64,
            incomplete: false,
            poisoned: false,
        })
    }
    /// Run a mutation, poisoning self if it fails in a way that may have left the file half written.
    fn guarded<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, SwapError>,
    ) -> Result<T, SwapError> {
        self.ensure_usable()?;
        if self.incomplete {
            return Err(SwapError::Incomplete);
        }
        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("swap index poisoned: {e}");
                self.poisoned = true;
            }
        }
        result
    }
    /// Record that `key`'s pixel data lives at `payload_offset`. Returns the offset of the tile record.
    ///
    /// An existing record for `key` is updated in place. Otherwise the earliest free block in the chain
    /// that can hold a record is reused, and only failing that is a new block appended.
    /// # Errors
    /// [`SwapError::Poisoned`], [`SwapError::Incomplete`], [`SwapError::TooManyEntries`],
    /// [`SwapError::OffsetOverflow`], or I/O errors.
    pub fn insert(&mut self, key: TileKey, payload_offset: u64) -> Result<u64, SwapError> {
        self.guarded(|this| this.insert_inner(key, payload_offset))
    }
    fn insert_inner(&mut self, key: TileKey, payload_offset: u64) -> Result<u64, SwapError> {
        if let Some(slot) = self.tiles.get_mut(&key) {
            let mut record: TileRecord = layout::read_record(&mut self.stream, slot.record_offset)?;
            record.set_payload_offset(payload_offset);
            layout::write_record(&mut self.stream, slot.record_offset, &record)?;
            self.stream.flush()?;
            slot.payload_offset = payload_offset;
            return Ok(slot.record_offset);
        }

        let live_records = self
            .live_records
            .checked_add(1)
            .ok_or(SwapError::TooManyEntries)?;
        let first_fit = self
            .free
            .values()
            .find(|block| block.fits_tile())
            .copied();

        let (record_offset, position) = if let Some(block) = first_fit {
            // Keep the block's length and its place in the chain.
            let existing: BlockRecord = layout::read_record(&mut self.stream, block.offset)?;
            let record = TileRecord::new(key, payload_offset).with_block(BlockRecord::new(
                existing.length(),
                BlockFlags::TILE,
                existing.next(),
            ));
            layout::write_record(&mut self.stream, block.offset, &record)?;
            self.free.remove(&block.position);
            (block.offset, block.position)
        } else {
            let offset = self.end;
            let end = offset
                .checked_add(TileRecord::SIZE as u64)
                .ok_or(SwapError::OffsetOverflow)?;
            layout::write_record(
                &mut self.stream,
                offset,
                &TileRecord::new(key, payload_offset),
            )?;
            self.link(offset)?;
            self.end = end;
            let position = self.chain_len;
            self.chain_len += 1;
            (offset, position)
        };

        self.tiles.insert(
            key,
            TileSlot {
                record_offset,
                payload_offset,
                position,
            },
        );
        self.live_records = live_records;
        self.write_header()?;
        Ok(record_offset)
    }
    /// Make the block at `offset` the new end of the chain. The header is not written here.
    fn link(&mut self, offset: u64) -> Result<(), SwapError> {
        match self.tail {
            Some(tail) => {
                let mut block: BlockRecord = layout::read_record(&mut self.stream, tail)?;
                block.set_next(offset);
                layout::write_record(&mut self.stream, tail, &block)?;
            }
            None => self.header.set_next(offset),
        }
        self.tail = Some(offset);
        Ok(())
    }
    fn write_header(&mut self) -> Result<(), SwapError> {
        self.header.set_entry_count(self.live_records);
        layout::write_record(&mut self.stream, 0, &self.header)?;
        self.stream.flush()?;
        Ok(())
    }
    /// Evict a tile from the index, returning its payload offset. Its record is flagged free and stays in the chain.
    /// # Errors
    /// [`SwapError::Poisoned`], [`SwapError::Incomplete`], or I/O errors.
    pub fn remove(&mut self, key: TileKey) -> Result<Option<u64>, SwapError> {
        self.guarded(|this| {
            let Some(slot) = this.tiles.get(&key).copied() else {
                return Ok(None);
            };
            this.free_record(slot)?;
            this.tiles.remove(&key);
            for older in this.shadowed.remove(&key).unwrap_or_default() {
                this.free_record(older)?;
            }
            this.write_header()?;
            Ok(Some(slot.payload_offset))
        })
    }
    /// Flag a live record free and make it available for reuse. The header is not written here.
    fn free_record(&mut self, slot: TileSlot) -> Result<(), SwapError> {
        let mut block: BlockRecord = layout::read_record(&mut self.stream, slot.record_offset)?;
        block.set_flags(block.flags() | BlockFlags::TILE_FREE);
        layout::write_record(&mut self.stream, slot.record_offset, &block)?;
        self.free.insert(
            slot.position,
            FreeBlock {
                offset: slot.record_offset,
                length: block.length(),
                position: slot.position,
            },
        );
        self.live_records = self.live_records.saturating_sub(1);
        Ok(())
    }
    /// Claim `len` bytes at the end of the file for a tile payload, returning their offset.
    /// Nothing is written - the space is only kept clear of future index blocks.
    /// # Errors
    /// [`SwapError::Poisoned`] or [`SwapError::OffsetOverflow`].
    pub fn reserve_payload(&mut self, len: u64) -> Result<u64, SwapError> {
        self.ensure_usable()?;
        let offset = self.end;
        self.end = offset.checked_add(len).ok_or(SwapError::OffsetOverflow)?;
        Ok(offset)
    }
}
