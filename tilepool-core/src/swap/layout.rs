//! # Swap file layout
//!
//! Every multi-byte field is little endian. Records are packed, there is no padding other than the
//! explicit fields listed here.
//!
//! ```text
//! BlockRecord (16)       BufferHeader (256)              TileRecord (128)
//!  0 length     u32       0 magic          [u8; 4]        0 block       BlockRecord
//!  4 flags      u32       4 flags          u32 (HEADER)  16 x           i32
//!  8 next       u64       8 next           u64           20 y           i32
//!                        16 tile_width     u32           24 z           i32
//!                        20 tile_height    u32           28 offset      u64
//!                        24 bytes/pixel    u16           36 padding     [u8; 92]
//!                        26 reserved       u16
//!                        28 description    [u8; 64]
//!                        92 x              i32
//!                        96 y              i32
//!                       100 width          u32
//!                       104 height         u32
//!                       108 entry_count    u32
//!                       112 padding        [u8; 144]
//! ```
//!
//! The header's first 16 bytes line up with a [`BlockRecord`], with the magic sitting in the `length` slot.

use std::io::{Read, Result as IOResult, Seek, SeekFrom, Write};

use super::{SwapError, TileKey};

pub const MAGIC: [u8; 4] = *b"TSWP";

bitflags::bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Hash, bytemuck::Pod, bytemuck::Zeroable, Debug)]
    /// Kind of a block in the chain. Unknown bits are preserved.
    #[rustfmt::skip]
    #[repr(transparent)]
    pub struct BlockFlags : u32 {
        /// The file header. Only ever at offset 0.
        const HEADER =       0b0001;
        /// A tile record.
        const TILE =         0b0010;
        /// Combined with `TILE`, the record no longer describes a tile and may be overwritten.
        const TILE_IS_FREE = 0b0100;
        const TILE_FREE =    0b0110;
    }
}

/// A fixed size on-disk struct.
pub trait Record: bytemuck::Pod {
    /// Exact size on disk.
    const SIZE: usize;
    const NAME: &'static str;
    /// Convert between native and little endian. This is its own inverse.
    #[must_use]
    fn swap_le(self) -> Self;
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, PartialEq, Eq)]
#[repr(C, packed)]
pub struct BlockRecord {
    length: u32,
    flags: BlockFlags,
    next: u64,
}
impl BlockRecord {
    #[must_use]
    pub fn new(length: u32, flags: BlockFlags, next: u64) -> Self {
        Self {
            length,
            flags,
            next,
        }
    }
    /// Length of the whole block this envelope starts, in bytes.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }
    #[must_use]
    pub fn flags(&self) -> BlockFlags {
        self.flags
    }
    /// File offset of the following block, 0 if this is the last one.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.next
    }
    pub fn set_next(&mut self, next: u64) {
        self.next = next;
    }
    pub fn set_flags(&mut self, flags: BlockFlags) {
        self.flags = flags;
    }
    #[must_use]
    pub fn is_free_tile(&self) -> bool {
        self.flags().contains(BlockFlags::TILE_FREE)
    }
    #[must_use]
    pub fn is_live_tile(&self) -> bool {
        let flags = self.flags();
        flags.contains(BlockFlags::TILE) && !flags.contains(BlockFlags::TILE_IS_FREE)
    }
}
impl Record for BlockRecord {
    const SIZE: usize = 16;
    const NAME: &'static str = "BlockRecord";
    fn swap_le(self) -> Self {
        Self {
            length: u32::from_le(self.length),
            flags: BlockFlags::from_bits_retain(u32::from_le(self.flags().bits())),
            next: u64::from_le(self.next),
        }
    }
}
impl std::fmt::Debug for BlockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRecord")
            .field("length", &self.length())
            .field("flags", &self.flags())
            .field("next", &self.next())
            .finish()
    }
}

/// The 64 byte description field of a header: a format name, NUL, then optional debug text.
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, PartialEq, Eq)]
#[repr(transparent)]
pub struct Description([u8; 64]);
impl Description {
    pub const LEN: usize = 64;
    /// The format name must fit along with its NUL terminator. Debug text is truncated to whatever space remains.
    /// # Errors
    /// [`SwapError::BadDescription`] if `format` contains NUL or is too long.
    pub fn new(format: &str, debug: Option<&str>) -> Result<Self, SwapError> {
        if format.contains('\0') || format.len() >= Self::LEN {
            return Err(SwapError::BadDescription(format.to_owned()));
        }
        let mut bytes = [0u8; Self::LEN];
        bytes[..format.len()].copy_from_slice(format.as_bytes());
        if let Some(debug) = debug {
            let start = format.len() + 1;
            // Leave the final byte as a terminator.
            let room = Self::LEN.saturating_sub(start + 1);
            let debug = debug.split('\0').next().unwrap_or_default();
            let mut end = room.min(debug.len());
            while !debug.is_char_boundary(end) {
                end -= 1;
            }
            bytes[start..start + end].copy_from_slice(&debug.as_bytes()[..end]);
        }
        Ok(Self(bytes))
    }
    /// Everything up to the first NUL. None if not UTF-8.
    #[must_use]
    pub fn format_name(&self) -> Option<&str> {
        self.segments().next()
    }
    /// Text following the format name, if any.
    #[must_use]
    pub fn debug_text(&self) -> Option<&str> {
        self.segments().nth(1).filter(|text| !text.is_empty())
    }
    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0
            .split(|&byte| byte == 0)
            .map_while(|segment| std::str::from_utf8(segment).ok())
    }
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}
impl std::fmt::Debug for Description {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Description")
            .field("format", &self.format_name())
            .field("debug", &self.debug_text())
            .finish()
    }
}

/// Everything needed to write a fresh header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub tile_width: u32,
    pub tile_height: u32,
    pub bytes_per_pixel: u16,
    pub description: Description,
    /// Advisory bounding box of the stored tiles. Not enforced.
    pub bounds: crate::view::Rect,
}
impl HeaderInfo {
    /// Header info matching the tile geometry and format of a backing store.
    /// # Errors
    /// [`SwapError::BadDescription`] if the format name doesn't fit.
    pub fn for_backing(
        backing: &impl crate::canvas::BackingStore,
        debug: Option<&str>,
    ) -> Result<Self, SwapError> {
        let format = backing.format();
        Ok(Self {
            tile_width: backing.tile_width(),
            tile_height: backing.tile_height(),
            bytes_per_pixel: format.bytes_per_pixel(),
            description: Description::new(format.name(), debug)?,
            bounds: crate::view::Rect {
                x: 0,
                y: 0,
                width: backing.width(),
                height: backing.height(),
            },
        })
    }
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, packed)]
pub struct BufferHeader {
    magic: [u8; 4],
    flags: BlockFlags,
    next: u64,
    tile_width: u32,
    tile_height: u32,
    bytes_per_pixel: u16,
    reserved: u16,
    description: Description,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    entry_count: u32,
    padding: [u8; 144],
}
impl BufferHeader {
    #[must_use]
    pub fn new(info: &HeaderInfo) -> Self {
        Self {
            magic: MAGIC,
            flags: BlockFlags::HEADER,
            next: 0,
            tile_width: info.tile_width,
            tile_height: info.tile_height,
            bytes_per_pixel: info.bytes_per_pixel,
            reserved: 0,
            description: info.description,
            x: info.bounds.x,
            y: info.bounds.y,
            width: info.bounds.width,
            height: info.bounds.height,
            entry_count: 0,
            padding: [0; 144],
        }
    }
    /// Check this is a header we understand.
    /// # Errors
    /// [`SwapError::BadMagic`] or [`SwapError::NotAHeader`]
    pub fn validate(&self) -> Result<(), SwapError> {
        if self.magic != MAGIC {
            return Err(SwapError::BadMagic(self.magic));
        }
        if !self.flags().contains(BlockFlags::HEADER) {
            return Err(SwapError::NotAHeader(self.flags()));
        }
        Ok(())
    }
    #[must_use]
    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }
    #[must_use]
    pub fn flags(&self) -> BlockFlags {
        self.flags
    }
    /// Offset of the first chain block, 0 if the chain is empty.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.next
    }
    #[must_use]
    pub fn tile_size(&self) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }
    #[must_use]
    pub fn bytes_per_pixel(&self) -> u16 {
        self.bytes_per_pixel
    }
    #[must_use]
    pub fn description(&self) -> Description {
        self.description
    }
    #[must_use]
    pub fn bounds(&self) -> crate::view::Rect {
        crate::view::Rect {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
    /// Number of live tile records the chain is expected to hold.
    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }
    pub fn set_next(&mut self, next: u64) {
        self.next = next;
    }
    pub fn set_entry_count(&mut self, entry_count: u32) {
        self.entry_count = entry_count;
    }
}
impl Record for BufferHeader {
    const SIZE: usize = 256;
    const NAME: &'static str = "BufferHeader";
    fn swap_le(self) -> Self {
        Self {
            flags: BlockFlags::from_bits_retain(u32::from_le(self.flags().bits())),
            next: u64::from_le(self.next),
            tile_width: u32::from_le(self.tile_width),
            tile_height: u32::from_le(self.tile_height),
            bytes_per_pixel: u16::from_le(self.bytes_per_pixel),
            reserved: u16::from_le(self.reserved),
            x: i32::from_le(self.x),
            y: i32::from_le(self.y),
            width: u32::from_le(self.width),
            height: u32::from_le(self.height),
            entry_count: u32::from_le(self.entry_count),
            ..self
        }
    }
}
impl std::fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHeader")
            .field("magic", &self.magic())
            .field("flags", &self.flags())
            .field("next", &self.next())
            .field("tile_size", &self.tile_size())
            .field("bytes_per_pixel", &self.bytes_per_pixel())
            .field("description", &self.description())
            .field("bounds", &self.bounds())
            .field("entry_count", &self.entry_count())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, packed)]
pub struct TileRecord {
    block: BlockRecord,
    x: i32,
    y: i32,
    z: i32,
    offset: u64,
    padding: [u8; 92],
}
impl TileRecord {
    /// A live tile record ending the chain.
    #[must_use]
    pub fn new(key: TileKey, payload_offset: u64) -> Self {
        Self {
            block: BlockRecord::new(Self::SIZE as u32, BlockFlags::TILE, 0),
            x: key.x,
            y: key.y,
            z: key.z,
            offset: payload_offset,
            padding: [0; 92],
        }
    }
    /// Replace the envelope, eg. to keep the length and link of a block being reused.
    #[must_use]
    pub fn with_block(self, block: BlockRecord) -> Self {
        Self { block, ..self }
    }
    #[must_use]
    pub fn block(&self) -> BlockRecord {
        self.block
    }
    #[must_use]
    pub fn key(&self) -> TileKey {
        TileKey {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }
    /// File offset of the tile's pixel data.
    #[must_use]
    pub fn payload_offset(&self) -> u64 {
        self.offset
    }
    pub fn set_payload_offset(&mut self, offset: u64) {
        self.offset = offset;
    }
}
impl Record for TileRecord {
    const SIZE: usize = 128;
    const NAME: &'static str = "TileRecord";
    fn swap_le(self) -> Self {
        Self {
            block: self.block().swap_le(),
            x: i32::from_le(self.x),
            y: i32::from_le(self.y),
            z: i32::from_le(self.z),
            offset: u64::from_le(self.offset),
            ..self
        }
    }
}
impl std::fmt::Debug for TileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileRecord")
            .field("block", &self.block())
            .field("key", &self.key())
            .field("offset", &self.payload_offset())
            .finish_non_exhaustive()
    }
}

const _: () = {
    assert!(std::mem::size_of::<BlockRecord>() == BlockRecord::SIZE);
    assert!(std::mem::size_of::<BufferHeader>() == BufferHeader::SIZE);
    assert!(std::mem::size_of::<TileRecord>() == TileRecord::SIZE);
    assert!(std::mem::offset_of!(BufferHeader, description) == 28);
    assert!(std::mem::offset_of!(BufferHeader, entry_count) == 108);
    assert!(std::mem::offset_of!(TileRecord, offset) == 28);
};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{record} is {actual} bytes, should be {expected}")]
pub struct LayoutMismatch {
    pub record: &'static str,
    pub actual: usize,
    pub expected: usize,
}

pub(crate) fn check_size<R: Record>() -> Result<(), LayoutMismatch> {
    let actual = std::mem::size_of::<R>();
    if actual == R::SIZE {
        Ok(())
    } else {
        let mismatch = LayoutMismatch {
            record: R::NAME,
            actual,
            expected: R::SIZE,
        };
        log::error!("{mismatch}, padding is off by {} bytes", actual.abs_diff(R::SIZE));
        Err(mismatch)
    }
}

/// Check the in-memory record layouts match the on-disk sizes. The check only runs once per process.
/// # Errors
/// [`SwapError::StructuralIntegrity`] on any mismatch. Nothing should be read or written after this.
pub fn verify_layout() -> Result<(), SwapError> {
    static VERIFIED: std::sync::OnceLock<Result<(), LayoutMismatch>> = std::sync::OnceLock::new();
    let result = *VERIFIED.get_or_init(|| {
        check_size::<BlockRecord>()?;
        check_size::<BufferHeader>()?;
        check_size::<TileRecord>()
    });
    Ok(result?)
}

/// Read a record at an absolute file offset.
/// # Errors
/// Forwarded from the stream. `UnexpectedEof` if the record is cut short.
pub fn read_record<R: Record, S: Read + Seek>(stream: &mut S, offset: u64) -> IOResult<R> {
    let mut record = R::zeroed();
    stream.seek(SeekFrom::Start(offset))?;
    stream.read_exact(bytemuck::bytes_of_mut(&mut record))?;
    Ok(record.swap_le())
}

/// Write a record at an absolute file offset.
/// # Errors
/// Forwarded from the stream.
pub fn write_record<R: Record, S: Write + Seek>(
    stream: &mut S,
    offset: u64,
    record: &R,
) -> IOResult<()> {
    stream.seek(SeekFrom::Start(offset))?;
    stream.write_all(bytemuck::bytes_of(&record.swap_le()))
}

#[cfg(test)]
mod test {
    use super::{
        check_size, read_record, verify_layout, write_record, BlockFlags, BlockRecord,
        BufferHeader, Description, HeaderInfo, Record, TileRecord,
    };
    use crate::swap::TileKey;

    fn info() -> HeaderInfo {
        HeaderInfo {
            tile_width: 128,
            tile_height: 64,
            bytes_per_pixel: 4,
            description: Description::new("R'G'B'A u8", Some("canvas 3")).unwrap(),
            bounds: crate::view::Rect {
                x: -5,
                y: 7,
                width: 640,
                height: 480,
            },
        }
    }

    #[test]
    fn sizes() {
        assert_eq!(std::mem::size_of::<BlockRecord>(), 16);
        assert_eq!(std::mem::size_of::<BufferHeader>(), 256);
        assert_eq!(std::mem::size_of::<TileRecord>(), 128);
        // Packed, so nothing depends on the platform's alignment rules.
        assert_eq!(std::mem::align_of::<BufferHeader>(), 1);
        assert_eq!(std::mem::align_of::<TileRecord>(), 1);
        verify_layout().unwrap();
    }
    #[test]
    fn mismatch_detected() {
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(transparent)]
        struct Short([u8; 12]);
        impl Record for Short {
            const SIZE: usize = 16;
            const NAME: &'static str = "Short";
            fn swap_le(self) -> Self {
                self
            }
        }
        let err = check_size::<Short>().unwrap_err();
        assert_eq!(err.actual, 12);
        assert_eq!(err.expected, 16);
        assert_eq!(err.record, "Short");
    }
    #[test]
    fn header_bytes() {
        let mut header = BufferHeader::new(&info());
        header.set_next(0x0102_0304_0506_0708);
        header.set_entry_count(3);

        let mut cursor = std::io::Cursor::new(Vec::new());
        write_record(&mut cursor, 0, &header).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 256);

        assert_eq!(&bytes[0..4], b"TSWP");
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[16..20], &128u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &64u32.to_le_bytes());
        assert_eq!(&bytes[24..26], &4u16.to_le_bytes());
        assert_eq!(&bytes[28..38], b"R'G'B'A u8");
        assert_eq!(bytes[38], 0);
        assert_eq!(&bytes[39..47], b"canvas 3");
        assert_eq!(&bytes[92..96], &(-5i32).to_le_bytes());
        assert_eq!(&bytes[96..100], &7i32.to_le_bytes());
        assert_eq!(&bytes[100..104], &640u32.to_le_bytes());
        assert_eq!(&bytes[104..108], &480u32.to_le_bytes());
        assert_eq!(&bytes[108..112], &3u32.to_le_bytes());
        assert!(bytes[112..].iter().all(|&b| b == 0));
    }
    #[test]
    fn tile_bytes() {
        let mut tile = TileRecord::new(TileKey::new(-1, 2, 3), 0xAABB);
        let mut block = tile.block();
        block.set_next(512);
        tile = tile.with_block(block);

        let mut cursor = std::io::Cursor::new(Vec::new());
        write_record(&mut cursor, 0, &tile).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 128);
        assert_eq!(&bytes[0..4], &128u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &512u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[20..24], &2i32.to_le_bytes());
        assert_eq!(&bytes[24..28], &3i32.to_le_bytes());
        assert_eq!(&bytes[28..36], &0xAABBu64.to_le_bytes());
    }
    #[test]
    fn header_read_back() {
        let mut header = BufferHeader::new(&info());
        header.set_entry_count(42);
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_record(&mut cursor, 0, &header).unwrap();

        let read: BufferHeader = read_record(&mut cursor, 0).unwrap();
        read.validate().unwrap();
        assert_eq!(read.entry_count(), 42);
        assert_eq!(read.tile_size(), (128, 64));
        assert_eq!(read.bounds(), info().bounds);
        assert_eq!(read.description().format_name(), Some("R'G'B'A u8"));
        assert_eq!(read.description().debug_text(), Some("canvas 3"));
    }
    #[test]
    fn short_read() {
        let mut cursor = std::io::Cursor::new(vec![0u8; 100]);
        let err = read_record::<TileRecord, _>(&mut cursor, 0).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
    #[test]
    fn description_limits() {
        let exact = "x".repeat(63);
        let desc = Description::new(&exact, Some("dropped")).unwrap();
        assert_eq!(desc.format_name(), Some(exact.as_str()));
        assert_eq!(desc.debug_text(), None);

        assert!(Description::new(&"x".repeat(64), None).is_err());
        assert!(Description::new("a\0b", None).is_err());

        // Debug text is cut to fit, on a char boundary.
        let desc = Description::new(&"y".repeat(59), Some("ééé")).unwrap();
        assert_eq!(desc.debug_text(), Some("é"));
        assert_eq!(desc.as_bytes()[63], 0);
    }
    #[test]
    fn flags() {
        let live = BlockRecord::new(128, BlockFlags::TILE, 0);
        let free = BlockRecord::new(128, BlockFlags::TILE_FREE, 0);
        assert!(live.is_live_tile() && !live.is_free_tile());
        assert!(free.is_free_tile() && !free.is_live_tile());
        // Unknown bits survive a round trip through the disk representation.
        let odd = BlockRecord::new(16, BlockFlags::from_bits_retain(0x8000_0002), 0);
        assert_eq!(odd.swap_le().swap_le().flags().bits(), 0x8000_0002);
    }
}
