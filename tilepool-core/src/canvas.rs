//! # Canvases
//!
//! A canvas is one large backing store shared by many logical buffers of a single pixel format.
//! Placements are made with shelf packing: left to right along a row, and once a row is full a new
//! row starts below the tallest cell of the previous one. Space is never handed back - released buffers
//! leave holes until the whole canvas is torn down.

use crate::format::PixelFormat;

/// Fixed geometry of some pixel container. The allocator only reads from this, it never touches pixels.
pub trait BackingStore {
    fn format(&self) -> &PixelFormat;
    fn tile_width(&self) -> u32;
    fn tile_height(&self) -> u32;
    /// Nominal width in pixels. Implementations may in practice accept placements past this.
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// The default backing store, describing geometry only.
#[derive(Clone, Debug)]
pub struct Storage {
    format: PixelFormat,
    tile_width: u32,
    tile_height: u32,
    width: u32,
    height: u32,
}
impl Storage {
    /// Storage with the extent and tile geometry from `config`.
    #[must_use]
    pub fn new(format: PixelFormat, config: &crate::PoolConfig) -> Self {
        Self {
            format,
            tile_width: config.tile_width.max(1),
            tile_height: config.tile_height.max(1),
            width: config.canvas_width,
            height: config.canvas_height,
        }
    }
    /// Tile dimensions of zero are raised to one.
    #[must_use]
    pub fn with_geometry(
        format: PixelFormat,
        [tile_width, tile_height]: [u32; 2],
        [width, height]: [u32; 2],
    ) -> Self {
        Self {
            format,
            tile_width: tile_width.max(1),
            tile_height: tile_height.max(1),
            width,
            height,
        }
    }
}
impl BackingStore for Storage {
    fn format(&self) -> &PixelFormat {
        &self.format
    }
    fn tile_width(&self) -> u32 {
        self.tile_width
    }
    fn tile_height(&self) -> u32 {
        self.tile_height
    }
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
}

/// The packing cursor of a canvas.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PackingState {
    /// Past-the-end x of the current row.
    pub x_used: u32,
    /// Top of the current row.
    pub y_used: u32,
    /// Height of the tallest cell in the current row.
    pub max_height: u32,
}

/// Where a request landed on its canvas.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Placement {
    pub shift_x: u32,
    pub shift_y: u32,
    /// Inflated cell size reserved for this placement.
    pub needed_width: u32,
    pub needed_height: u32,
    /// The cell was wider than the nominal canvas width. The placement is still made, at the start of a row.
    pub oversize: bool,
}
impl Placement {
    /// Whether the reserved cells of two placements share any pixel.
    #[must_use]
    pub fn overlaps(&self, other: &Placement) -> bool {
        let (ax, ay) = (u64::from(self.shift_x), u64::from(self.shift_y));
        let (bx, by) = (u64::from(other.shift_x), u64::from(other.shift_y));
        ax < bx + u64::from(other.needed_width)
            && bx < ax + u64::from(self.needed_width)
            && ay < by + u64::from(other.needed_height)
            && by < ay + u64::from(self.needed_height)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error(
        "requested allocation ({width}x{height}) does not fit canvas ({canvas_width}x{canvas_height})"
    )]
    OutOfSpace {
        width: u32,
        height: u32,
        canvas_width: u32,
        canvas_height: u32,
    },
    #[error("requested allocation ({width}x{height}) overflows the coordinate space")]
    TooLarge { width: u32, height: u32 },
}

/// Counts of what a canvas has handed out so far.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CanvasUsage {
    pub placements: usize,
    /// Sum of inflated cell areas, in pixels.
    pub used_area: u64,
    /// Nominal canvas area, in pixels.
    pub capacity: u64,
}

/// Shelf-packing state for one backing store.
///
/// Not synchronized on its own, see [`Canvas`] for the shared version.
#[derive(Clone, Debug)]
pub struct CanvasAllocator {
    tile_width: u32,
    tile_height: u32,
    width: u32,
    height: u32,
    margin_tiles: u32,
    state: PackingState,
    placements: usize,
    used_area: u64,
}
impl CanvasAllocator {
    /// An empty allocator over `backing`, using [`crate::config::DEFAULT_MARGIN_TILES`].
    #[must_use]
    pub fn new(backing: &impl BackingStore) -> Self {
        Self::with_margin(backing, crate::config::DEFAULT_MARGIN_TILES)
    }
    #[must_use]
    pub fn with_margin(backing: &impl BackingStore, margin_tiles: u32) -> Self {
        Self {
            tile_width: backing.tile_width().max(1),
            tile_height: backing.tile_height().max(1),
            width: backing.width(),
            height: backing.height(),
            margin_tiles,
            state: PackingState::default(),
            placements: 0,
            used_area: 0,
        }
    }
    #[must_use]
    pub fn state(&self) -> PackingState {
        self.state
    }
    #[must_use]
    pub fn margin_tiles(&self) -> u32 {
        self.margin_tiles
    }
    #[must_use]
    pub fn usage(&self) -> CanvasUsage {
        CanvasUsage {
            placements: self.placements,
            used_area: self.used_area,
            capacity: u64::from(self.width) * u64::from(self.height),
        }
    }
    /// The cell size reserved for a `width` x `height` request: each side rounded up to the tile grid,
    /// plus the margin. None if that doesn't fit in a u32.
    #[must_use]
    pub fn needed_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let inflate = |len: u32, tile: u32| -> Option<u32> {
            let tiles = len.div_ceil(tile).checked_add(self.margin_tiles)?;
            tiles.checked_mul(tile)
        };
        Some((
            inflate(width, self.tile_width)?,
            inflate(height, self.tile_height)?,
        ))
    }
    /// Reserve a cell for a `width` x `height` buffer.
    ///
    /// On failure, the packing state is left exactly as it was.
    /// # Errors
    /// [`AllocError::OutOfSpace`] if the cell doesn't fit even after starting a new row.
    pub fn allocate(&mut self, width: u32, height: u32) -> Result<Placement, AllocError> {
        let (needed_width, needed_height) = self
            .needed_size(width, height)
            .ok_or(AllocError::TooLarge { width, height })?;
        let out_of_space = || {
            log::warn!(
                "requested allocation ({width}x{height}) does not fit canvas ({}x{})",
                self.width,
                self.height
            );
            AllocError::OutOfSpace {
                width,
                height,
                canvas_width: self.width,
                canvas_height: self.height,
            }
        };

        let oversize = needed_width > self.width;
        if oversize {
            log::warn!(
                "requested a {needed_width} wide allocation, but canvas is only {} wide",
                self.width
            );
        }
        // u64 so that none of the sums below can overflow.
        let (width_limit, height_limit) = (u64::from(self.width), u64::from(self.height));
        let (cell_w, cell_h) = (u64::from(needed_width), u64::from(needed_height));

        let mut next = self.state;
        if u64::from(next.y_used) + cell_h > height_limit {
            return Err(out_of_space());
        }
        if u64::from(next.x_used) + cell_w > width_limit {
            // Wrap to a fresh row under the tallest cell of this one.
            if u64::from(next.y_used) + u64::from(next.max_height) + cell_h > height_limit {
                return Err(out_of_space());
            }
            next.y_used += next.max_height;
            next.x_used = 0;
            next.max_height = 0;
        }

        let placement = Placement {
            shift_x: next.x_used,
            shift_y: next.y_used,
            needed_width,
            needed_height,
            oversize,
        };
        // Clamp keeps x_used within the nominal width. An oversize cell fills its row regardless.
        next.x_used = (u64::from(next.x_used) + cell_w).min(width_limit) as u32;
        next.max_height = next.max_height.max(needed_height);

        self.state = next;
        self.placements += 1;
        self.used_area = self.used_area.saturating_add(cell_w * cell_h);
        Ok(placement)
    }
}

pub struct CanvasMarker;
pub type CanvasID = crate::UniqueID<CanvasMarker>;

/// A backing store together with its packing state, shareable between threads.
/// Allocation on one canvas is serialized, distinct canvases never contend.
pub struct Canvas {
    id: CanvasID,
    storage: Storage,
    allocator: parking_lot::Mutex<CanvasAllocator>,
}
impl Canvas {
    #[must_use]
    pub fn new(storage: Storage, margin_tiles: u32) -> Self {
        let allocator = CanvasAllocator::with_margin(&storage, margin_tiles);
        Self {
            id: CanvasID::default(),
            storage,
            allocator: allocator.into(),
        }
    }
    #[must_use]
    pub fn id(&self) -> CanvasID {
        self.id
    }
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
    #[must_use]
    pub fn format(&self) -> &PixelFormat {
        self.storage.format()
    }
    /// See [`CanvasAllocator::allocate`].
    /// # Errors
    /// [`AllocError::OutOfSpace`] if the canvas is full.
    pub fn allocate(&self, width: u32, height: u32) -> Result<Placement, AllocError> {
        self.allocator.lock().allocate(width, height)
    }
    /// Place a logical buffer, returning a view referring back to this canvas.
    /// # Errors
    /// [`AllocError::OutOfSpace`] if the canvas is full.
    pub fn allocate_view(
        self: &std::sync::Arc<Self>,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<crate::BufferView, AllocError> {
        let placement = self.allocate(width, height)?;
        Ok(crate::BufferView::new(
            self,
            crate::view::Rect {
                x,
                y,
                width,
                height,
            },
            placement,
        ))
    }
    /// A copy of the current packing cursor. May be stale as soon as it's returned if other
    /// threads are allocating.
    #[must_use]
    pub fn snapshot(&self) -> PackingState {
        self.allocator.lock().state()
    }
    #[must_use]
    pub fn usage(&self) -> CanvasUsage {
        self.allocator.lock().usage()
    }
}
impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("id", &self.id)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}
