//! # Format registry
//!
//! Associates each pixel format with the one canvas its buffers get packed into. Canvases are made on
//! first use and live until [`FormatRegistry::teardown`].
//!
//! Construct one at startup and pass it around by reference, there is no global instance.

use crate::canvas::{AllocError, Canvas, Storage};
use crate::format::{FormatID, PixelFormat};
use crate::{BufferView, PoolConfig};

pub struct FormatRegistry {
    config: PoolConfig,
    canvases: parking_lot::RwLock<hashbrown::HashMap<FormatID, std::sync::Arc<Canvas>>>,
}
impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_config(PoolConfig::default())
    }
}
impl FormatRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// New canvases will take their extent, tile geometry, and margin from `config`.
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            config,
            canvases: parking_lot::RwLock::default(),
        }
    }
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
    /// Fetch the canvas for `format`, creating it if this is the first time the format is seen.
    ///
    /// Concurrent first use of one format yields one canvas.
    pub fn get_or_create(&self, format: &PixelFormat) -> std::sync::Arc<Canvas> {
        if let Some(canvas) = self.get(format) {
            return canvas;
        }
        // Missed - take exclusive access. Someone may have beaten us here, so `entry` re-checks.
        let mut write = self.canvases.write();
        write
            .entry(format.id())
            .or_insert_with(|| {
                let storage = Storage::new(format.clone(), &self.config);
                let canvas = Canvas::new(storage, self.config.margin_tiles);
                log::debug!("new canvas {} for {format:?}", canvas.id());
                std::sync::Arc::new(canvas)
            })
            .clone()
    }
    /// Fetch the canvas for `format` if one exists.
    #[must_use]
    pub fn get(&self, format: &PixelFormat) -> Option<std::sync::Arc<Canvas>> {
        self.canvases.read().get(&format.id()).cloned()
    }
    /// Place a logical `width` x `height` buffer at (`x`, `y`) on the canvas for `format`.
    /// # Errors
    /// [`AllocError::OutOfSpace`] if the format's canvas is full. Retrying is up to the caller.
    pub fn new_buffer(
        &self,
        format: &PixelFormat,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<BufferView, AllocError> {
        self.get_or_create(format)
            .allocate_view(x, y, width, height)
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.canvases.read().len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.canvases.read().is_empty()
    }
    /// Release every canvas. All views handed out so far become invalid.
    /// Safe to call any number of times, returns how many canvases were released by this call.
    pub fn teardown(&self) -> usize {
        let released = std::mem::take(&mut *self.canvases.write());
        if !released.is_empty() {
            log::debug!("released {} canvases", released.len());
        }
        released.len()
    }
}

#[cfg(test)]
mod test {
    use super::FormatRegistry;
    use crate::{AllocError, PixelFormat, PoolConfig};

    fn small() -> FormatRegistry {
        FormatRegistry::with_config(PoolConfig {
            canvas_width: 256,
            canvas_height: 256,
            tile_width: 16,
            tile_height: 16,
            ..PoolConfig::default()
        })
    }

    #[test]
    fn same_format_same_canvas() {
        let registry = small();
        let format = PixelFormat::new("RGBA float", 16);
        let a = registry.get_or_create(&format);
        let b = registry.get_or_create(&format.clone());
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }
    #[test]
    fn distinct_formats_independent() {
        let registry = small();
        let rgba = PixelFormat::new("RGBA float", 16);
        // Same description, different identity.
        let other = PixelFormat::new("RGBA float", 16);

        let a = registry.new_buffer(&rgba, 0, 0, 64, 64).unwrap();
        let b = registry.new_buffer(&other, 0, 0, 64, 64).unwrap();
        assert_ne!(a.canvas_id(), b.canvas_id());
        // Both land at the origin of their own canvas.
        assert_eq!(a.shift(), (0, 0));
        assert_eq!(b.shift(), (0, 0));
        assert_eq!(registry.len(), 2);

        let a2 = registry.new_buffer(&rgba, 0, 0, 64, 64).unwrap();
        assert_eq!(a2.shift(), (128, 0));
        assert_eq!(registry.get(&other).unwrap().snapshot().x_used, 128);
    }
    #[test]
    fn full_canvas_reports() {
        let registry = small();
        let format = PixelFormat::new("Y u8", 1);
        assert!(matches!(
            registry.new_buffer(&format, 0, 0, 512, 512),
            Err(AllocError::OutOfSpace { .. })
        ));
        // The canvas was still made.
        assert_eq!(registry.len(), 1);
    }
    #[test]
    fn teardown_idempotent() {
        let registry = small();
        let format = PixelFormat::new("Y u8", 1);
        let view = registry.new_buffer(&format, 0, 0, 1, 1).unwrap();
        registry.get_or_create(&PixelFormat::new("YA u8", 2));

        assert_eq!(registry.teardown(), 2);
        assert!(registry.is_empty());
        assert!(view.canvas().is_none());
        assert_eq!(registry.teardown(), 0);
        assert_eq!(registry.teardown(), 0);

        // Usable again afterwards, with fresh packing state.
        let again = registry.new_buffer(&format, 0, 0, 1, 1).unwrap();
        assert_eq!(again.shift(), (0, 0));
        assert_ne!(again.canvas_id(), view.canvas_id());
    }
    #[test]
    fn racing_first_use() {
        let registry = FormatRegistry::new();
        let format = PixelFormat::new("RGB u16", 6);
        let barrier = std::sync::Barrier::new(8);

        let ids: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.get_or_create(&format).id()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(registry.len(), 1);
    }
    #[test]
    fn racing_allocations_disjoint() {
        let registry = FormatRegistry::new();
        let format = PixelFormat::new("RGBA u8", 4);

        let placements: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..64)
                            .map(|i| registry.new_buffer(&format, 0, 0, 100 + i, 50).unwrap())
                            .map(|view| view.placement())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(placements.len(), 256);
        for (i, a) in placements.iter().enumerate() {
            for b in &placements[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
        assert_eq!(registry.get(&format).unwrap().usage().placements, 256);
    }
}
