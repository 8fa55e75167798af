//! # Buffer views
//!
//! The handle given out for every successful placement. It remembers the logical region the caller asked
//! for and where that region physically lives on its canvas.
//!
//! Views hold the canvas weakly. Tearing down the registry invalidates every outstanding view - it is on
//! the holder not to use a view past that point. [`BufferView::canvas`] returning `None` is a symptom of
//! this, but it is not guaranteed to catch it (the canvas may be kept alive elsewhere).

use crate::canvas::{Canvas, CanvasID, Placement};

/// A rectangle in a buffer's logical coordinate space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}
impl Rect {
    #[must_use]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (x, y) = (i64::from(x), i64::from(y));
        let (left, top) = (i64::from(self.x), i64::from(self.y));
        x >= left
            && y >= top
            && x < left + i64::from(self.width)
            && y < top + i64::from(self.height)
    }
}

#[derive(Clone)]
pub struct BufferView {
    canvas: std::sync::Weak<Canvas>,
    canvas_id: CanvasID,
    logical: Rect,
    placement: Placement,
}
impl BufferView {
    pub(crate) fn new(canvas: &std::sync::Arc<Canvas>, logical: Rect, placement: Placement) -> Self {
        Self {
            canvas: std::sync::Arc::downgrade(canvas),
            canvas_id: canvas.id(),
            logical,
            placement,
        }
    }
    /// The canvas this view was placed on, if it is still alive.
    #[must_use]
    pub fn canvas(&self) -> Option<std::sync::Arc<Canvas>> {
        self.canvas.upgrade()
    }
    #[must_use]
    pub fn canvas_id(&self) -> CanvasID {
        self.canvas_id
    }
    #[must_use]
    pub fn logical_rect(&self) -> Rect {
        self.logical
    }
    #[must_use]
    pub fn placement(&self) -> Placement {
        self.placement
    }
    /// Offset of the logical origin on the canvas.
    #[must_use]
    pub fn shift(&self) -> (u32, u32) {
        (self.placement.shift_x, self.placement.shift_y)
    }
    /// Translate a logical coordinate to canvas coordinates.
    /// None if the point lies outside of the logical region.
    #[must_use]
    pub fn to_canvas(&self, x: i32, y: i32) -> Option<(u32, u32)> {
        if !self.logical.contains(x, y) {
            return None;
        }
        // Within the rect, so these differences are in 0..width and 0..height.
        let dx = (i64::from(x) - i64::from(self.logical.x)) as u32;
        let dy = (i64::from(y) - i64::from(self.logical.y)) as u32;
        Some((
            self.placement.shift_x.checked_add(dx)?,
            self.placement.shift_y.checked_add(dy)?,
        ))
    }
}
impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("canvas", &self.canvas_id)
            .field("logical", &self.logical)
            .field("placement", &self.placement)
            .finish()
    }
}
