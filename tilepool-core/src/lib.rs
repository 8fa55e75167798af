#![warn(clippy::pedantic)]

pub mod canvas;
pub mod config;
pub mod format;
pub mod id;
pub mod registry;
pub mod swap;
pub mod view;

pub use canvas::{AllocError, BackingStore, Canvas, CanvasAllocator, Placement, Storage};
pub use config::PoolConfig;
pub use format::PixelFormat;
pub use id::UniqueID;
pub use registry::FormatRegistry;
pub use view::{BufferView, Rect};
