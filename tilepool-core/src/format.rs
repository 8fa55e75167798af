//! # Pixel formats
//!
//! The pixel format description facility lives outside of this crate. All the pool needs from it is an
//! identity to key canvases by, plus the two or three facts that end up in a swap header.
//! Formats compare by identity only: two formats constructed from identical descriptions are *different*
//! formats, while clones of one format are the same.

pub struct FormatMarker;
pub type FormatID = crate::UniqueID<FormatMarker>;

struct FormatInfo {
    name: Box<str>,
    bytes_per_pixel: u16,
}

#[derive(Clone)]
pub struct PixelFormat {
    id: FormatID,
    info: std::sync::Arc<FormatInfo>,
}
impl PixelFormat {
    /// Intern a new format identity. Calling this twice with the same arguments yields two unrelated formats -
    /// clone the result instead to share it.
    #[must_use]
    pub fn new(name: &str, bytes_per_pixel: u16) -> Self {
        Self {
            id: FormatID::default(),
            info: std::sync::Arc::new(FormatInfo {
                name: name.into(),
                bytes_per_pixel,
            }),
        }
    }
    #[must_use]
    pub fn id(&self) -> FormatID {
        self.id
    }
    /// The descriptive name, as written into swap headers. Not used for comparison!
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }
    #[must_use]
    pub fn bytes_per_pixel(&self) -> u16 {
        self.info.bytes_per_pixel
    }
}
impl PartialEq for PixelFormat {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for PixelFormat {}
impl std::hash::Hash for PixelFormat {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl std::fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.id, self.name())
    }
}

#[cfg(test)]
mod test {
    use super::PixelFormat;

    #[test]
    fn identity_not_description() {
        let a = PixelFormat::new("RGBA float", 16);
        let b = PixelFormat::new("RGBA float", 16);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.name(), b.name());
    }
}
