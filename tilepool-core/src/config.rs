//! Tunables for canvases and swap traversal, loadable from TOML.

/// Inflation applied to every allocation, in whole tiles, on top of rounding up to the tile grid.
///
/// Neighboring buffers on one canvas were observed to interfere when packed edge to edge.
/// The minimal safe value is unknown.
pub const DEFAULT_MARGIN_TILES: u32 = 4;
/// Extra chain hops allowed past a header's `entry_count` before a walk is called off.
/// Only live tile and unrecognized blocks count towards this. Free blocks are bounded by the file size instead.
pub const DEFAULT_SLACK_HOPS: u32 = 1024;

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Nominal width of newly created canvases, in pixels.
    pub canvas_width: u32,
    /// Height of newly created canvases, in pixels.
    pub canvas_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// See [`DEFAULT_MARGIN_TILES`]
    pub margin_tiles: u32,
    /// See [`DEFAULT_SLACK_HOPS`]
    pub slack_hops: u32,
}
impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            canvas_width: 65536,
            canvas_height: 65536,
            tile_width: 128,
            tile_height: 64,
            margin_tiles: DEFAULT_MARGIN_TILES,
            slack_hops: DEFAULT_SLACK_HOPS,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
}

impl PoolConfig {
    /// Parse from TOML. Missing keys take their defaults.
    /// # Errors
    /// Malformed TOML, unknown keys, or values failing [`PoolConfig::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
    /// # Errors
    /// Zero-sized tiles or canvases.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(ConfigError::Invalid("tile dimensions must be non-zero"));
        }
        if self.canvas_width == 0 || self.canvas_height == 0 {
            return Err(ConfigError::Invalid("canvas dimensions must be non-zero"));
        }
        Ok(())
    }
    #[must_use]
    pub fn traversal_limits(&self) -> crate::swap::TraversalLimits {
        crate::swap::TraversalLimits {
            slack_hops: self.slack_hops,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ConfigError, PoolConfig};

    #[test]
    fn partial_toml() {
        let config = PoolConfig::from_toml_str("tile_width = 16\ntile_height = 16\n").unwrap();
        assert_eq!(config.tile_width, 16);
        assert_eq!(config.tile_height, 16);
        assert_eq!(config.canvas_width, PoolConfig::default().canvas_width);
        assert_eq!(config.margin_tiles, 4);
    }
    #[test]
    fn empty_is_default() {
        assert_eq!(PoolConfig::from_toml_str("").unwrap(), PoolConfig::default());
    }
    #[test]
    fn rejects_zero_tiles() {
        assert!(matches!(
            PoolConfig::from_toml_str("tile_width = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }
    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            PoolConfig::from_toml_str("tile_depth = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
