use tilepool_core::PoolConfig;

const DOCUMENTATION: &str = r#"# Tilepool configuration. Any key may be left out to use its default.
#
# canvas_width, canvas_height - nominal extent of each new canvas, in pixels.
# tile_width, tile_height     - tile grid that placements are rounded up to.
# margin_tiles                - extra tiles reserved past every placement, in both directions.
# slack_hops                  - how far past the recorded entry count a swap chain may run before it is
#                               considered corrupt.

"#;

#[must_use]
pub fn preferences_dir() -> Option<std::path::PathBuf> {
    let mut base_dir = dirs::preference_dir()?;
    base_dir.push(env!("CARGO_PKG_NAME"));
    Some(base_dir)
}

const FILENAME: &str = "tilepool.toml";

/// Load the config at `path`, or from the preferences directory if None.
/// Anything going wrong results in defaults and a warning.
#[must_use]
pub fn load_or_default(path: Option<&std::path::Path>) -> PoolConfig {
    let path = match path {
        Some(path) => path.to_owned(),
        None => {
            let Some(mut dir) = preferences_dir() else {
                log::warn!("No preferences dir found, using default config.");
                return PoolConfig::default();
            };
            dir.push(FILENAME);
            dir
        }
    };
    let config: anyhow::Result<PoolConfig> = (|| {
        let string = std::fs::read_to_string(&path)?;
        Ok(PoolConfig::from_toml_str(&string)?)
    })();

    match config {
        Ok(config) => {
            log::debug!("loaded config from {}", path.display());
            config
        }
        Err(e) => {
            log::warn!(
                "Config at {} wasn't available, defaulting: {e}",
                path.display()
            );
            PoolConfig::default()
        }
    }
}

/// Write `config` to the preferences directory, documented.
pub fn save(config: &PoolConfig) -> anyhow::Result<std::path::PathBuf> {
    let mut preferences =
        preferences_dir().ok_or_else(|| anyhow::anyhow!("No preferences dir found"))?;
    // Explicitly do *not* create recursively. If the parent is missing, leave it be.
    let _ = std::fs::DirBuilder::new().create(&preferences);

    preferences.push(FILENAME);
    let string = DOCUMENTATION.to_owned() + &toml::ser::to_string_pretty(config)?;
    std::fs::write(&preferences, string)?;
    Ok(preferences)
}
