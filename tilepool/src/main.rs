#![warn(clippy::pedantic)]

mod config;

use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult};
use clap::{Parser, Subcommand};
use tilepool_core::swap::{SwapIndex, TileKey, TraversalLimits};
use tilepool_core::{FormatRegistry, PixelFormat, PoolConfig};

/// Inspect tile swap files and try out canvas packing.
#[derive(Parser, Debug)]
#[command(name = "tilepool", version)]
struct Cli {
    /// Config file to use in place of the one in the preferences directory.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the tile index of a swap file and print what it holds. The file is never written.
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Pack buffers of one size onto a fresh canvas, printing where each lands.
    Pack {
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
        /// How many buffers to place. Stops early if the canvas fills.
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long, default_value_t = 4)]
        bytes_per_pixel: u16,
    },
    /// Print the config in effect, optionally saving it to the preferences directory.
    Config {
        #[arg(long)]
        save: bool,
    },
}

fn inspect(path: &Path, config: &PoolConfig) -> AnyResult<()> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata()?.len();
    let stdout = std::io::stdout();
    inspect_report(
        &mut stdout.lock(),
        &path.display().to_string(),
        size,
        std::io::BufReader::new(file),
        config.traversal_limits(),
    )
    .with_context(|| format!("reading swap index of {}", path.display()))
}

/// Describe the swap file in `stream`: header, tiles sorted by key, then any damage found.
fn inspect_report<S: Read + Seek>(
    out: &mut impl Write,
    name: &str,
    size: u64,
    stream: S,
    limits: TraversalLimits,
) -> AnyResult<()> {
    let (index, traversal) = SwapIndex::open(stream, limits)?;

    let header = index.header();
    let description = header.description();
    let (tile_width, tile_height) = header.tile_size();
    let bounds = header.bounds();
    writeln!(out, "{name} ({})", human_bytes::human_bytes(size as f64))?;
    writeln!(
        out,
        "  format:  {}",
        description.format_name().unwrap_or("<not utf-8>")
    )?;
    if let Some(debug) = description.debug_text() {
        writeln!(out, "  debug:   {debug}")?;
    }
    writeln!(
        out,
        "  tiles:   {tile_width}x{tile_height} @ {} bytes per pixel",
        header.bytes_per_pixel()
    )?;
    writeln!(
        out,
        "  bounds:  {}x{} at ({}, {})",
        bounds.width, bounds.height, bounds.x, bounds.y
    )?;
    writeln!(
        out,
        "  entries: {} recorded, {} found in {} blocks, {} free",
        header.entry_count(),
        index.len(),
        traversal.blocks.len(),
        traversal.free.len()
    )?;

    let mut tiles: Vec<(TileKey, u64)> = index.tiles().collect();
    tiles.sort_unstable();
    for (key, offset) in tiles {
        writeln!(out, "  {} {} {} -> {offset}", key.x, key.y, key.z)?;
    }

    if let Some(fault) = traversal.fault {
        writeln!(out, "chain is damaged: {fault}")?;
    }
    if let Some(mismatch) = traversal.count_mismatch {
        writeln!(
            out,
            "header records {} tiles, but the chain holds {}",
            mismatch.expected, mismatch.found
        )?;
    }
    Ok(())
}

/// Place up to `count` buffers on a fresh canvas, one line each, stopping at the first failure.
/// Returns how many were placed.
fn pack_report(
    out: &mut impl Write,
    config: PoolConfig,
    [width, height]: [u32; 2],
    count: u32,
    bytes_per_pixel: u16,
) -> std::io::Result<usize> {
    let registry = FormatRegistry::with_config(config);
    let format = PixelFormat::new("dry run", bytes_per_pixel);

    for i in 0..count {
        match registry.new_buffer(&format, 0, 0, width, height) {
            Ok(view) => {
                let placement = view.placement();
                writeln!(
                    out,
                    "{i:>6}: ({}, {}) reserving {}x{}{}",
                    placement.shift_x,
                    placement.shift_y,
                    placement.needed_width,
                    placement.needed_height,
                    if placement.oversize { " oversize" } else { "" }
                )?;
            }
            Err(e) => {
                writeln!(out, "{i:>6}: {e}")?;
                break;
            }
        }
    }

    let mut placed = 0;
    if let Some(canvas) = registry.get(&format) {
        let usage = canvas.usage();
        placed = usage.placements;
        let bytes = |pixels: u64| pixels as f64 * f64::from(bytes_per_pixel);
        writeln!(
            out,
            "{} placements using {} of {}",
            usage.placements,
            human_bytes::human_bytes(bytes(usage.used_area)),
            human_bytes::human_bytes(bytes(usage.capacity)),
        )?;
    }
    registry.teardown();
    Ok(placed)
}

fn main() -> AnyResult<()> {
    let has_term = std::io::IsTerminal::is_terminal(&std::io::stdin());
    // Log to a terminal, if available. Else, log to "log.out" in the working directory.
    if has_term {
        env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .init();
    } else {
        let _ = simple_logging::log_to_file("log.out", log::LevelFilter::Debug);
    }

    let cli = Cli::parse();
    let config = config::load_or_default(cli.config.as_deref());

    match cli.command {
        Command::Inspect { file } => inspect(&file, &config)?,
        Command::Pack {
            width,
            height,
            count,
            bytes_per_pixel,
        } => {
            let stdout = std::io::stdout();
            pack_report(
                &mut stdout.lock(),
                config,
                [width, height],
                count,
                bytes_per_pixel,
            )?;
        }
        Command::Config { save } => {
            print!("{}", toml::ser::to_string_pretty(&config)?);
            if save {
                let path = config::save(&config)?;
                log::info!("saved config to {}", path.display());
            }
        }
    }
    Ok(())
}
