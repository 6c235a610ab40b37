//! heapmap CLI
//!
//! Builds, inspects and verifies map images on disk.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use heapmap::map::ImageSummary;
use heapmap::{Config, HeapMap, Int32Keys, StringCodec};
use tracing_subscriber::{fmt, EnvFilter};

/// heapmap CLI
#[derive(Parser, Debug)]
#[command(name = "heapmap-cli")]
#[command(about = "Build and inspect offset-addressed heap map images")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an integer-key map of "<key>" strings and save its image
    Fill {
        /// Output image path
        path: PathBuf,

        /// Number of entries
        #[arg(short, long, default_value = "10000")]
        count: i32,

        /// Number of segments
        #[arg(short, long, default_value = "1")]
        segments: usize,

        /// Buckets per segment
        #[arg(short, long, default_value = "4999")]
        table_size: usize,

        /// Store a timestamp in every node
        #[arg(long)]
        timestamps: bool,
    },

    /// Print header and heap statistics of an image
    Inspect {
        /// Image path
        path: PathBuf,
    },

    /// Load an integer-key image and check every tree
    Verify {
        /// Image path
        path: PathBuf,

        /// Also check that every key k maps to "<k>"
        #[arg(long)]
        values: bool,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,heapmap=debug"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Fill {
            path,
            count,
            segments,
            table_size,
            timestamps,
        } => fill(&path, count, segments, table_size, timestamps),
        Commands::Inspect { path } => inspect(&path),
        Commands::Verify { path, values } => verify(&path, values),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn fill(
    path: &PathBuf,
    count: i32,
    segments: usize,
    table_size: usize,
    timestamps: bool,
) -> heapmap::Result<()> {
    let config = Config::builder()
        .segments(segments)
        .table_size(table_size)
        .timestamps(timestamps)
        .build()?;

    let mut map = HeapMap::int32(StringCodec, &config)?;
    for key in 0..count {
        map.put(&key, &key.to_string())?;
    }
    map.save_on(path)?;

    tracing::info!("Wrote {} entries to {}", map.len(), path.display());
    Ok(())
}

fn inspect(path: &PathBuf) -> heapmap::Result<()> {
    let image = std::fs::read(path)?;
    let summary = ImageSummary::read(&image)?;

    println!("image:      {} ({} bytes)", path.display(), image.len());
    println!("segments:   {}", summary.segments.len());
    println!("table size: {}", summary.table_size);
    println!(
        "options:    {:#x} (timestamps: {}, order: {:?})",
        summary.options.bits(),
        summary.options.timestamps(),
        summary.options.key_order()
    );
    println!("entries:    {}", summary.entries());

    for (i, segment) in summary.segments.iter().enumerate() {
        println!(
            "  [{}] entries={} image={}B reserved={}B occupied={}B top={}B victim={}B",
            i,
            segment.entries,
            segment.image_len,
            segment.heap.reserved,
            segment.heap.occupied,
            segment.heap.top_size,
            segment.heap.designated_victim_size
        );
    }
    Ok(())
}

fn verify(path: &PathBuf, check_values: bool) -> heapmap::Result<()> {
    let mut map = HeapMap::load_from(path, Int32Keys, StringCodec)?;
    let count = map.verify()?;
    tracing::info!("{} entries, all trees valid", count);

    if check_values {
        let keys = map.keys().collect::<heapmap::Result<Vec<i32>>>()?;
        for key in keys {
            let expected = key.to_string();
            match map.get(&key)? {
                Some(value) if value == expected => {}
                other => {
                    return Err(heapmap::HeapError::Corrupted(format!(
                        "key {} holds {:?}, expected {:?}",
                        key, other, expected
                    )))
                }
            }
        }
        tracing::info!("All values match");
    }
    Ok(())
}
