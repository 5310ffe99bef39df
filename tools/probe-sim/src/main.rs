//! Probe Sim - headless driver for the radiance probe cache
//!
//! Moves a synthetic viewer along +X, scatters probe requests around it every
//! frame and reports what the cache did with them.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 120 frames, 1000 requests per frame
//! probe-sim
//!
//! # Custom cache settings, JSON lines for plotting
//! probe-sim --config cache.toml --frames 600 --json > stats.jsonl
//!
//! # Per-frame pass details
//! RUST_LOG=radiance_cache_core=debug probe-sim --speed 4
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use glam::Vec3;
use radiance_cache_core::{FrameStats, RadianceCache, RadianceCacheConfig};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::Serialize;

/// Probe Sim - drive the radiance probe cache with a synthetic viewer
#[derive(Parser)]
#[command(name = "probe-sim")]
#[command(about = "Drive the radiance probe cache with a synthetic viewer")]
#[command(version)]
struct Cli {
    /// Cache configuration file (TOML); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of frames to simulate
    #[arg(short, long, default_value_t = 120)]
    frames: u32,

    /// Probe requests per frame
    #[arg(short = 'n', long, default_value_t = 1000)]
    candidates: usize,

    /// Seed for request placement
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Viewer speed along +X in world units per frame
    #[arg(long, default_value_t = 1.0)]
    speed: f32,

    /// Requests are scattered within this distance of the viewer
    #[arg(short, long, default_value_t = 60.0)]
    radius: f32,

    /// Print per-frame statistics as JSON lines instead of log lines
    #[arg(long)]
    json: bool,
}

/// Totals over the whole run
#[derive(Debug, Default, Serialize)]
struct Summary {
    frames: u32,
    traced: usize,
    allocated: usize,
    released: usize,
    allocation_failures: usize,
    peak_active_slots: usize,
}

impl Summary {
    fn record(&mut self, stats: &FrameStats) {
        self.frames += 1;
        self.traced += stats.traced;
        self.allocated += stats.allocated;
        self.released += stats.released;
        self.allocation_failures += stats.allocation_failures;
        self.peak_active_slots = self.peak_active_slots.max(stats.active_slots);
    }
}

/// Fill `out` with `count` points uniformly inside a sphere
fn scatter(rng: &mut impl Rng, center: Vec3, radius: f32, count: usize, out: &mut Vec<Vec3>) {
    out.clear();
    while out.len() < count {
        let point = Vec3::new(
            rng.random_range(-1.0..=1.0),
            rng.random_range(-1.0..=1.0),
            rng.random_range(-1.0..=1.0),
        );
        if point.length_squared() <= 1.0 {
            out.push(center + point * radius);
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RadianceCacheConfig> {
    match path {
        Some(path) => RadianceCacheConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(RadianceCacheConfig::default()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(
        cli.radius.is_finite() && cli.radius > 0.0,
        "--radius must be positive, got {}",
        cli.radius
    );

    let config = load_config(cli.config.as_ref())?;
    let mut cache = RadianceCache::new(config).context("Invalid cache configuration")?;
    let mut rng = Pcg64Mcg::seed_from_u64(cli.seed);
    let mut candidates = Vec::with_capacity(cli.candidates);
    let mut summary = Summary::default();

    for step in 0..cli.frames {
        let viewer = Vec3::X * (cli.speed * step as f32);
        scatter(&mut rng, viewer, cli.radius, cli.candidates, &mut candidates);

        let output = cache.update(viewer, &candidates);
        summary.record(&output.stats);

        if cli.json {
            println!("{}", serde_json::to_string(&output.stats)?);
        } else {
            let stats = &output.stats;
            tracing::info!(
                frame = stats.frame,
                reset = output.state_reset,
                requested = stats.requested,
                reprojected = stats.reprojected,
                allocated = stats.allocated,
                failed = stats.allocation_failures,
                released = stats.released,
                traced = stats.traced,
                threshold = stats.threshold_bucket,
                active = stats.active_slots,
                "frame"
            );
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!("Simulated {} frames", summary.frames);
        println!("  Probes traced:        {}", summary.traced);
        println!("  Slots allocated:      {}", summary.allocated);
        println!("  Slots released:       {}", summary.released);
        println!("  Allocation failures:  {}", summary.allocation_failures);
        println!("  Peak active slots:    {}", summary.peak_active_slots);
    }

    Ok(())
}
