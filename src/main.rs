use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod clip;
mod control;
mod image;
mod memory;
mod models;
mod protocol;
mod signal;
mod sound;
mod state;
mod tensor;
mod work;

use crate::clip::ClipCache;
use crate::memory::Memory;
use crate::models::{ImageModels, SoundModels};
use crate::protocol::Console;
use crate::signal::Signals;

/// Streaming generative media pipeline: control lines in on stdin,
/// completion lines out on stdout, payloads through a shared-memory ring.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    pipeline: Pipeline,
    /// Shared-memory ring name override (defaults to the pipeline's own).
    #[arg(long)]
    memory: Option<String>,
    /// Default prompt-embedding cache directory for requests that name none.
    #[arg(long)]
    cache: Option<String>,
}

#[derive(Subcommand)]
enum Pipeline {
    /// Run the five-stage image pipeline.
    Image,
    /// Run the three-stage sound pipeline.
    Sound,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    // stdout belongs to the protocol; diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let console = Arc::new(Console::stdio());
    let signals = Arc::new(Signals::new());
    let clips = Arc::new(match &cli.cache {
        Some(root) => ClipCache::rooted(root),
        None => ClipCache::new(),
    });

    // a bad ring is fatal; nothing is spawned past this point on error
    match cli.pipeline {
        Pipeline::Image => {
            let memory = Arc::new(Memory::open(cli.memory.as_deref().unwrap_or("image"))?);
            info!("image pipeline starting");
            image::run(
                console,
                image::ImageContext::new(ImageModels::builtin(), clips, memory, signals),
            )
        }
        Pipeline::Sound => {
            let memory = Arc::new(Memory::open(cli.memory.as_deref().unwrap_or("sound"))?);
            info!("sound pipeline starting");
            sound::run(
                console,
                sound::SoundContext::new(SoundModels::builtin(), memory, signals),
            )
        }
    }
}
