use anyhow::Result;
use clap::Parser;
use notestream::Config;
use tracing::info;

#[derive(Parser)]
#[command(name = "notestream", about = "Live note-taking orchestration core")]
struct Args {
    /// Path to the configuration file (without extension)
    #[arg(long, default_value = "config/notestream")]
    config: String,

    /// Default title for sessions started by the embedding host
    #[arg(long)]
    title: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("{} starting", cfg.service.name);
    info!("transcript stream: {}", cfg.stream.url);
    info!("segment ingest: {}", cfg.ingest.url);
    info!(
        "audio: {} Hz, {} channel(s), {}s segments",
        cfg.audio.sample_rate, cfg.audio.channels, cfg.audio.segment_seconds
    );
    info!("segment cache: {}", cfg.storage.cache_dir);
    if let Some(title) = &args.title {
        info!("default session title: {}", title);
    }

    // The orchestration core is embedded by a host application that supplies
    // the platform collaborators (capture engines, session service client,
    // permission prompts). Standalone, there is nothing further to drive.
    info!("ready; waiting for a host application to embed the flow");

    Ok(())
}
