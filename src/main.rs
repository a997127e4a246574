//! OpenNow pipeline probe
//!
//! Reports the GPU, the decoder backends usable on this machine and the
//! fallback chain each codec would start with.
//!
//! Usage: opennow-pipeline [config.json]

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::PathBuf;

use opennow_pipeline::media::{detect_gpu, select_backends, Platform, SelectionInput};
use opennow_pipeline::{profiling, PipelineConfig, VideoCodec};

fn main() -> Result<()> {
    // Returns true if it initialized logging (we should skip env_logger)
    let profiling_initialized_logging = profiling::init();

    if !profiling_initialized_logging {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    }

    info!("OpenNow Pipeline v{}", env!("CARGO_PKG_VERSION"));
    info!("Platform: {}", std::env::consts::OS);

    #[cfg(feature = "tracy")]
    info!("Tracy profiler ENABLED - connect with Tracy Profiler application");

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => PipelineConfig::load_from(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => PipelineConfig::load().unwrap_or_else(|e| {
            warn!("Failed to load pipeline config: {}, using defaults", e);
            PipelineConfig::default()
        }),
    };

    let gpu = detect_gpu();
    println!(
        "GPU: {} ({:?}, {})",
        gpu.name,
        gpu.vendor,
        if gpu.discrete { "discrete" } else { "integrated" }
    );
    println!("Platform: {:?}", Platform::current());
    println!("Decoder preference: {}", config.decoder_backend.description());
    println!();

    for &codec in VideoCodec::all() {
        let selection = SelectionInput::probe(codec, config.decoder_backend);
        let chain = select_backends(&selection);
        let names: Vec<&str> = chain.iter().map(|d| d.name).collect();
        let marker = if codec == config.codec { "*" } else { " " };
        if names.is_empty() {
            println!("{} {:<6} no decoder available", marker, codec.as_str());
        } else {
            println!("{} {:<6} {}", marker, codec.as_str(), names.join(" -> "));
        }
    }

    Ok(())
}
